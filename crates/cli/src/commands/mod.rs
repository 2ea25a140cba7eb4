//! Cart commands.
//!
//! Each invocation restores the session first (guest snapshot or server
//! cart), runs one engine operation and prints the resulting cart.

use naked_pineapple_cart::{CartConfig, CartContext, CartError, TransitionOutcome};
use naked_pineapple_core::{CartLine, CurrencyCode, IdentityContext, LineError, Price, VariantId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors that can occur while running a command.
#[derive(Debug, Error)]
pub enum CliError {
    /// Engine operation failed.
    #[error("{}", .0.customer_message())]
    Cart(#[from] CartError),

    /// Invalid line arguments.
    #[error("Invalid line: {0}")]
    Line(#[from] LineError),

    /// Unknown currency code.
    #[error("Unknown currency: {0}. Valid currencies: USD, EUR, GBP, CAD, AUD")]
    InvalidCurrency(String),
}

/// One restored cart session.
pub struct Session {
    cart: CartContext,
}

impl Session {
    /// Build the engine from config and restore the cart for `user` (or the
    /// guest snapshot).
    pub async fn open(config: &CartConfig, session_id: &str, user: Option<&str>) -> Result<Self, CliError> {
        let cart = CartContext::from_config(config, session_id)?;
        let identity = user.map_or(IdentityContext::Guest, IdentityContext::authenticated);
        let outcome = cart.load(identity).await?;
        tracing::debug!(?outcome, "Session restored");
        Ok(Self { cart })
    }

    #[allow(clippy::print_stdout)]
    pub fn show(&self) {
        println!("Cart ({})", self.cart.identity());
        let lines = self.cart.lines();
        if lines.is_empty() {
            println!("  (empty)");
            return;
        }
        for line in &lines {
            println!(
                "  {:<16} {:<24} {:>4} x {:>10} = {:>10}{}",
                line.variant_id(),
                line.product_name(),
                line.quantity(),
                line.unit_price().to_string(),
                line.line_total().to_string(),
                line.stock()
                    .map(|s| format!("  ({s} in stock)"))
                    .unwrap_or_default(),
            );
        }
        println!("  {} item(s), total {}", self.cart.item_count(), self.cart.total_price());
    }

    pub async fn add(
        &self,
        variant: &str,
        product: &str,
        name: &str,
        price: Decimal,
        currency: &str,
        quantity: u32,
    ) -> Result<(), CliError> {
        let currency: CurrencyCode = currency
            .parse()
            .map_err(|_| CliError::InvalidCurrency(currency.to_string()))?;
        let line = CartLine::new(variant, product, name, Price::new(price, currency), quantity)?;
        self.cart.add_item(line).await?;
        self.show();
        Ok(())
    }

    pub async fn remove(&self, variant: &str) -> Result<(), CliError> {
        self.cart.remove_item(&VariantId::new(variant)).await?;
        self.show();
        Ok(())
    }

    pub async fn update(&self, variant: &str, quantity: i64) -> Result<(), CliError> {
        self.cart
            .update_quantity(&VariantId::new(variant), quantity)
            .await?;
        self.show();
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), CliError> {
        self.cart.clear_cart().await?;
        self.show();
        Ok(())
    }

    #[allow(clippy::print_stdout)]
    pub async fn login(&self, user: &str) -> Result<(), CliError> {
        match self.cart.transition(IdentityContext::authenticated(user)).await? {
            TransitionOutcome::Merged { merged_lines } => {
                println!("Guest cart merged ({merged_lines} line(s) in your cart)");
            }
            TransitionOutcome::Unchanged => println!("Already signed in as {user}"),
            _ => {}
        }
        self.show();
        Ok(())
    }

    #[allow(clippy::print_stdout)]
    pub async fn logout(&self) -> Result<(), CliError> {
        if let TransitionOutcome::LoggedOut {
            remote_clear: Some(handle),
        } = self.cart.transition(IdentityContext::Guest).await?
        {
            // The process exits next, so wait for the background clear here
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Server cart clear task failed");
            }
        }
        println!("Signed out");
        Ok(())
    }

    #[allow(clippy::print_stdout)]
    pub async fn checkout(&self, accept: bool) -> Result<(), CliError> {
        let review = self.cart.prepare_checkout().await?;
        for notice in review.notices() {
            println!("  ! {notice}");
        }
        let total = review.total();
        let lines = review.proceed(accept)?;

        println!("Checking out {} line(s), total {total}", lines.len());
        self.cart.complete_checkout().await;
        Ok(())
    }
}

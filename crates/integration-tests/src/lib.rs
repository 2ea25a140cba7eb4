//! Integration tests for the Naked Pineapple cart engine.
//!
//! # Running Tests
//!
//! ```bash
//! # Engine scenarios (in-memory backends, no services needed)
//! cargo test -p naked-pineapple-integration-tests
//!
//! # HTTP client tests against a running cart API
//! CART_API_URL=http://localhost:3000/api cargo test -p naked-pineapple-integration-tests -- --ignored
//! ```
//!
//! # Test Categories
//!
//! - `cart_mutations` - Optimistic add/remove/update/clear and rollback
//! - `cart_merge` - Login merge, logout and session restore
//! - `cart_checkout` - Catalog reconciliation before checkout
//! - `http_clients` - REST clients against a live service (ignored by default)

use std::sync::Arc;
use std::time::Duration;

use naked_pineapple_cart::CartContext;
use naked_pineapple_cart::persistence::{
    InMemoryCartService, InMemoryCatalog, LineInput, LocalStore, MemoryLocalStore,
};
use naked_pineapple_core::{CartLine, CurrencyCode, IdentityContext, Price, ProductId, UserId, VariantId};

/// Customer used by the scenarios.
pub const CUSTOMER: &str = "customer-42";

/// A cart wired to in-memory backends, with handles to inspect each one.
pub struct TestCart {
    pub cart: CartContext,
    pub local: Arc<MemoryLocalStore>,
    pub remote: Arc<InMemoryCartService>,
    pub catalog: Arc<InMemoryCatalog>,
}

impl Default for TestCart {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCart {
    /// Catalog: `V1` tee 20.00 (stock 10), `V2` hat 15.00 (stock 2), `V3`
    /// mug 9.00 (stock 5).
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(2))
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.upsert("V1", "P1", "Pineapple Tee", usd(2000), 10);
        catalog.upsert("V2", "P2", "Pineapple Hat", usd(1500), 2);
        catalog.upsert("V3", "P3", "Pineapple Mug", usd(900), 5);

        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(InMemoryCartService::new(catalog.clone()));
        let cart = CartContext::new(local.clone(), remote.clone(), catalog.clone(), timeout);

        Self {
            cart,
            local,
            remote,
            catalog,
        }
    }

    /// Log in as [`CUSTOMER`], panicking on failure.
    pub async fn login(&self) {
        self.cart
            .transition(IdentityContext::authenticated(CUSTOMER))
            .await
            .expect("login failed");
    }

    /// Seed the customer's server cart.
    pub fn seed_remote(&self, lines: &[(&str, u32)]) {
        let inputs: Vec<LineInput> = lines
            .iter()
            .map(|(variant, quantity)| LineInput {
                product_id: ProductId::new(format!("P{}", variant.trim_start_matches('V'))),
                variant_id: VariantId::new(*variant),
                quantity: *quantity,
                metadata: None,
            })
            .collect();
        self.remote
            .seed(&customer(), &inputs)
            .expect("seeding remote cart failed");
    }

    /// `(variant, quantity)` pairs of the server cart.
    #[must_use]
    pub fn remote_quantities(&self) -> Vec<(String, u32)> {
        self.remote
            .lines_for(&customer())
            .into_iter()
            .map(|l| (l.variant_id.into_inner(), l.quantity))
            .collect()
    }

    /// `(variant, quantity)` pairs of the in-memory cart.
    #[must_use]
    pub fn quantities(&self) -> Vec<(String, u32)> {
        quantities(&self.cart.lines())
    }

    /// `(variant, quantity)` pairs of the local snapshot.
    pub async fn local_quantities(&self) -> Vec<(String, u32)> {
        quantities(&self.local.load().await.expect("local snapshot unreadable"))
    }
}

#[must_use]
pub fn customer() -> UserId {
    UserId::new(CUSTOMER)
}

#[must_use]
pub fn usd(cents: i64) -> Price {
    Price::from_minor(cents, CurrencyCode::USD)
}

/// A line as a product page would submit it, with a client-side price
/// snapshot of 1.00.
#[must_use]
pub fn line(variant: &str, quantity: u32) -> CartLine {
    let product = format!("P{}", variant.trim_start_matches('V'));
    CartLine::new(variant, product, format!("Item {variant}"), usd(100), quantity)
        .expect("invalid test line")
}

#[must_use]
pub fn quantities(lines: &[CartLine]) -> Vec<(String, u32)> {
    lines
        .iter()
        .map(|l| (l.variant_id().to_string(), l.quantity()))
        .collect()
}

/// Build the expected `(variant, quantity)` list.
#[must_use]
pub fn expected(pairs: &[(&str, u32)]) -> Vec<(String, u32)> {
    pairs.iter().map(|(v, q)| ((*v).to_string(), *q)).collect()
}

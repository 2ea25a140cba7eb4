//! Pre-checkout verification.
//!
//! [`CartContext::prepare_checkout`] refreshes every line from the catalog,
//! writes the corrections into the cart and hands back a [`CheckoutReview`].
//! The review refuses to proceed while corrections are unacknowledged.

use tracing::{debug, info, instrument, warn};

use naked_pineapple_core::{Cart, CartLine, IdentityContext, Price, UserId, VariantId};

use crate::context::CartContext;
use crate::enrichment::{LineNotice, NoticeKind, Verification};
use crate::error::{CartError, add_breadcrumb, report};
use crate::persistence::with_timeout;

/// Verified cart contents awaiting the customer's go-ahead.
#[derive(Debug, Clone)]
pub struct CheckoutReview {
    lines: Vec<CartLine>,
    notices: Vec<LineNotice>,
    changed: bool,
    total: Price,
}

impl CheckoutReview {
    #[must_use]
    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    /// Corrections applied during verification.
    #[must_use]
    pub fn notices(&self) -> &[LineNotice] {
        &self.notices
    }

    /// Returns true if verification changed the cart.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.changed
    }

    #[must_use]
    pub const fn total(&self) -> Price {
        self.total
    }

    /// Variants dropped because the catalog no longer lists them.
    #[must_use]
    pub fn unavailable(&self) -> Vec<VariantId> {
        self.notices
            .iter()
            .filter(|n| n.kind == NoticeKind::ItemUnavailable)
            .map(|n| n.variant_id.clone())
            .collect()
    }

    /// Returns true if the customer must acknowledge the corrections.
    #[must_use]
    pub const fn requires_confirmation(&self) -> bool {
        self.changed
    }

    /// Continue to checkout with the verified lines.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::CatalogDrift`] if the cart changed and the
    /// customer has not acknowledged it.
    pub fn proceed(self, acknowledged: bool) -> Result<Vec<CartLine>, CartError> {
        if self.changed && !acknowledged {
            return Err(CartError::CatalogDrift {
                notices: self.notices,
            });
        }
        Ok(self.lines)
    }
}

impl CartContext {
    /// Verify the cart against the catalog before checkout.
    ///
    /// Corrections (dropped lines, new prices, lowered quantities) are applied
    /// to the cart and persisted: guests rewrite the snapshot, customers get a
    /// best-effort request per dropped or lowered line, sent the same way as a
    /// cart mutation. A line the customer changed while verification was
    /// running keeps the customer's value.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::CatalogUnavailable`] if the catalog could not be
    /// reached; checkout must not continue.
    #[instrument(skip(self))]
    pub async fn prepare_checkout(&self) -> Result<CheckoutReview, CartError> {
        let (lines, epoch) = {
            let state = self.lock_state();
            (state.cart.lines().to_vec(), state.epoch)
        };

        let enrichment = self.inner.enrichment.enrich(&lines).await;
        if let Verification::Unverified { reason } = enrichment.verification {
            let err = CartError::CatalogUnavailable(reason);
            report(&err);
            return Err(err);
        }

        if enrichment.changed {
            info!(notices = enrichment.notices.len(), "Catalog changed the cart");
            let identity = self.apply_corrections(&lines, &enrichment.lines, epoch);
            match identity {
                Some((IdentityContext::Guest, _)) => self.persist_guest_snapshot(epoch).await,
                Some((IdentityContext::Authenticated { user_id }, corrected)) => {
                    self.push_corrections(&user_id, epoch, corrected).await;
                }
                None => debug!("Identity changed during verification; corrections not applied"),
            }
        }

        let total = Cart::from_lines(enrichment.lines.iter().cloned())?.total_price();

        add_breadcrumb("checkout", "verified", None);
        Ok(CheckoutReview {
            lines: enrichment.lines,
            notices: enrichment.notices,
            changed: enrichment.changed,
            total,
        })
    }

    /// Write verified lines into the cart.
    ///
    /// Only lines still holding the quantity that was verified are touched.
    /// Returns the variants whose quantity changed with the mutation sequence
    /// issued for each, or `None` if the identity changed meanwhile.
    fn apply_corrections(
        &self,
        verified_from: &[CartLine],
        corrected: &[CartLine],
        epoch: u64,
    ) -> Option<(IdentityContext, Vec<(VariantId, u64)>)> {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return None;
        }

        let mut changed = Vec::new();
        for before in verified_from {
            let variant_id = before.variant_id();
            let untouched = state
                .cart
                .get(variant_id)
                .is_some_and(|current| current.quantity() == before.quantity());
            if !untouched {
                continue;
            }

            let quantity_changed = match corrected.iter().find(|l| l.variant_id() == variant_id) {
                None => state.cart.remove(variant_id).is_some(),
                Some(after) => {
                    let Some(line) = state.cart.get_mut(variant_id) else {
                        continue;
                    };
                    if line.set_unit_price(after.unit_price()).is_err() {
                        continue;
                    }
                    if let Some(stock) = after.stock() {
                        line.set_stock(stock);
                    }
                    after.quantity() != before.quantity() && line.set_quantity(after.quantity()).is_ok()
                }
            };

            // Price and stock refreshes leave pending mutations in charge
            if quantity_changed {
                let seq = state.next_seq();
                state.bump_revision(variant_id, seq);
                state.mark_set(variant_id, seq);
                changed.push((variant_id.clone(), seq));
            }
        }

        Some((state.identity.clone(), changed))
    }

    /// Send each corrected line's new quantity, waiting out any request for
    /// the same variant. Failures are logged.
    async fn push_corrections(&self, user_id: &UserId, epoch: u64, corrected: Vec<(VariantId, u64)>) {
        for (variant_id, seq) in corrected {
            let _guard = self.lock_variant(&variant_id).await;
            if let Err(e) = self
                .push_variant(user_id, &variant_id, epoch, Some(seq), false)
                .await
            {
                warn!(error = %e, %variant_id, "Failed to persist checkout correction");
            }
        }
    }

    /// Empty the cart after a successful order.
    ///
    /// Clears memory and the guest snapshot; the server cart is cleared on a
    /// best-effort basis. Mutations still in flight are not persisted.
    #[instrument(skip(self))]
    pub async fn complete_checkout(&self) {
        let user_id = {
            let mut state = self.lock_state();
            state.forget();
            state.advance_epoch();
            state.identity.user_id().cloned()
        };

        self.clear_local_snapshot().await;

        if let Some(user_id) = user_id {
            if let Err(e) = with_timeout(self.inner.request_timeout, self.inner.remote.clear(&user_id)).await {
                warn!(error = %e, user_id = %user_id, "Failed to clear server cart after checkout");
            }
        }

        add_breadcrumb("checkout", "completed", None);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use naked_pineapple_core::CurrencyCode;

    use super::*;
    use crate::persistence::{InMemoryCartService, InMemoryCatalog, LocalStore, MemoryLocalStore};

    fn line(variant: &str, quantity: u32) -> CartLine {
        CartLine::new(variant, "p-1", "Tee", Price::from_minor(1000, CurrencyCode::USD), quantity).unwrap()
    }

    fn guest_context() -> (CartContext, Arc<InMemoryCatalog>, Arc<MemoryLocalStore>) {
        let catalog = Arc::new(InMemoryCatalog::new());
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(InMemoryCartService::new(catalog.clone()));
        let ctx = CartContext::new(local.clone(), remote, catalog.clone(), Duration::from_secs(1));
        (ctx, catalog, local)
    }

    #[test]
    fn test_proceed_requires_acknowledgement() {
        let review = CheckoutReview {
            lines: vec![line("v-1", 1)],
            notices: vec![LineNotice {
                variant_id: VariantId::new("v-1"),
                product_name: "Tee".to_string(),
                kind: NoticeKind::QuantityAdjusted { from: 3, to: 1 },
            }],
            changed: true,
            total: Price::from_minor(1000, CurrencyCode::USD),
        };
        assert!(review.requires_confirmation());
        assert!(matches!(
            review.clone().proceed(false),
            Err(CartError::CatalogDrift { .. })
        ));
        assert_eq!(review.proceed(true).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_guest_corrections_are_saved() {
        let (ctx, catalog, local) = guest_context();
        catalog.upsert("v-1", "p-1", "Tee", Price::from_minor(1000, CurrencyCode::USD), 2);
        ctx.add_item(line("v-1", 5)).await.unwrap();

        let review = ctx.prepare_checkout().await.unwrap();
        assert!(review.changed());
        assert_eq!(review.total(), Price::from_minor(2000, CurrencyCode::USD));
        assert_eq!(ctx.lines()[0].quantity(), 2);
        assert_eq!(local.load().await.unwrap()[0].quantity(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_lists_dropped_lines() {
        let (ctx, catalog, _) = guest_context();
        catalog.upsert("v-1", "p-1", "Tee", Price::from_minor(1000, CurrencyCode::USD), 9);
        ctx.add_item(line("v-1", 1)).await.unwrap();
        ctx.add_item(line("v-3", 1)).await.unwrap();

        let review = ctx.prepare_checkout().await.unwrap();
        assert_eq!(review.unavailable(), vec![VariantId::new("v-3")]);
        assert_eq!(ctx.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_checkout_empties_cart() {
        let (ctx, _, local) = guest_context();
        ctx.add_item(line("v-1", 1)).await.unwrap();
        ctx.complete_checkout().await;
        assert!(ctx.lines().is_empty());
        assert!(local.is_empty());
    }
}

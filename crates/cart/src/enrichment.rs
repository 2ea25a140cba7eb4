//! Catalog reconciliation before checkout.
//!
//! Prices and stock change independently of carts, so every line is checked
//! against the live catalog with one batched request right before checkout.
//! The result is a corrected set of lines plus a notice per correction; the
//! caller has to show those to the customer before continuing.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use naked_pineapple_core::{CartLine, Price, VariantId};

use crate::persistence::{CatalogEntry, CatalogService, RemoteError, with_timeout};

/// Kind of correction applied to a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// The catalog no longer lists the variant; the line was dropped.
    ItemUnavailable,
    /// The unit price moved.
    PriceChanged { from: Price, to: Price },
    /// The quantity exceeded stock and was lowered (`to == 0` drops the line).
    QuantityAdjusted { from: u32, to: u32 },
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ItemUnavailable => f.write_str("item no longer available"),
            Self::PriceChanged { .. } => f.write_str("price changed"),
            Self::QuantityAdjusted { .. } => f.write_str("quantity adjusted"),
        }
    }
}

/// A customer-visible correction to one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNotice {
    pub variant_id: VariantId,
    pub product_name: String,
    pub kind: NoticeKind,
}

impl fmt::Display for LineNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.product_name, self.kind)
    }
}

/// Whether the lines were checked against the catalog.
#[derive(Debug)]
pub enum Verification {
    Verified,
    /// The catalog could not be reached; lines are returned unchanged.
    Unverified { reason: RemoteError },
}

/// Outcome of [`EnrichmentService::enrich`].
#[derive(Debug)]
pub struct Enrichment {
    /// Corrected lines, in the original order.
    pub lines: Vec<CartLine>,
    /// True if any correction was applied.
    pub changed: bool,
    pub notices: Vec<LineNotice>,
    pub verification: Verification,
}

impl Enrichment {
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        matches!(self.verification, Verification::Verified)
    }
}

/// Refreshes cart lines from the catalog.
#[derive(Clone)]
pub struct EnrichmentService {
    catalog: Arc<dyn CatalogService>,
    timeout: Duration,
}

impl fmt::Debug for EnrichmentService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrichmentService")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EnrichmentService {
    #[must_use]
    pub fn new(catalog: Arc<dyn CatalogService>, timeout: Duration) -> Self {
        Self { catalog, timeout }
    }

    /// Reconcile `lines` against the catalog.
    ///
    /// Issues exactly one batch request for the distinct variants (none for
    /// an empty cart). A failed or timed out request returns the lines
    /// unchanged and [`Verification::Unverified`].
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn enrich(&self, lines: &[CartLine]) -> Enrichment {
        if lines.is_empty() {
            return Enrichment {
                lines: Vec::new(),
                changed: false,
                notices: Vec::new(),
                verification: Verification::Verified,
            };
        }

        let mut seen = HashSet::new();
        let variant_ids: Vec<VariantId> = lines
            .iter()
            .map(CartLine::variant_id)
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect();

        match with_timeout(self.timeout, self.catalog.batch(&variant_ids)).await {
            Ok(entries) => {
                let (corrected, notices) = reconcile(lines, &entries);
                debug!(notices = notices.len(), "Cart reconciled with catalog");
                Enrichment {
                    lines: corrected,
                    changed: !notices.is_empty(),
                    notices,
                    verification: Verification::Verified,
                }
            }
            Err(e) => {
                warn!(error = %e, "Catalog verification failed");
                Enrichment {
                    lines: lines.to_vec(),
                    changed: false,
                    notices: Vec::new(),
                    verification: Verification::Unverified { reason: e },
                }
            }
        }
    }
}

/// Apply catalog entries to lines.
///
/// - variant missing from `entries`: line dropped
/// - price differs: price replaced
/// - stock always refreshed; a quantity above stock is lowered to it, and a
///   line lowered to zero is dropped
///
/// Never raises a quantity.
#[must_use]
pub fn reconcile(lines: &[CartLine], entries: &[CatalogEntry]) -> (Vec<CartLine>, Vec<LineNotice>) {
    let by_variant: HashMap<&VariantId, &CatalogEntry> =
        entries.iter().map(|e| (&e.variant_id, e)).collect();

    let mut corrected = Vec::with_capacity(lines.len());
    let mut notices = Vec::new();

    for line in lines {
        let notice = |kind| LineNotice {
            variant_id: line.variant_id().clone(),
            product_name: line.product_name().to_string(),
            kind,
        };

        let Some(entry) = by_variant.get(line.variant_id()) else {
            notices.push(notice(NoticeKind::ItemUnavailable));
            continue;
        };

        let mut line = line.clone();
        let current = entry.current_price();
        if current != line.unit_price() {
            let from = line.unit_price();
            if line.set_unit_price(current).is_err() {
                warn!(variant_id = %entry.variant_id, "Catalog returned a negative price");
                notices.push(notice(NoticeKind::ItemUnavailable));
                continue;
            }
            notices.push(notice(NoticeKind::PriceChanged { from, to: current }));
        }

        line.set_stock(entry.stock);
        let quantity = line.quantity();
        if quantity > entry.stock {
            notices.push(notice(NoticeKind::QuantityAdjusted {
                from: quantity,
                to: entry.stock,
            }));
            if line.set_quantity(entry.stock).is_err() {
                continue;
            }
        }

        corrected.push(line);
    }

    (corrected, notices)
}

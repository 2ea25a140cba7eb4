//! In-memory cart service and catalog.
//!
//! These follow the same server-side rules as the real services (merge by
//! variant on create and sync, catalog pricing, idempotent deletes) so the
//! engine can be exercised without a network.
//!
//! ## Failure injection
//!
//! - [`InMemoryCartService::fail_next`] fails the next call of one kind
//! - [`InMemoryCartService::hang_next`] makes the next call of one kind never
//!   complete (the engine's timeout turns it into a failure)
//! - [`InMemoryCartService::delay_next`] holds the next call of one kind for
//!   a while before answering
//! - [`InMemoryCartService::set_fail_all`] fails every call
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: state is process-local
//! - **No persistence**: all state is lost when the process exits

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use naked_pineapple_core::{LineId, Price, ProductId, UserId, VariantId};

use super::wire::{CatalogEntry, LineInput, RemoteLine};
use super::{CatalogService, RemoteCartService, RemoteError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remote cart operations, for failure injection and call recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Fetch,
    Create,
    Update,
    Delete,
    Sync,
    Clear,
}

// =============================================================================
// InMemoryCatalog
// =============================================================================

/// A catalog product record.
#[derive(Debug, Clone)]
struct CatalogRecord {
    product_id: ProductId,
    product_name: String,
    price: Price,
    stock: u32,
}

/// In-memory catalog with request counting.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    records: Mutex<HashMap<VariantId, CatalogRecord>>,
    batch_calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a variant.
    pub fn upsert(
        &self,
        variant_id: impl Into<VariantId>,
        product_id: impl Into<ProductId>,
        product_name: impl Into<String>,
        price: Price,
        stock: u32,
    ) {
        lock(&self.records).insert(
            variant_id.into(),
            CatalogRecord {
                product_id: product_id.into(),
                product_name: product_name.into(),
                price,
                stock,
            },
        );
    }

    /// Change a variant's price. Unknown variants are ignored.
    pub fn set_price(&self, variant_id: &VariantId, price: Price) {
        if let Some(record) = lock(&self.records).get_mut(variant_id) {
            record.price = price;
        }
    }

    /// Change a variant's stock. Unknown variants are ignored.
    pub fn set_stock(&self, variant_id: &VariantId, stock: u32) {
        if let Some(record) = lock(&self.records).get_mut(variant_id) {
            record.stock = stock;
        }
    }

    /// Remove a variant from the catalog.
    pub fn discontinue(&self, variant_id: &VariantId) {
        lock(&self.records).remove(variant_id);
    }

    /// Fail the next batch request.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of batch requests served (including failed ones).
    #[must_use]
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn record(&self, variant_id: &VariantId) -> Option<CatalogRecord> {
        lock(&self.records).get(variant_id).cloned()
    }
}

#[async_trait]
impl CatalogService for InMemoryCatalog {
    async fn batch(&self, variant_ids: &[VariantId]) -> Result<Vec<CatalogEntry>, RemoteError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("injected catalog failure".to_string()));
        }

        let records = lock(&self.records);
        let mut seen = HashSet::new();
        Ok(variant_ids
            .iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| {
                records.get(id).map(|record| CatalogEntry {
                    variant_id: id.clone(),
                    price: record.price.amount,
                    currency_code: record.price.currency_code,
                    stock: record.stock,
                })
            })
            .collect())
    }
}

// =============================================================================
// InMemoryCartService
// =============================================================================

#[derive(Debug, Default)]
struct FailurePlan {
    fail_next: HashSet<RemoteOp>,
    hang_next: HashSet<RemoteOp>,
    delay_next: HashMap<RemoteOp, Duration>,
}

/// In-memory remote cart service.
///
/// New lines are priced from the shared [`InMemoryCatalog`], never from the
/// request.
#[derive(Debug)]
pub struct InMemoryCartService {
    catalog: Arc<InMemoryCatalog>,
    carts: Mutex<HashMap<UserId, Vec<RemoteLine>>>,
    next_line: AtomicU64,
    plan: Mutex<FailurePlan>,
    fail_all: AtomicBool,
    calls: Mutex<Vec<RemoteOp>>,
}

impl InMemoryCartService {
    /// Create a service pricing lines from `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<InMemoryCatalog>) -> Self {
        Self {
            catalog,
            carts: Mutex::new(HashMap::new()),
            next_line: AtomicU64::new(1),
            plan: Mutex::new(FailurePlan::default()),
            fail_all: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next call of `op` (single-shot).
    pub fn fail_next(&self, op: RemoteOp) {
        lock(&self.plan).fail_next.insert(op);
    }

    /// Never complete the next call of `op` (single-shot).
    pub fn hang_next(&self, op: RemoteOp) {
        lock(&self.plan).hang_next.insert(op);
    }

    /// Hold the next call of `op` for `delay` before answering (single-shot).
    pub fn delay_next(&self, op: RemoteOp, delay: Duration) {
        lock(&self.plan).delay_next.insert(op, delay);
    }

    /// Fail every call until turned off.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Every call received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteOp> {
        lock(&self.calls).clone()
    }

    /// Number of calls of one kind received.
    #[must_use]
    pub fn call_count(&self, op: RemoteOp) -> usize {
        lock(&self.calls).iter().filter(|c| **c == op).count()
    }

    /// Current server-side lines for a user.
    #[must_use]
    pub fn lines_for(&self, user: &UserId) -> Vec<RemoteLine> {
        lock(&self.carts).get(user).cloned().unwrap_or_default()
    }

    /// Seed a user's cart directly, priced from the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::NotFound`] if a variant is not in the catalog.
    pub fn seed(&self, user: &UserId, lines: &[LineInput]) -> Result<(), RemoteError> {
        let mut carts = lock(&self.carts);
        let cart = carts.entry(user.clone()).or_default();
        for input in lines {
            self.merge_input(cart, input)?;
        }
        Ok(())
    }

    /// Record the call and apply any injected failure.
    async fn enter(&self, op: RemoteOp) -> Result<(), RemoteError> {
        lock(&self.calls).push(op);

        let (fail, hang, delay) = {
            let mut plan = lock(&self.plan);
            (
                plan.fail_next.remove(&op),
                plan.hang_next.remove(&op),
                plan.delay_next.remove(&op),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if hang {
            std::future::pending::<()>().await;
        }
        if fail || self.fail_all.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    /// Sum into the variant's line, or create one priced from the catalog.
    fn merge_input(&self, cart: &mut Vec<RemoteLine>, input: &LineInput) -> Result<RemoteLine, RemoteError> {
        if let Some(existing) = cart.iter_mut().find(|l| l.variant_id == input.variant_id) {
            existing.quantity = existing.quantity.saturating_add(input.quantity);
            if let Some(record) = self.catalog.record(&input.variant_id) {
                existing.unit_price = record.price.amount;
                existing.currency_code = record.price.currency_code;
                existing.stock = Some(record.stock);
            }
            return Ok(existing.clone());
        }

        let record = self
            .catalog
            .record(&input.variant_id)
            .ok_or_else(|| RemoteError::NotFound(format!("variant {}", input.variant_id)))?;

        let line = RemoteLine {
            id: LineId::new(format!("line-{}", self.next_line.fetch_add(1, Ordering::SeqCst))),
            product_id: record.product_id,
            variant_id: input.variant_id.clone(),
            product_name: record.product_name,
            unit_price: record.price.amount,
            currency_code: record.price.currency_code,
            quantity: input.quantity,
            stock: Some(record.stock),
            metadata: input.metadata.clone().unwrap_or_default(),
        };
        cart.push(line.clone());
        Ok(line)
    }
}

#[async_trait]
impl RemoteCartService for InMemoryCartService {
    async fn fetch(&self, user: &UserId) -> Result<Vec<RemoteLine>, RemoteError> {
        self.enter(RemoteOp::Fetch).await?;
        Ok(self.lines_for(user))
    }

    async fn create_line(&self, user: &UserId, input: &LineInput) -> Result<RemoteLine, RemoteError> {
        self.enter(RemoteOp::Create).await?;
        if input.quantity == 0 {
            return Err(RemoteError::Status {
                status: 422,
                body: "quantity must be positive".to_string(),
            });
        }
        let mut carts = lock(&self.carts);
        let cart = carts.entry(user.clone()).or_default();
        self.merge_input(cart, input)
    }

    async fn update_quantity(
        &self,
        user: &UserId,
        line_id: &LineId,
        quantity: u32,
    ) -> Result<RemoteLine, RemoteError> {
        self.enter(RemoteOp::Update).await?;
        if quantity == 0 {
            return Err(RemoteError::Status {
                status: 422,
                body: "quantity must be positive".to_string(),
            });
        }
        let mut carts = lock(&self.carts);
        let line = carts
            .get_mut(user)
            .and_then(|cart| cart.iter_mut().find(|l| &l.id == line_id))
            .ok_or_else(|| RemoteError::NotFound(format!("line {line_id}")))?;
        line.quantity = quantity;
        Ok(line.clone())
    }

    async fn delete_line(&self, user: &UserId, line_id: &LineId) -> Result<(), RemoteError> {
        self.enter(RemoteOp::Delete).await?;
        if let Some(cart) = lock(&self.carts).get_mut(user) {
            cart.retain(|l| &l.id != line_id);
        }
        Ok(())
    }

    async fn sync(&self, user: &UserId, lines: &[LineInput]) -> Result<Vec<RemoteLine>, RemoteError> {
        self.enter(RemoteOp::Sync).await?;
        let mut carts = lock(&self.carts);
        // All-or-nothing: merge into a copy and only publish if every line merged.
        let mut merged = carts.get(user).cloned().unwrap_or_default();
        for input in lines.iter().filter(|l| l.quantity > 0) {
            match self.merge_input(&mut merged, input) {
                Ok(_) => {}
                Err(RemoteError::NotFound(_)) => {
                    tracing::debug!(variant_id = %input.variant_id, "Skipping unknown variant in sync");
                }
                Err(e) => return Err(e),
            }
        }
        carts.insert(user.clone(), merged.clone());
        Ok(merged)
    }

    async fn clear(&self, user: &UserId) -> Result<(), RemoteError> {
        self.enter(RemoteOp::Clear).await?;
        lock(&self.carts).remove(user);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use naked_pineapple_core::CurrencyCode;

    use super::*;

    fn setup() -> (Arc<InMemoryCatalog>, InMemoryCartService) {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.upsert("v-1", "p-1", "Tee", Price::from_minor(2000, CurrencyCode::USD), 10);
        catalog.upsert("v-2", "p-2", "Hat", Price::from_minor(1500, CurrencyCode::USD), 3);
        let service = InMemoryCartService::new(Arc::clone(&catalog));
        (catalog, service)
    }

    fn input(variant: &str, quantity: u32) -> LineInput {
        LineInput {
            product_id: ProductId::new("p-1"),
            variant_id: VariantId::new(variant),
            quantity,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_create_sums_existing_variant() {
        let (_, service) = setup();
        let user = UserId::new("u-1");
        let first = service.create_line(&user, &input("v-1", 2)).await.unwrap();
        let second = service.create_line(&user, &input("v-1", 3)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.quantity, 5);
        assert_eq!(service.lines_for(&user).len(), 1);
    }

    #[tokio::test]
    async fn test_create_prices_from_catalog() {
        let (catalog, service) = setup();
        catalog.set_price(&VariantId::new("v-1"), Price::from_minor(1800, CurrencyCode::USD));
        let user = UserId::new("u-1");
        let line = service.create_line(&user, &input("v-1", 1)).await.unwrap();
        assert_eq!(line.price(), Price::from_minor(1800, CurrencyCode::USD));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_, service) = setup();
        let user = UserId::new("u-1");
        let line = service.create_line(&user, &input("v-1", 1)).await.unwrap();
        service.delete_line(&user, &line.id).await.unwrap();
        service.delete_line(&user, &line.id).await.unwrap();
        assert!(service.lines_for(&user).is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_line_is_not_found() {
        let (_, service) = setup();
        let err = service
            .update_quantity(&UserId::new("u-1"), &LineId::new("nope"), 2)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sync_merges_and_skips_unknown() {
        let (_, service) = setup();
        let user = UserId::new("u-1");
        service.seed(&user, &[input("v-1", 3)]).unwrap();
        let merged = service
            .sync(&user, &[input("v-1", 2), input("v-2", 1), input("gone", 4)])
            .await
            .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].quantity, 5);
        assert_eq!(merged[1].variant_id.as_str(), "v-2");
    }

    #[tokio::test]
    async fn test_fail_next_is_single_shot() {
        let (_, service) = setup();
        let user = UserId::new("u-1");
        service.fail_next(RemoteOp::Fetch);
        assert!(service.fetch(&user).await.is_err());
        assert!(service.fetch(&user).await.is_ok());
        assert_eq!(service.call_count(RemoteOp::Fetch), 2);
    }

    #[tokio::test]
    async fn test_catalog_batch_omits_unknown_and_counts() {
        let (catalog, _) = setup();
        let entries = catalog
            .batch(&[VariantId::new("v-1"), VariantId::new("gone"), VariantId::new("v-1")])
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(catalog.batch_calls(), 1);

        catalog.fail_next();
        assert!(catalog.batch(&[VariantId::new("v-1")]).await.is_err());
        assert_eq!(catalog.batch_calls(), 2);
    }
}

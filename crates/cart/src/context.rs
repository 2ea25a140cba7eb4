//! The cart provider.
//!
//! [`CartContext`] is an explicitly owned handle to one customer's cart. It is
//! cheap to clone (all clones share the same cart) and is the only way to
//! write to the cart: the mutation pipeline, identity transitions and
//! checkout are all methods on it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, RwLock, RwLockReadGuard};

use naked_pineapple_core::{Cart, CartLine, IdentityContext, LineId, Price, VariantId};

use crate::config::CartConfig;
use crate::enrichment::EnrichmentService;
use crate::error::CartError;
use crate::persistence::{
    CatalogService, FileLocalStore, HttpCartClient, HttpCatalogClient, LocalStore,
    RemoteCartService,
};

/// Mutable engine state, guarded by one mutex.
///
/// The lock is only ever taken for synchronous sections; it is never held
/// across an `.await`.
#[derive(Debug, Default)]
pub(crate) struct CartState {
    pub(crate) cart: Cart,
    pub(crate) identity: IdentityContext,
    /// Bumped on every identity transition and after checkout.
    pub(crate) epoch: u64,
    next_seq: u64,
    /// Sequence number of the newest mutation per variant.
    revisions: HashMap<VariantId, u64>,
    /// Sequence number of the newest mutation that set a variant's quantity
    /// outright (update, remove, clear, checkout correction).
    set_at: HashMap<VariantId, u64>,
    /// Server line ids learned from responses, kept after a line leaves the
    /// cart until the remote delete confirms.
    pub(crate) line_ids: HashMap<VariantId, LineId>,
    /// Quantity the server last acknowledged per variant. Absent means the
    /// server holds no line.
    confirmed: HashMap<VariantId, u32>,
    /// Newest mutation per variant whose quantity the server has confirmed.
    synced: HashMap<VariantId, u64>,
    /// Mutations applied but not yet settled, per variant.
    open: HashMap<VariantId, BTreeSet<u64>>,
    /// For each past epoch, the last mutation carried into the next one by a
    /// login merge.
    carried: HashMap<u64, u64>,
}

impl CartState {
    /// Issue the next mutation sequence number.
    pub(crate) const fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// The most recently issued sequence number.
    pub(crate) const fn last_seq(&self) -> u64 {
        self.next_seq
    }

    /// Record `seq` as the newest mutation of `variant_id`, returning the
    /// revision it replaces.
    pub(crate) fn bump_revision(&mut self, variant_id: &VariantId, seq: u64) -> Option<u64> {
        self.revisions.insert(variant_id.clone(), seq)
    }

    /// Put back a revision replaced by a rolled back mutation.
    pub(crate) fn restore_revision(&mut self, variant_id: &VariantId, prior: Option<u64>) {
        match prior {
            Some(seq) => {
                self.revisions.insert(variant_id.clone(), seq);
            }
            None => {
                self.revisions.remove(variant_id);
            }
        }
    }

    pub(crate) fn revision(&self, variant_id: &VariantId) -> Option<u64> {
        self.revisions.get(variant_id).copied()
    }

    /// Record that mutation `seq` replaced the variant's quantity outright.
    pub(crate) fn mark_set(&mut self, variant_id: &VariantId, seq: u64) {
        self.set_at.insert(variant_id.clone(), seq);
    }

    /// Returns true if a mutation newer than `seq` set the quantity outright.
    pub(crate) fn set_after(&self, variant_id: &VariantId, seq: u64) -> bool {
        self.set_at.get(variant_id).is_some_and(|set| *set > seq)
    }

    /// Best known server line id for a variant.
    pub(crate) fn known_line_id(&self, variant_id: &VariantId) -> Option<LineId> {
        self.cart
            .get(variant_id)
            .and_then(CartLine::line_id)
            .or_else(|| self.line_ids.get(variant_id))
            .cloned()
    }

    /// Forget a server line id everywhere it is recorded.
    pub(crate) fn forget_line_id(&mut self, variant_id: &VariantId, line_id: &LineId) {
        if self.line_ids.get(variant_id) == Some(line_id) {
            self.line_ids.remove(variant_id);
        }
        if let Some(line) = self.cart.get_mut(variant_id) {
            if line.line_id() == Some(line_id) {
                line.set_line_id(None);
            }
        }
    }

    pub(crate) fn confirmed(&self, variant_id: &VariantId) -> u32 {
        self.confirmed.get(variant_id).copied().unwrap_or(0)
    }

    pub(crate) fn set_confirmed(&mut self, variant_id: &VariantId, quantity: u32) {
        if quantity == 0 {
            self.confirmed.remove(variant_id);
        } else {
            self.confirmed.insert(variant_id.clone(), quantity);
        }
    }

    /// Returns true if the server already confirmed a quantity covering
    /// mutation `seq`.
    pub(crate) fn is_synced(&self, variant_id: &VariantId, seq: u64) -> bool {
        self.synced.get(variant_id).is_some_and(|synced| *synced >= seq)
    }

    pub(crate) fn mark_synced(&mut self, variant_id: &VariantId, through: u64) {
        let synced = self.synced.entry(variant_id.clone()).or_default();
        *synced = (*synced).max(through);
    }

    /// Drop the synced mark so the next request for the variant is sent.
    pub(crate) fn unmark_synced(&mut self, variant_id: &VariantId) {
        self.synced.remove(variant_id);
    }

    pub(crate) fn open(&mut self, variant_id: &VariantId, seq: u64) {
        self.open.entry(variant_id.clone()).or_default().insert(seq);
    }

    pub(crate) fn close(&mut self, variant_id: &VariantId, seq: u64) {
        if let Some(open) = self.open.get_mut(variant_id) {
            open.remove(&seq);
            if open.is_empty() {
                self.open.remove(variant_id);
            }
        }
    }

    /// Returns true if a mutation older than `seq` is still unsettled.
    pub(crate) fn has_older_open(&self, variant_id: &VariantId, seq: u64) -> bool {
        self.open
            .get(variant_id)
            .is_some_and(|open| open.range(..seq).next().is_some())
    }

    /// Record that mutations of `epoch` up to `through` were carried into
    /// the next epoch.
    pub(crate) fn carry(&mut self, epoch: u64, through: u64) {
        self.carried.insert(epoch, through);
    }

    pub(crate) fn carried_over(&self, epoch: u64, seq: u64) -> bool {
        self.carried.get(&epoch).is_some_and(|through| seq <= *through)
    }

    /// Empty the cart and forget per-line bookkeeping.
    pub(crate) fn forget(&mut self) {
        self.cart.clear();
        self.revisions.clear();
        self.set_at.clear();
        self.line_ids.clear();
        self.confirmed.clear();
        self.synced.clear();
    }

    /// Replace the cart with canonical lines and forget per-line bookkeeping.
    pub(crate) fn reset(&mut self, lines: Vec<CartLine>) -> Result<(), CartError> {
        let cart = Cart::from_lines(lines)?;
        self.forget();
        for line in &cart {
            if let Some(line_id) = line.line_id() {
                self.line_ids.insert(line.variant_id().clone(), line_id.clone());
                self.confirmed.insert(line.variant_id().clone(), line.quantity());
            }
        }
        self.cart = cart;
        Ok(())
    }

    /// Start a new epoch: mutations issued before this point no longer
    /// persist anywhere.
    pub(crate) const fn advance_epoch(&mut self) {
        self.epoch += 1;
    }
}

/// Held while a request for one variant is in flight.
pub(crate) struct VariantGuard<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    _line: OwnedMutexGuard<()>,
}

pub(crate) struct ContextInner {
    pub(crate) local: Arc<dyn LocalStore>,
    pub(crate) remote: Arc<dyn RemoteCartService>,
    pub(crate) enrichment: EnrichmentService,
    pub(crate) request_timeout: Duration,
    pub(crate) state: Mutex<CartState>,
    /// Serializes snapshot writes so the last write always carries the
    /// newest cart.
    pub(crate) persist_lock: tokio::sync::Mutex<()>,
    /// Serializes identity transitions.
    pub(crate) transition_lock: tokio::sync::Mutex<()>,
    /// One lock per variant: at most one remote request per variant is in
    /// flight.
    pub(crate) variant_locks: Mutex<HashMap<VariantId, Arc<tokio::sync::Mutex<()>>>>,
    /// Held shared by per-variant requests and exclusively by a remote clear.
    pub(crate) sync_gate: RwLock<()>,
}

/// Shared handle to one cart.
///
/// # Example
///
/// ```rust,ignore
/// let cart = CartContext::new(local, remote, catalog, Duration::from_secs(5));
/// cart.load(IdentityContext::Guest).await?;
/// cart.add_item(line).await?;
/// println!("{} items, {}", cart.item_count(), cart.total_price());
/// ```
#[derive(Clone)]
pub struct CartContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl std::fmt::Debug for CartContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("CartContext")
            .field("identity", &state.identity)
            .field("epoch", &state.epoch)
            .field("lines", &state.cart.len())
            .finish_non_exhaustive()
    }
}

impl CartContext {
    /// Create an empty guest cart over the given backends.
    ///
    /// Every remote and catalog call is bounded by `request_timeout`.
    #[must_use]
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteCartService>,
        catalog: Arc<dyn CatalogService>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                local,
                remote,
                enrichment: EnrichmentService::new(catalog, request_timeout),
                request_timeout,
                state: Mutex::new(CartState::default()),
                persist_lock: tokio::sync::Mutex::new(()),
                transition_lock: tokio::sync::Mutex::new(()),
                variant_locks: Mutex::new(HashMap::new()),
                sync_gate: RwLock::new(()),
            }),
        }
    }

    /// Create a cart backed by the HTTP services and a per-session file
    /// store under `config.local_store_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session id is not usable as a file name or an
    /// HTTP client cannot be built.
    pub fn from_config(config: &CartConfig, session_id: &str) -> Result<Self, CartError> {
        let local = FileLocalStore::new(&config.local_store_dir, session_id)?;
        let remote = HttpCartClient::new(config)?;
        let catalog = HttpCatalogClient::new(config)?;

        tracing::debug!(
            session_id = %session_id,
            store = %local.path().display(),
            "Cart context created"
        );

        Ok(Self::new(
            Arc::new(local),
            Arc::new(remote),
            Arc::new(catalog),
            config.request_timeout,
        ))
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CartState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until no other request for `variant_id` (or a remote clear) is in
    /// flight.
    pub(crate) async fn lock_variant(&self, variant_id: &VariantId) -> VariantGuard<'_> {
        let gate = self.inner.sync_gate.read().await;
        let line = {
            let mut locks = self
                .inner
                .variant_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(variant_id.clone()).or_default())
        };
        VariantGuard {
            _gate: gate,
            _line: line.lock_owned().await,
        }
    }

    /// Current identity context.
    #[must_use]
    pub fn identity(&self) -> IdentityContext {
        self.lock_state().identity.clone()
    }

    /// Copy of the cart as it is right now (including unconfirmed changes).
    #[must_use]
    pub fn snapshot(&self) -> Cart {
        self.lock_state().cart.clone()
    }

    /// Lines of the cart, in order.
    #[must_use]
    pub fn lines(&self) -> Vec<CartLine> {
        self.lock_state().cart.lines().to_vec()
    }

    /// Sum of quantities across all lines.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.lock_state().cart.item_count()
    }

    /// Sum of `unit_price × quantity` across all lines.
    #[must_use]
    pub fn total_price(&self) -> Price {
        self.lock_state().cart.total_price()
    }

    /// Rewrite the guest snapshot with the current cart.
    ///
    /// Skipped when the identity epoch has moved past `epoch` or the cart is
    /// no longer a guest cart. Failures are logged and absorbed.
    pub(crate) async fn persist_guest_snapshot(&self, epoch: u64) {
        let _guard = self.inner.persist_lock.lock().await;
        let lines = {
            let state = self.lock_state();
            if state.epoch != epoch || !state.identity.is_guest() {
                tracing::debug!(epoch, "Skipping snapshot write for a past epoch");
                return;
            }
            state.cart.lines().to_vec()
        };

        if let Err(e) = self.inner.local.save(&lines).await {
            tracing::warn!(error = %e, lines = lines.len(), "Failed to save guest cart snapshot");
        }
    }

    /// Delete the guest snapshot. Failures are logged and absorbed.
    pub(crate) async fn clear_local_snapshot(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        if let Err(e) = self.inner.local.clear().await {
            tracing::warn!(error = %e, "Failed to clear local cart snapshot");
        }
    }

    /// Delete a leftover guest snapshot after a confirmed remote write.
    ///
    /// Skipped once the epoch has moved, since the store may by then hold a
    /// new guest session's cart.
    pub(crate) async fn clear_stale_snapshot(&self, epoch: u64) {
        let _guard = self.inner.persist_lock.lock().await;
        {
            let state = self.lock_state();
            if state.epoch != epoch || state.identity.is_guest() {
                return;
            }
        }
        if let Err(e) = self.inner.local.clear().await {
            tracing::warn!(error = %e, "Failed to clear stale guest snapshot");
        }
    }
}

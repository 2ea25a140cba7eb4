//! Optimistic mutation pipeline.
//!
//! Every mutation runs in two phases:
//!
//! 1. `begin_*` applies the change to the in-memory cart immediately and
//!    returns a [`PendingMutation`] in the [`MutationState::Applied`] state.
//! 2. [`PendingMutation::settle`] confirms it against the active backend and
//!    ends in [`MutationState::Committed`] or [`MutationState::RolledBack`].
//!
//! ```text
//! Applied ──> Awaiting ──> Committed
//!    │            └──────> RolledBack
//!    └──────────────────> Committed   (no-op)
//! ```
//!
//! # Ordering
//!
//! Mutations apply in issuance order but may be settled in any order. For a
//! signed-in customer at most one request per variant is in flight, and each
//! request carries the variant's newest in-memory quantity, so the server
//! ends up holding what memory holds. A mutation already covered by a newer
//! confirmed request settles without a call. Responses only touch auxiliary
//! fields (line id, price, name, stock).
//!
//! A failed request takes back only its own mutation:
//!
//! - the newest mutation with nothing older unsettled returns the line to the
//!   quantity the server last confirmed
//! - a mutation followed only by adds has its own change subtracted out
//! - a mutation overridden by a newer quantity set is left alone
//!
//! # Identity changes
//!
//! Mutations begun before an identity transition never write into the new
//! identity's stores. Guest changes carried into a login merge settle as
//! committed; any other change returns [`CartError::Superseded`].

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use naked_pineapple_core::{CartLine, IdentityContext, LineId, QuantityChange, UserId, VariantId};

use crate::context::{CartContext, CartState};
use crate::error::{CartError, add_breadcrumb, report};
use crate::persistence::{LineInput, RemoteError, RemoteLine, with_timeout};

/// Lifecycle of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Applied to the in-memory cart, not yet sent.
    Applied,
    /// Sent to the backend, waiting for the answer.
    Awaiting,
    /// Confirmed (or nothing needed confirming).
    Committed,
    /// Rejected; the in-memory change was undone.
    RolledBack,
}

impl MutationState {
    /// Returns true once the mutation can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Returns true if `next` is a legal successor of this state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Applied, Self::Awaiting | Self::Committed)
                | (Self::Awaiting, Self::Committed | Self::RolledBack)
        )
    }
}

/// One variant's change, kept for rollback.
#[derive(Debug, Clone)]
struct LineChange {
    /// Position of the line before the change.
    index: usize,
    /// The line before the change; for a new line, the line that was added.
    template: CartLine,
    before: u32,
    after: u32,
    prior_revision: Option<u64>,
}

impl LineChange {
    const fn variant_id(&self) -> &VariantId {
        self.template.variant_id()
    }
}

#[derive(Debug)]
enum MutationKind {
    /// Nothing changed (missing variant, unchanged quantity, empty cart).
    Noop,
    Add(LineChange),
    Remove(LineChange),
    /// `after == 0` means the line was deleted.
    Update(LineChange),
    Clear(Vec<LineChange>),
}

impl MutationKind {
    fn changes(&self) -> &[LineChange] {
        match self {
            Self::Noop => &[],
            Self::Add(change) | Self::Remove(change) | Self::Update(change) => std::slice::from_ref(change),
            Self::Clear(changes) => changes,
        }
    }
}

/// Request that brings one server line in line with memory.
#[derive(Debug)]
enum RemoteCall {
    Create(LineInput),
    Patch(LineId, u32),
    Delete(LineId),
}

/// Result of a per-variant request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pushed {
    /// The server holds the variant's in-memory quantity (or the request
    /// landed before an identity change).
    Synced,
    /// The identity changed before anything was sent.
    Stale,
}

/// An in-flight mutation.
///
/// Dropping it without settling leaves the in-memory change in place; it
/// only reaches the server if a newer request for the variant carries it.
#[derive(Debug)]
#[must_use = "a pending mutation must be settled to persist or roll back"]
pub struct PendingMutation {
    ctx: CartContext,
    id: Uuid,
    seq: u64,
    epoch: u64,
    identity: IdentityContext,
    kind: MutationKind,
    state: MutationState,
}

impl PendingMutation {
    fn new(ctx: &CartContext, state: &mut CartState, seq: u64, kind: MutationKind) -> Self {
        for change in kind.changes() {
            state.open(change.variant_id(), seq);
        }
        Self {
            ctx: ctx.clone(),
            id: Uuid::new_v4(),
            seq,
            epoch: state.epoch,
            identity: state.identity.clone(),
            kind,
            state: MutationState::Applied,
        }
    }

    fn noop(ctx: &CartContext, state: &mut CartState) -> Self {
        Self::new(ctx, state, 0, MutationKind::Noop)
    }

    /// Unique id of this mutation (for logs).
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> MutationState {
        self.state
    }

    /// Variant this mutation targets; `None` for a cart-wide clear.
    #[must_use]
    pub fn variant_id(&self) -> Option<&VariantId> {
        match &self.kind {
            MutationKind::Add(change) | MutationKind::Remove(change) | MutationKind::Update(change) => {
                Some(change.variant_id())
            }
            MutationKind::Noop | MutationKind::Clear(_) => None,
        }
    }

    /// Returns true if the mutation changed nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self.kind, MutationKind::Noop)
    }

    fn advance(&mut self, next: MutationState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            warn!(
                mutation_id = %self.id,
                from = ?self.state,
                to = ?next,
                "Ignoring invalid mutation state transition"
            );
        }
    }

    /// Confirm the mutation against the active backend.
    ///
    /// Guest carts rewrite the local snapshot (failures are logged, never
    /// returned). Authenticated carts send the variant's newest quantity; if
    /// the request fails or times out this mutation's change is taken back
    /// and the error is returned.
    ///
    /// Settling twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Network`] if the remote call failed, or
    /// [`CartError::Superseded`] if the cart was replaced by an identity
    /// change or a completed checkout before the change was saved.
    #[instrument(skip(self), fields(mutation_id = %self.id, variant_id = ?self.variant_id()))]
    pub async fn settle(&mut self) -> Result<(), CartError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if self.is_noop() {
            debug!("Nothing to confirm");
            self.advance(MutationState::Committed);
            return Ok(());
        }

        self.advance(MutationState::Awaiting);
        let result = self.confirm().await;
        self.close();

        match result {
            Ok(()) => {
                self.advance(MutationState::Committed);
                Ok(())
            }
            Err(err) => {
                self.advance(MutationState::RolledBack);
                report(&err);
                Err(err)
            }
        }
    }

    async fn confirm(&self) -> Result<(), CartError> {
        let user_id = match &self.identity {
            IdentityContext::Guest => return self.confirm_guest().await,
            IdentityContext::Authenticated { user_id } => user_id.clone(),
        };
        if let Some(outcome) = self.past_epoch() {
            return outcome;
        }

        let result = match &self.kind {
            MutationKind::Noop => Ok(()),
            MutationKind::Add(change) => self.confirm_line(&user_id, change, true).await,
            MutationKind::Remove(change) | MutationKind::Update(change) => {
                self.confirm_line(&user_id, change, false).await
            }
            MutationKind::Clear(changes) => self.confirm_clear(&user_id, changes).await,
        };
        if result.is_ok() {
            self.ctx.clear_stale_snapshot(self.epoch).await;
        }
        result
    }

    async fn confirm_guest(&self) -> Result<(), CartError> {
        // A login merge in progress decides whether this change survives
        let _transition = self.ctx.inner.transition_lock.lock().await;
        if let Some(outcome) = self.past_epoch() {
            return outcome;
        }
        self.ctx.persist_guest_snapshot(self.epoch).await;
        Ok(())
    }

    /// `Some` once the cart has moved past this mutation's epoch.
    fn past_epoch(&self) -> Option<Result<(), CartError>> {
        let state = self.ctx.lock_state();
        if state.epoch == self.epoch {
            return None;
        }
        if state.carried_over(self.epoch, self.seq) {
            debug!("Change was carried into the merged cart");
            Some(Ok(()))
        } else {
            debug!("Cart replaced before the change was saved");
            Some(Err(CartError::Superseded))
        }
    }

    async fn confirm_line(&self, user: &UserId, change: &LineChange, as_add: bool) -> Result<(), CartError> {
        let variant_id = change.variant_id();
        let _guard = self.ctx.lock_variant(variant_id).await;

        match self
            .ctx
            .push_variant(user, variant_id, self.epoch, Some(self.seq), as_add)
            .await
        {
            Ok(Pushed::Synced) => Ok(()),
            Ok(Pushed::Stale) => self.past_epoch().unwrap_or(Ok(())),
            Err(e) => {
                let mut state = self.ctx.lock_state();
                if state.epoch == self.epoch {
                    self.undo(&mut state, change);
                }
                Err(CartError::Network(e))
            }
        }
    }

    async fn confirm_clear(&self, user: &UserId, changes: &[LineChange]) -> Result<(), CartError> {
        let leftovers = {
            let _gate = self.ctx.inner.sync_gate.write().await;
            if let Some(outcome) = self.past_epoch() {
                return outcome;
            }

            match with_timeout(self.ctx.inner.request_timeout, self.ctx.inner.remote.clear(user)).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(e) => {
                    let mut state = self.ctx.lock_state();
                    if state.epoch == self.epoch {
                        for change in changes {
                            self.undo(&mut state, change);
                        }
                    }
                    return Err(CartError::Network(e));
                }
            }

            let mut state = self.ctx.lock_state();
            if state.epoch != self.epoch {
                return Ok(());
            }
            for change in changes {
                let variant_id = change.variant_id();
                state.line_ids.remove(variant_id);
                state.set_confirmed(variant_id, 0);
                state.mark_synced(variant_id, self.seq);
            }

            // Lines added after the clear began may have reached the server
            // before it and were wiped with it.
            let leftovers = state.cart.variant_ids();
            for variant_id in &leftovers {
                if let Some(line_id) = state.known_line_id(variant_id) {
                    state.forget_line_id(variant_id, &line_id);
                }
                state.set_confirmed(variant_id, 0);
                state.unmark_synced(variant_id);
            }
            leftovers
        };

        for variant_id in leftovers {
            let _guard = self.ctx.lock_variant(&variant_id).await;
            if let Err(e) = self
                .ctx
                .push_variant(user, &variant_id, self.epoch, None, true)
                .await
            {
                warn!(error = %e, %variant_id, "Failed to re-send line after clearing the server cart");
            }
        }
        Ok(())
    }

    /// Take this mutation's change back out of the cart.
    fn undo(&self, state: &mut CartState, change: &LineChange) {
        let variant_id = change.variant_id();
        if state.set_after(variant_id, self.seq) {
            debug!(%variant_id, "Newer quantity set; skipping rollback");
            return;
        }

        let owner = state.revision(variant_id) == Some(self.seq);
        let target = if owner && !state.has_older_open(variant_id, self.seq) {
            state.confirmed(variant_id)
        } else {
            // Newer adds stay; only this mutation's difference comes out
            let current = state.cart.get(variant_id).map_or(0, CartLine::quantity);
            let undone = (u64::from(current) + u64::from(change.before)).saturating_sub(u64::from(change.after));
            u32::try_from(undone).unwrap_or(u32::MAX)
        };

        debug!(%variant_id, quantity = target, owner, "Rolling back");
        restore_quantity(state, change, target);
        if owner {
            state.restore_revision(variant_id, change.prior_revision);
        }
    }

    fn close(&self) {
        let changes = self.kind.changes();
        if changes.is_empty() {
            return;
        }
        let mut state = self.ctx.lock_state();
        for change in changes {
            state.close(change.variant_id(), self.seq);
        }
    }
}

impl Drop for PendingMutation {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.close();
        }
    }
}

/// Set a variant's quantity after a rollback, putting the line back or
/// removing it as needed.
fn restore_quantity(state: &mut CartState, change: &LineChange, quantity: u32) {
    let variant_id = change.variant_id();
    if quantity == 0 {
        state.cart.remove(variant_id);
        return;
    }
    if let Some(line) = state.cart.get_mut(variant_id) {
        if let Err(e) = line.set_quantity(quantity) {
            warn!(error = %e, %variant_id, "Could not restore line quantity");
        }
        return;
    }

    let mut line = change.template.clone();
    if let Err(e) = line.set_quantity(quantity) {
        warn!(error = %e, %variant_id, "Could not restore line");
        return;
    }
    if line.line_id().is_none() {
        line.set_line_id(state.known_line_id(variant_id));
    }
    state.cart.restore(change.index, line);
}

/// The request that makes the server's line match memory, if one is needed.
///
/// `as_add` sends a grown quantity as a create of the difference, which the
/// server sums into its line.
fn plan_call(state: &CartState, variant_id: &VariantId, as_add: bool) -> Option<RemoteCall> {
    let confirmed = state.confirmed(variant_id);
    match (state.cart.get(variant_id), state.known_line_id(variant_id)) {
        (None, None) => None,
        (None, Some(line_id)) => Some(RemoteCall::Delete(line_id)),
        (Some(line), None) => Some(RemoteCall::Create(LineInput::for_add(line, line.quantity()))),
        (Some(line), Some(_)) if as_add && line.quantity() > confirmed => Some(RemoteCall::Create(
            LineInput::for_add(line, line.quantity() - confirmed),
        )),
        (Some(line), Some(_)) if line.quantity() == confirmed => None,
        (Some(line), Some(line_id)) => Some(RemoteCall::Patch(line_id, line.quantity())),
    }
}

/// Record a server line: its id, its confirmed quantity and its canonical
/// auxiliary fields. The in-memory quantity is never touched.
fn record_response(state: &mut CartState, remote: &RemoteLine) {
    state.line_ids.insert(remote.variant_id.clone(), remote.id.clone());
    state.set_confirmed(&remote.variant_id, remote.quantity);
    if let Some(line) = state.cart.get_mut(&remote.variant_id) {
        merge_canonical(line, remote);
    }
}

/// Merge a server line's auxiliary fields. The quantity is never touched.
fn merge_canonical(line: &mut CartLine, remote: &RemoteLine) {
    line.set_line_id(Some(remote.id.clone()));
    if let Err(e) = line.set_unit_price(remote.price()) {
        warn!(error = %e, variant_id = %remote.variant_id, "Ignoring invalid server price");
    }
    line.set_product_name(remote.product_name.clone());
    if let Some(stock) = remote.stock {
        line.set_stock(stock);
    }
}

// =============================================================================
// Per-variant requests
// =============================================================================

impl CartContext {
    /// Bring the server's line for `variant_id` in line with memory.
    ///
    /// The caller holds the variant's lock. `seq` is the mutation being
    /// confirmed: if a newer request already covered it nothing is sent.
    /// `None` always sends.
    pub(crate) async fn push_variant(
        &self,
        user: &UserId,
        variant_id: &VariantId,
        epoch: u64,
        seq: Option<u64>,
        as_add: bool,
    ) -> Result<Pushed, RemoteError> {
        let (call, through) = {
            let state = self.lock_state();
            if state.epoch != epoch {
                return Ok(Pushed::Stale);
            }
            if seq.is_some_and(|seq| state.is_synced(variant_id, seq)) {
                debug!(%variant_id, "Already confirmed by a newer request");
                return Ok(Pushed::Synced);
            }
            let through = state.revision(variant_id).or(seq).unwrap_or_default();
            (plan_call(&state, variant_id, as_add), through)
        };

        let limit = self.inner.request_timeout;
        let remote = &self.inner.remote;
        let response = match &call {
            None => None,
            Some(RemoteCall::Create(input)) => Some(with_timeout(limit, remote.create_line(user, input)).await?),
            Some(RemoteCall::Patch(line_id, quantity)) => {
                match with_timeout(limit, remote.update_quantity(user, line_id, *quantity)).await {
                    Ok(line) => Some(line),
                    Err(RemoteError::NotFound(_)) => {
                        self.drop_vanished_line(variant_id, line_id, epoch, through);
                        return Ok(Pushed::Synced);
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(RemoteCall::Delete(line_id)) => {
                match with_timeout(limit, remote.delete_line(user, line_id)).await {
                    Ok(()) | Err(RemoteError::NotFound(_)) => None,
                    Err(e) => return Err(e),
                }
            }
        };

        let mut state = self.lock_state();
        if state.epoch != epoch {
            return Ok(Pushed::Synced);
        }
        match (&call, response) {
            (Some(RemoteCall::Delete(line_id)), _) => {
                state.forget_line_id(variant_id, line_id);
                state.set_confirmed(variant_id, 0);
            }
            (_, Some(line)) => record_response(&mut state, &line),
            _ => {}
        }
        state.mark_synced(variant_id, through);
        Ok(Pushed::Synced)
    }

    /// The server no longer has the line being patched: drop it locally
    /// unless a newer mutation will re-create it.
    fn drop_vanished_line(&self, variant_id: &VariantId, line_id: &LineId, epoch: u64, through: u64) {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return;
        }
        state.forget_line_id(variant_id, line_id);
        state.set_confirmed(variant_id, 0);
        if state.revision(variant_id) == Some(through) {
            debug!(%line_id, "Line already gone remotely; removing locally");
            state.cart.remove(variant_id);
            state.mark_synced(variant_id, through);
        }
    }
}

// =============================================================================
// Entry points
// =============================================================================

impl CartContext {
    /// Apply an add: sums into the variant's line or appends a new one.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Validation`] if the summed quantity overflows or
    /// the line's currency differs from the cart's; the cart is unchanged in
    /// that case.
    pub fn begin_add(&self, line: CartLine) -> Result<PendingMutation, CartError> {
        let variant_id = line.variant_id().clone();
        let pending = {
            let mut state = self.lock_state();
            let prior = state
                .cart
                .position(&variant_id)
                .and_then(|index| state.cart.lines().get(index).map(|l| (index, l.clone())));
            let after = state.cart.add(line.clone())?;

            let seq = state.next_seq();
            let prior_revision = state.bump_revision(&variant_id, seq);
            let change = match prior {
                Some((index, prior)) => LineChange {
                    index,
                    before: prior.quantity(),
                    template: prior,
                    after,
                    prior_revision,
                },
                None => LineChange {
                    index: state.cart.len().saturating_sub(1),
                    template: line,
                    before: 0,
                    after,
                    prior_revision,
                },
            };
            PendingMutation::new(self, &mut state, seq, MutationKind::Add(change))
        };

        add_breadcrumb("cart", "add", Some(&[("variant_id", variant_id.as_str())]));
        Ok(pending)
    }

    /// Apply a removal. Removing a variant that is not in the cart is a no-op.
    pub fn begin_remove(&self, variant_id: &VariantId) -> PendingMutation {
        let mut state = self.lock_state();
        let Some((index, line)) = state.cart.remove(variant_id) else {
            debug!(%variant_id, "Remove of absent variant");
            return PendingMutation::noop(self, &mut state);
        };

        let seq = state.next_seq();
        let prior_revision = state.bump_revision(variant_id, seq);
        state.mark_set(variant_id, seq);
        let change = LineChange {
            index,
            before: line.quantity(),
            template: line,
            after: 0,
            prior_revision,
        };
        let pending = PendingMutation::new(self, &mut state, seq, MutationKind::Remove(change));
        drop(state);

        add_breadcrumb("cart", "remove", Some(&[("variant_id", variant_id.as_str())]));
        pending
    }

    /// Apply a quantity change; `quantity <= 0` removes the line.
    ///
    /// Updating a variant that is not in the cart is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Validation`] if `quantity` does not fit a line.
    pub fn begin_update(&self, variant_id: &VariantId, quantity: i64) -> Result<PendingMutation, CartError> {
        let mut state = self.lock_state();
        let Some(index) = state.cart.position(variant_id) else {
            debug!(%variant_id, "Update of absent variant");
            return Ok(PendingMutation::noop(self, &mut state));
        };
        let Some(prior) = state.cart.lines().get(index).cloned() else {
            return Ok(PendingMutation::noop(self, &mut state));
        };

        let to = match state.cart.set_quantity(variant_id, quantity)? {
            QuantityChange::Updated { from, to } if from == to => {
                return Ok(PendingMutation::noop(self, &mut state));
            }
            QuantityChange::Updated { to, .. } => to,
            QuantityChange::Removed { .. } => 0,
            QuantityChange::Missing => return Ok(PendingMutation::noop(self, &mut state)),
        };

        let seq = state.next_seq();
        let prior_revision = state.bump_revision(variant_id, seq);
        state.mark_set(variant_id, seq);
        let change = LineChange {
            index,
            before: prior.quantity(),
            template: prior,
            after: to,
            prior_revision,
        };
        let pending = PendingMutation::new(self, &mut state, seq, MutationKind::Update(change));
        drop(state);

        let quantity = to.to_string();
        add_breadcrumb(
            "cart",
            "update_quantity",
            Some(&[("variant_id", variant_id.as_str()), ("quantity", quantity.as_str())]),
        );
        Ok(pending)
    }

    /// Apply a clear of every line.
    pub fn begin_clear(&self) -> PendingMutation {
        let mut state = self.lock_state();
        if state.cart.is_empty() {
            return PendingMutation::noop(self, &mut state);
        }

        let seq = state.next_seq();
        let prior: Vec<(usize, CartLine)> = state.cart.lines().iter().cloned().enumerate().collect();
        let changes = prior
            .into_iter()
            .map(|(index, line)| {
                let variant_id = line.variant_id().clone();
                let prior_revision = state.bump_revision(&variant_id, seq);
                state.mark_set(&variant_id, seq);
                LineChange {
                    index,
                    before: line.quantity(),
                    template: line,
                    after: 0,
                    prior_revision,
                }
            })
            .collect();
        state.cart.clear();

        let pending = PendingMutation::new(self, &mut state, seq, MutationKind::Clear(changes));
        drop(state);

        add_breadcrumb("cart", "clear", None);
        pending
    }

    /// Add a line and wait for confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Validation`] for an invalid line,
    /// [`CartError::Network`] if the remote create failed (the add is rolled
    /// back) or [`CartError::Superseded`] if the cart was replaced first.
    #[instrument(skip(self, line), fields(variant_id = %line.variant_id(), quantity = line.quantity()))]
    pub async fn add_item(&self, line: CartLine) -> Result<(), CartError> {
        self.begin_add(line)?.settle().await
    }

    /// Remove a line and wait for confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Network`] if the remote delete failed (the line is
    /// restored at its original position).
    #[instrument(skip(self))]
    pub async fn remove_item(&self, variant_id: &VariantId) -> Result<(), CartError> {
        self.begin_remove(variant_id).settle().await
    }

    /// Set a line's quantity (`<= 0` removes it) and wait for confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Validation`] for an out-of-range quantity or
    /// [`CartError::Network`] if the remote call failed.
    #[instrument(skip(self))]
    pub async fn update_quantity(&self, variant_id: &VariantId, quantity: i64) -> Result<(), CartError> {
        self.begin_update(variant_id, quantity)?.settle().await
    }

    /// Empty the cart and wait for confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Network`] if the remote clear failed (the lines
    /// are restored).
    #[instrument(skip(self))]
    pub async fn clear_cart(&self) -> Result<(), CartError> {
        self.begin_clear().settle().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use naked_pineapple_core::{CurrencyCode, Price};

    use super::*;
    use crate::persistence::{InMemoryCartService, InMemoryCatalog, LocalStore, MemoryLocalStore, RemoteOp};

    struct Harness {
        ctx: CartContext,
        local: Arc<MemoryLocalStore>,
        remote: Arc<InMemoryCartService>,
    }

    fn harness(identity: IdentityContext) -> Harness {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.upsert("v-1", "p-1", "Tee", Price::from_minor(2000, CurrencyCode::USD), 50);
        catalog.upsert("v-2", "p-2", "Hat", Price::from_minor(1500, CurrencyCode::USD), 50);
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(InMemoryCartService::new(Arc::clone(&catalog)));
        let ctx = CartContext::new(local.clone(), remote.clone(), catalog, Duration::from_millis(200));
        ctx.lock_state().identity = identity;
        Harness { ctx, local, remote }
    }

    fn line(variant: &str, quantity: u32) -> CartLine {
        CartLine::new(variant, "p-1", "Tee", Price::from_minor(1999, CurrencyCode::USD), quantity).unwrap()
    }

    fn user() -> IdentityContext {
        IdentityContext::authenticated("u-1")
    }

    #[test]
    fn test_state_transitions() {
        use MutationState::{Applied, Awaiting, Committed, RolledBack};
        assert!(Applied.can_transition_to(Awaiting));
        assert!(Applied.can_transition_to(Committed));
        assert!(Awaiting.can_transition_to(RolledBack));
        assert!(!Applied.can_transition_to(RolledBack));
        assert!(!Committed.can_transition_to(Awaiting));
        assert!(!RolledBack.can_transition_to(Committed));
        assert!(Committed.is_terminal());
        assert!(!Awaiting.is_terminal());
    }

    #[tokio::test]
    async fn test_begin_applies_before_settle() {
        let h = harness(IdentityContext::Guest);
        let mut pending = h.ctx.begin_add(line("v-1", 2)).unwrap();
        assert_eq!(pending.state(), MutationState::Applied);
        assert_eq!(h.ctx.item_count(), 2);
        assert!(h.local.is_empty());

        pending.settle().await.unwrap();
        assert_eq!(pending.state(), MutationState::Committed);
        assert_eq!(h.local.load().await.unwrap(), vec![line("v-1", 2)]);
    }

    #[tokio::test]
    async fn test_guest_storage_failure_is_absorbed() {
        let h = harness(IdentityContext::Guest);
        h.local.set_fail_writes(true);
        h.ctx.add_item(line("v-1", 1)).await.unwrap();
        assert_eq!(h.ctx.item_count(), 1);
    }

    #[tokio::test]
    async fn test_authenticated_add_merges_canonical_fields() {
        let h = harness(user());
        h.ctx.add_item(line("v-1", 2)).await.unwrap();

        let lines = h.ctx.lines();
        assert_eq!(lines[0].quantity(), 2);
        assert!(lines[0].line_id().is_some());
        assert_eq!(lines[0].unit_price(), Price::from_minor(2000, CurrencyCode::USD));
        assert_eq!(lines[0].stock(), Some(50));
    }

    #[tokio::test]
    async fn test_failed_add_rolls_back() {
        let h = harness(user());
        h.ctx.add_item(line("v-1", 2)).await.unwrap();
        h.remote.fail_next(RemoteOp::Create);

        let mut pending = h.ctx.begin_add(line("v-1", 3)).unwrap();
        assert_eq!(h.ctx.item_count(), 5);
        let err = pending.settle().await.unwrap_err();
        assert!(err.is_network());
        assert_eq!(pending.state(), MutationState::RolledBack);
        assert_eq!(h.ctx.item_count(), 2);
        assert!(h.ctx.lines()[0].line_id().is_some());
    }

    #[tokio::test]
    async fn test_superseded_rollback_is_skipped() {
        let h = harness(user());
        h.ctx.add_item(line("v-1", 1)).await.unwrap();
        let variant = VariantId::new("v-1");

        h.remote.fail_next(RemoteOp::Update);
        let mut first = h.ctx.begin_update(&variant, 3).unwrap();
        let mut second = h.ctx.begin_update(&variant, 5).unwrap();

        assert!(first.settle().await.is_err());
        second.settle().await.unwrap();

        assert_eq!(h.ctx.lines()[0].quantity(), 5);
        assert_eq!(h.remote.lines_for(&UserId::new("u-1"))[0].quantity, 5);
    }

    #[tokio::test]
    async fn test_noop_for_absent_variant() {
        let h = harness(user());
        let mut pending = h.ctx.begin_remove(&VariantId::new("nope"));
        assert!(pending.is_noop());
        pending.settle().await.unwrap();
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_from_past_epoch_is_rejected() {
        let h = harness(IdentityContext::Guest);
        let mut pending = h.ctx.begin_add(line("v-1", 1)).unwrap();
        h.ctx.lock_state().advance_epoch();

        let err = pending.settle().await.unwrap_err();
        assert!(matches!(err, CartError::Superseded));
        assert!(!err.is_network());
        assert_eq!(pending.state(), MutationState::RolledBack);
        assert!(h.local.is_empty());
    }

    #[tokio::test]
    async fn test_carried_mutation_commits_after_epoch_change() {
        let h = harness(IdentityContext::Guest);
        let mut pending = h.ctx.begin_add(line("v-1", 1)).unwrap();
        {
            let mut state = h.ctx.lock_state();
            let through = state.last_seq();
            let epoch = state.epoch;
            state.carry(epoch, through);
            state.advance_epoch();
        }

        pending.settle().await.unwrap();
        assert_eq!(pending.state(), MutationState::Committed);
        assert!(h.local.is_empty());
    }

    #[tokio::test]
    async fn test_failed_clear_restores_lines_in_order() {
        let h = harness(user());
        h.ctx.add_item(line("v-1", 1)).await.unwrap();
        h.ctx.add_item(line("v-2", 4)).await.unwrap();
        h.remote.fail_next(RemoteOp::Clear);

        assert!(h.ctx.clear_cart().await.is_err());
        let lines = h.ctx.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].variant_id().as_str(), "v-1");
        assert_eq!(lines[1].quantity(), 4);
    }

    #[tokio::test]
    async fn test_remove_before_create_sends_nothing() {
        let h = harness(user());
        let mut add = h.ctx.begin_add(line("v-1", 2)).unwrap();
        let mut remove = h.ctx.begin_remove(&VariantId::new("v-1"));

        remove.settle().await.unwrap();
        add.settle().await.unwrap();

        assert!(h.ctx.lines().is_empty());
        assert!(h.remote.lines_for(&UserId::new("u-1")).is_empty());
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_add_followed_by_add_keeps_newer_quantity() {
        let h = harness(user());
        h.remote.fail_next(RemoteOp::Create);
        let mut first = h.ctx.begin_add(line("v-1", 2)).unwrap();
        let mut second = h.ctx.begin_add(line("v-1", 3)).unwrap();

        assert!(first.settle().await.is_err());
        assert_eq!(h.ctx.item_count(), 3);
        second.settle().await.unwrap();

        assert_eq!(h.ctx.lines()[0].quantity(), 3);
        assert_eq!(h.remote.lines_for(&UserId::new("u-1"))[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_failed_remove_followed_by_add_restores_both() {
        let h = harness(user());
        h.ctx.add_item(line("v-1", 3)).await.unwrap();
        let variant = VariantId::new("v-1");

        h.remote.fail_next(RemoteOp::Update);
        let mut remove = h.ctx.begin_remove(&variant);
        let mut add = h.ctx.begin_add(line("v-1", 1)).unwrap();

        // The remove is undone underneath the newer add
        assert!(remove.settle().await.is_err());
        assert_eq!(h.ctx.lines()[0].quantity(), 4);
        add.settle().await.unwrap();

        assert_eq!(h.ctx.lines()[0].quantity(), 4);
        assert_eq!(h.remote.lines_for(&UserId::new("u-1"))[0].quantity, 4);
    }

    #[tokio::test]
    async fn test_update_survives_failed_create() {
        let h = harness(user());
        let variant = VariantId::new("v-1");
        h.remote.fail_next(RemoteOp::Create);
        let mut add = h.ctx.begin_add(line("v-1", 2)).unwrap();
        let mut update = h.ctx.begin_update(&variant, 4).unwrap();

        assert!(add.settle().await.is_err());
        assert_eq!(h.ctx.lines()[0].quantity(), 4);
        update.settle().await.unwrap();

        assert_eq!(h.remote.lines_for(&UserId::new("u-1"))[0].quantity, 4);
        assert!(h.ctx.lines()[0].line_id().is_some());
    }

    #[tokio::test]
    async fn test_dropped_mutation_releases_its_variant() {
        let h = harness(user());
        h.ctx.add_item(line("v-1", 1)).await.unwrap();
        drop(h.ctx.begin_update(&VariantId::new("v-1"), 2).unwrap());

        h.remote.fail_next(RemoteOp::Update);
        assert!(h.ctx.update_quantity(&VariantId::new("v-1"), 5).await.is_err());
        assert_eq!(h.ctx.lines()[0].quantity(), 1);
    }
}

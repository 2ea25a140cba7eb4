//! Identity transitions: session load, login merge and logout.
//!
//! Logging in moves the guest cart into the customer's server cart with a
//! single `sync` call. The server merges by variant (summing quantities,
//! pricing new lines from the catalog) and returns the canonical cart, which
//! replaces the in-memory one. The merge is all-or-nothing: if the call fails
//! nothing changes and the customer stays a guest, so it can be retried.
//!
//! Guest changes made while the merge request is in flight are not part of
//! it; once the merge lands they settle with [`CartError::Superseded`].
//!
//! Logging out clears the in-memory cart and the guest snapshot right away;
//! clearing the server cart happens in the background and never blocks.

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use naked_pineapple_core::{CartLine, IdentityContext, UserId};

use crate::context::CartContext;
use crate::error::{CartError, add_breadcrumb, clear_sentry_user, report, set_sentry_user};
use crate::persistence::{LineInput, canonical_lines, with_timeout};

/// What a transition did.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// Already in the requested identity; nothing happened.
    Unchanged,
    /// Guest session restored from the local snapshot.
    LoadedGuest { lines: usize },
    /// No guest cart to merge; the server cart was loaded.
    Fetched { lines: usize },
    /// Guest cart merged into the server cart.
    Merged { merged_lines: usize },
    /// Logged out. The handle resolves when the background server clear ends.
    LoggedOut { remote_clear: Option<JoinHandle<()>> },
}

/// Guest lines captured for a login merge.
struct GuestCart {
    lines: Vec<CartLine>,
    /// Newest guest mutation reflected in `lines`.
    through: u64,
    /// `lines` came from the local snapshot, not memory.
    from_snapshot: bool,
}

impl CartContext {
    /// Restore a session for `identity`.
    ///
    /// A guest session loads the local snapshot (an unreadable snapshot is
    /// logged and treated as empty). An authenticated session runs the login
    /// flow, or refreshes from the server if already logged in as that user.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Network`] if the server cart cannot be loaded or
    /// merged.
    #[instrument(skip(self), fields(identity = %identity))]
    pub async fn load(&self, identity: IdentityContext) -> Result<TransitionOutcome, CartError> {
        let _guard = self.inner.transition_lock.lock().await;
        let current = self.identity();

        match (current, identity) {
            (IdentityContext::Authenticated { .. }, IdentityContext::Guest) => Ok(self.logout().await),
            (IdentityContext::Guest, IdentityContext::Guest) => Ok(self.load_guest().await),
            (IdentityContext::Authenticated { user_id: from }, IdentityContext::Authenticated { user_id })
                if from == user_id =>
            {
                self.fetch_remote(&user_id, None).await
            }
            (current, IdentityContext::Authenticated { user_id }) => {
                if !current.is_guest() {
                    self.logout().await;
                }
                self.login(&user_id).await
            }
        }
    }

    /// Handle an identity change event.
    ///
    /// - `Guest → Authenticated`: merge the guest cart into the server cart
    /// - `Authenticated → Guest`: clear everything
    /// - switching users: logout, then login
    /// - same identity: no-op (a login never merges twice)
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Network`] if the merge or fetch failed. The
    /// identity then stays `Guest` and the guest snapshot is untouched.
    #[instrument(skip(self), fields(to = %to))]
    pub async fn transition(&self, to: IdentityContext) -> Result<TransitionOutcome, CartError> {
        let _guard = self.inner.transition_lock.lock().await;
        let current = self.identity();

        if current == to {
            debug!("Identity unchanged");
            return Ok(TransitionOutcome::Unchanged);
        }

        match to {
            IdentityContext::Guest => Ok(self.logout().await),
            IdentityContext::Authenticated { user_id } => {
                if !current.is_guest() {
                    self.logout().await;
                }
                self.login(&user_id).await
            }
        }
    }

    async fn load_guest(&self) -> TransitionOutcome {
        let lines = match self.inner.local.load().await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "Failed to read guest cart snapshot; starting empty");
                Vec::new()
            }
        };

        let mut state = self.lock_state();
        if let Err(e) = state.reset(lines) {
            warn!(error = %e, "Discarding invalid guest cart snapshot");
            state.cart.clear();
        }
        TransitionOutcome::LoadedGuest {
            lines: state.cart.len(),
        }
    }

    /// Lines to merge at login.
    ///
    /// The in-memory guest cart already holds every optimistic change,
    /// including ones whose snapshot write has not landed, so it wins when it
    /// has lines. Otherwise the local snapshot is read.
    async fn guest_lines(&self) -> GuestCart {
        let (lines, through) = {
            let state = self.lock_state();
            (state.cart.lines().to_vec(), state.last_seq())
        };
        if !lines.is_empty() {
            return GuestCart {
                lines,
                through,
                from_snapshot: false,
            };
        }

        let lines = match self.inner.local.load().await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "Failed to read guest cart snapshot; merging nothing");
                Vec::new()
            }
        };
        GuestCart {
            lines,
            through,
            from_snapshot: true,
        }
    }

    async fn login(&self, user_id: &UserId) -> Result<TransitionOutcome, CartError> {
        let guest = self.guest_lines().await;

        if guest.lines.is_empty() {
            debug!("No guest cart; loading server cart");
            return self.fetch_remote(user_id, Some(guest.through)).await;
        }

        let projection: Vec<LineInput> = guest.lines.iter().map(LineInput::projection).collect();
        info!(user_id = %user_id, lines = projection.len(), "Merging guest cart");

        let result = with_timeout(
            self.inner.request_timeout,
            self.inner.remote.sync(user_id, &projection),
        )
        .await
        .and_then(canonical_lines);

        let merged = match result {
            Ok(lines) => lines,
            Err(e) => {
                if guest.from_snapshot {
                    let mut state = self.lock_state();
                    if state.cart.is_empty() {
                        // Keep the pre-merge snapshot visible
                        if let Err(e) = state.reset(guest.lines) {
                            warn!(error = %e, "Could not restore guest cart after failed merge");
                        }
                    }
                }
                let err = CartError::Network(e);
                report(&err);
                return Err(err);
            }
        };

        let merged_lines = merged.len();
        self.authenticate(user_id, merged, Some(guest.through))?;
        self.clear_local_snapshot().await;

        Ok(TransitionOutcome::Merged { merged_lines })
    }

    /// Load the server cart. `carry` is the last guest mutation the loaded
    /// cart accounts for.
    async fn fetch_remote(&self, user_id: &UserId, carry: Option<u64>) -> Result<TransitionOutcome, CartError> {
        let result = with_timeout(self.inner.request_timeout, self.inner.remote.fetch(user_id))
            .await
            .and_then(canonical_lines);

        let lines = match result {
            Ok(lines) => lines,
            Err(e) => {
                let err = CartError::Network(e);
                report(&err);
                return Err(err);
            }
        };

        let count = lines.len();
        self.authenticate(user_id, lines, carry)?;
        Ok(TransitionOutcome::Fetched { lines: count })
    }

    /// Switch to `user_id` with a canonical cart and start a new epoch.
    ///
    /// Mutations of the current epoch up to `carry` count as saved by the
    /// new cart.
    fn authenticate(&self, user_id: &UserId, lines: Vec<CartLine>, carry: Option<u64>) -> Result<(), CartError> {
        {
            let mut state = self.lock_state();
            state.reset(lines)?;
            if let Some(through) = carry {
                let epoch = state.epoch;
                state.carry(epoch, through);
            }
            state.identity = IdentityContext::Authenticated {
                user_id: user_id.clone(),
            };
            state.advance_epoch();
        }

        set_sentry_user(user_id);
        add_breadcrumb("identity", "login", Some(&[("user_id", user_id.as_str())]));
        Ok(())
    }

    /// Clear memory and the local snapshot now; clear the server cart in the
    /// background.
    async fn logout(&self) -> TransitionOutcome {
        let user_id = {
            let mut state = self.lock_state();
            let user_id = state.identity.user_id().cloned();
            state.forget();
            state.identity = IdentityContext::Guest;
            state.advance_epoch();
            user_id
        };

        self.clear_local_snapshot().await;
        clear_sentry_user();
        add_breadcrumb("identity", "logout", None);

        let remote_clear = user_id.map(|user_id| {
            let remote = self.inner.remote.clone();
            let limit = self.inner.request_timeout;
            tokio::spawn(async move {
                match with_timeout(limit, remote.clear(&user_id)).await {
                    Ok(()) => debug!(user_id = %user_id, "Server cart cleared after logout"),
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Failed to clear server cart after logout");
                    }
                }
            })
        });

        TransitionOutcome::LoggedOut { remote_clear }
    }
}

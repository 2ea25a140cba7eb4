//! Unified error handling with Sentry integration.
//!
//! [`CartError`] is what callers of the engine see. Storage failures and
//! "already gone" responses are absorbed inside the engine and only logged;
//! everything that reaches a caller here needs to be shown to the customer.

use thiserror::Error;

use naked_pineapple_core::LineError;

use crate::enrichment::LineNotice;
use crate::persistence::{RemoteError, StorageError};

/// Engine-level error type.
#[derive(Debug, Error)]
pub enum CartError {
    /// A remote cart call failed or timed out. The mutation was rolled back.
    #[error("Network error: {0}")]
    Network(#[source] RemoteError),

    /// The line or quantity is invalid.
    #[error("Invalid cart line: {0}")]
    Validation(#[from] LineError),

    /// The catalog could not be reached before checkout.
    #[error("Could not verify cart: {0}")]
    CatalogUnavailable(#[source] RemoteError),

    /// Reconciliation changed the cart and the customer has not accepted it.
    #[error("Cart changed since it was last viewed ({} update(s)); review required", .notices.len())]
    CatalogDrift {
        /// The corrections the customer must review.
        notices: Vec<LineNotice>,
    },

    /// The cart was replaced (login merge, logout, completed checkout) before
    /// this change was saved. The change is no longer in the cart.
    #[error("Cart was replaced before the change was saved")]
    Superseded,

    /// Local snapshot could not be read or written. Only surfaced by setup
    /// paths; mutations absorb it.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<RemoteError> for CartError {
    fn from(err: RemoteError) -> Self {
        Self::Network(err)
    }
}

impl CartError {
    /// Returns true if the error came from a remote call.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::CatalogUnavailable(_))
    }

    /// Message safe to show to a customer.
    #[must_use]
    pub fn customer_message(&self) -> String {
        match self {
            Self::Network(_) => "We couldn't update your cart. Please try again.".to_string(),
            Self::Validation(err) => err.to_string(),
            Self::CatalogUnavailable(_) => {
                "We could not verify your cart. Please try again before checking out.".to_string()
            }
            Self::CatalogDrift { notices } => notices
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
            Self::Superseded => "Your cart was updated while this change was saving. Please try again.".to_string(),
            Self::Storage(_) => "Your cart could not be saved on this device.".to_string(),
        }
    }
}

/// Capture a surfaced error to Sentry.
///
/// Only remote failures are captured; drift and validation are customer
/// facing outcomes, not faults.
pub fn report(err: &CartError) {
    if err.is_network() {
        let event_id = sentry::capture_error(err);
        tracing::error!(
            error = %err,
            sentry_event_id = %event_id,
            "Cart operation failed"
        );
    }
}

/// Set the Sentry user context from a user ID.
///
/// Called on login so errors are associated with the customer.
pub fn set_sentry_user(user_id: &impl ToString) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context.
///
/// Called on logout to stop associating errors with the customer.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Add a breadcrumb for a cart action.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of cart
/// mutations leading up to a failure.
///
/// # Example
///
/// ```rust,ignore
/// add_breadcrumb("cart", "remove", Some(&[("variant_id", "v-1")]));
/// ```
pub fn add_breadcrumb(category: &str, message: &str, data: Option<&[(&str, &str)]>) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    if let Some(pairs) = data {
        for (key, value) in pairs {
            breadcrumb.data.insert(
                (*key).to_string(),
                serde_json::Value::String((*value).to_string()),
            );
        }
    }

    sentry::add_breadcrumb(breadcrumb);
}

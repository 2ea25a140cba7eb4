//! Identity context a cart belongs to.

use serde::{Deserialize, Serialize};

use super::id::UserId;

/// Who owns the cart, and therefore which store is authoritative for it.
///
/// - `Guest` carts live in the session-scoped local store.
/// - `Authenticated` carts live in the remote cart service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityContext {
    #[default]
    Guest,
    Authenticated {
        /// Stable user id assigned by the identity provider.
        user_id: UserId,
    },
}

impl IdentityContext {
    /// Shorthand for an authenticated context.
    #[must_use]
    pub fn authenticated(user_id: impl Into<UserId>) -> Self {
        Self::Authenticated {
            user_id: user_id.into(),
        }
    }

    /// The authenticated user, if any.
    #[must_use]
    pub const fn user_id(&self) -> Option<&UserId> {
        match self {
            Self::Guest => None,
            Self::Authenticated { user_id } => Some(user_id),
        }
    }

    /// Returns true for the guest context.
    #[must_use]
    pub const fn is_guest(&self) -> bool {
        matches!(self, Self::Guest)
    }
}

impl std::fmt::Display for IdentityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Guest => write!(f, "guest"),
            Self::Authenticated { user_id } => write!(f, "user:{user_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_guest() {
        assert!(IdentityContext::default().is_guest());
        assert_eq!(IdentityContext::default().user_id(), None);
    }

    #[test]
    fn test_authenticated_user_id() {
        let identity = IdentityContext::authenticated("u-1");
        assert!(!identity.is_guest());
        assert_eq!(identity.user_id(), Some(&UserId::new("u-1")));
        assert_eq!(identity.to_string(), "user:u-1");
    }
}

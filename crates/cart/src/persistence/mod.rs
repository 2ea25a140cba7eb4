//! Persistence adapter: the local snapshot store, the remote cart service and
//! the catalog.
//!
//! # Architecture
//!
//! - [`LocalStore`] - one serialized snapshot per session, always rewritten whole
//! - [`RemoteCartService`] - line-level REST API, one cart per user
//! - [`CatalogService`] - batched price/stock lookup
//!
//! Each seam is a trait so the engine can run against the HTTP clients in
//! [`http`] or the in-memory implementations in [`memory`] (tests, local
//! development).

pub mod http;
pub mod local;
pub mod memory;
pub mod wire;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use naked_pineapple_core::{CartLine, LineId, UserId, VariantId};

pub use http::{HttpCartClient, HttpCatalogClient};
pub use local::{FileLocalStore, LocalSnapshot, MemoryLocalStore};
pub use memory::{InMemoryCartService, InMemoryCatalog, RemoteOp};
pub use wire::{CatalogEntry, LineInput, RemoteLine};

/// Errors from the local snapshot store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded.
    #[error("Snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Snapshot was written by an incompatible version.
    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    /// Session id cannot be used as a storage key.
    #[error("Invalid session id: {0}")]
    InvalidSession(String),

    /// Store refused the operation.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the remote cart and catalog services.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Service answered with a non-success status.
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// No answer within the configured bound.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Line or cart is already gone.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rate limited by the service.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Response parsed but violates the cart invariants.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Service is unreachable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Returns true if the target was already absent server-side.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Session-scoped guest cart storage.
///
/// Implementations store the whole cart as one blob: there is no partial
/// update, every save replaces the previous snapshot.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read the snapshot. A missing snapshot is an empty cart.
    async fn load(&self) -> Result<Vec<CartLine>, StorageError>;

    /// Replace the snapshot.
    async fn save(&self, lines: &[CartLine]) -> Result<(), StorageError>;

    /// Delete the snapshot.
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Per-user server-side cart.
///
/// Implementations should be idempotent at the line level: deleting a line
/// that no longer exists succeeds.
#[async_trait]
pub trait RemoteCartService: Send + Sync {
    /// `GET cart`
    async fn fetch(&self, user: &UserId) -> Result<Vec<RemoteLine>, RemoteError>;

    /// `POST cart` - adds to the variant's line if one exists, creates it otherwise.
    async fn create_line(&self, user: &UserId, input: &LineInput) -> Result<RemoteLine, RemoteError>;

    /// `PATCH cart/{lineId}`
    async fn update_quantity(
        &self,
        user: &UserId,
        line_id: &LineId,
        quantity: u32,
    ) -> Result<RemoteLine, RemoteError>;

    /// `DELETE cart/{lineId}`
    async fn delete_line(&self, user: &UserId, line_id: &LineId) -> Result<(), RemoteError>;

    /// `POST cart/sync` - merge a batch by variant and return the whole cart.
    async fn sync(&self, user: &UserId, lines: &[LineInput]) -> Result<Vec<RemoteLine>, RemoteError>;

    /// `DELETE cart`
    async fn clear(&self, user: &UserId) -> Result<(), RemoteError>;
}

/// Live catalog lookup.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// `POST catalog/batch` - variants missing from the answer no longer exist.
    async fn batch(&self, variant_ids: &[VariantId]) -> Result<Vec<CatalogEntry>, RemoteError>;
}

/// Run a remote call under a deadline; an elapsed deadline is a failure.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl std::future::Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout(limit)))
}

/// Convert server lines into validated cart lines.
///
/// Lines the server reports at quantity zero are dropped rather than kept.
pub(crate) fn canonical_lines(remote: Vec<RemoteLine>) -> Result<Vec<CartLine>, RemoteError> {
    remote
        .into_iter()
        .filter(|line| {
            if line.quantity == 0 {
                tracing::warn!(variant_id = %line.variant_id, "Dropping zero-quantity line from server");
                return false;
            }
            true
        })
        .map(|line| {
            let variant_id = line.variant_id.clone();
            line.into_cart_line().map_err(|e| {
                RemoteError::InvalidResponse(format!("line for variant {variant_id}: {e}"))
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal::Decimal;

    use naked_pineapple_core::{CurrencyCode, ProductId};

    use super::*;

    fn remote(variant: &str, quantity: u32) -> RemoteLine {
        RemoteLine {
            id: LineId::new(format!("line-{variant}")),
            product_id: ProductId::new("p-1"),
            variant_id: VariantId::new(variant),
            product_name: "Tee".to_string(),
            unit_price: Decimal::new(1000, 2),
            currency_code: CurrencyCode::USD,
            quantity,
            stock: Some(9),
            metadata: std::collections::BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_elapsed() {
        let result: Result<(), RemoteError> =
            with_timeout(Duration::from_millis(10), std::future::pending()).await;
        assert!(matches!(result, Err(RemoteError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, RemoteError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_canonical_lines_drops_zero_quantity() {
        let lines = canonical_lines(vec![remote("v-1", 2), remote("v-2", 0)]).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines.first().unwrap().line_id().unwrap().as_str(), "line-v-1");
    }

    #[test]
    fn test_canonical_lines_rejects_invalid() {
        let mut bad = remote("v-1", 1);
        bad.product_name = String::new();
        assert!(matches!(
            canonical_lines(vec![bad]),
            Err(RemoteError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(RemoteError::NotFound("line-1".into()).is_not_found());
        assert!(!RemoteError::Timeout(Duration::from_secs(1)).is_not_found());
    }
}

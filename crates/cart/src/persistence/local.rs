//! Guest cart snapshot stores.
//!
//! A snapshot is the entire cart serialized as one JSON document. Stores never
//! patch a snapshot in place: a save replaces it, a clear deletes it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use naked_pineapple_core::{Cart, CartLine};

use super::{LocalStore, StorageError};

/// Current snapshot format.
const SNAPSHOT_VERSION: u32 = 1;

/// Serialized guest cart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSnapshot {
    /// Format version, bumped on incompatible changes.
    pub version: u32,
    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,
    /// The whole cart. Deserializing merges duplicate variants and rejects
    /// zero quantities.
    pub cart: Cart,
}

impl LocalSnapshot {
    fn encode(lines: &[CartLine]) -> Result<String, StorageError> {
        let snapshot = Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            cart: Cart::from_lines(lines.iter().cloned())
                .map_err(|e| StorageError::Unavailable(e.to_string()))?,
        };
        Ok(serde_json::to_string(&snapshot)?)
    }

    fn decode(raw: &str) -> Result<Vec<CartLine>, StorageError> {
        let snapshot: Self = serde_json::from_str(raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StorageError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot.cart.into())
    }
}

// =============================================================================
// FileLocalStore
// =============================================================================

/// Stores one snapshot file per session under a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a half-written snapshot.
#[derive(Debug, Clone)]
pub struct FileLocalStore {
    path: PathBuf,
}

impl FileLocalStore {
    /// Create a store for `session_id` under `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSession`] unless the session id is
    /// 1-128 characters of ASCII letters, digits, `-` or `_`.
    pub fn new(dir: impl AsRef<Path>, session_id: &str) -> Result<Self, StorageError> {
        let valid = !session_id.is_empty()
            && session_id.len() <= 128
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidSession(session_id.to_string()));
        }

        Ok(Self {
            path: dir.as_ref().join(format!("cart-{session_id}.json")),
        })
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn load(&self) -> Result<Vec<CartLine>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => LocalSnapshot::decode(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, lines: &[CartLine]) -> Result<(), StorageError> {
        let encoded = LocalSnapshot::encode(lines)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, encoded).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// MemoryLocalStore
// =============================================================================

/// In-process snapshot store.
///
/// Holds the serialized blob (not the lines) so it exercises the same encode
/// and decode path as the file store. Writes can be made to fail to simulate a
/// full or blocked browser store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    blob: Mutex<Option<String>>,
    fail_writes: AtomicBool,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save`/`clear` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The raw stored blob, if any.
    #[must_use]
    pub fn raw(&self) -> Option<String> {
        self.blob
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Returns true if no snapshot is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw().is_none()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("quota exceeded".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn load(&self) -> Result<Vec<CartLine>, StorageError> {
        self.raw()
            .map_or_else(|| Ok(Vec::new()), |raw| LocalSnapshot::decode(&raw))
    }

    async fn save(&self, lines: &[CartLine]) -> Result<(), StorageError> {
        self.check_writable()?;
        let encoded = LocalSnapshot::encode(lines)?;
        *self
            .blob
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(encoded);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check_writable()?;
        *self
            .blob
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use naked_pineapple_core::{CurrencyCode, Price};

    use super::*;

    fn line(variant: &str, quantity: u32) -> CartLine {
        CartLine::new(
            variant,
            "p-1",
            "Tee",
            Price::from_minor(1500, CurrencyCode::USD),
            quantity,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::new(dir.path(), "sess-1").unwrap();

        assert!(store.load().await.unwrap().is_empty());

        store.save(&[line("v-1", 2), line("v-2", 1)]).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!store.temp_path().exists());

        store.save(&[line("v-2", 4)]).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![line("v-2", 4)]);

        store.clear().await.unwrap();
        assert!(!store.path().exists());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_stores_are_scoped_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileLocalStore::new(dir.path(), "tab-a").unwrap();
        let second = FileLocalStore::new(dir.path(), "tab-b").unwrap();

        first.save(&[line("v-1", 1)]).await.unwrap();
        assert!(second.load().await.unwrap().is_empty());
    }

    #[test]
    fn test_file_store_rejects_path_like_session() {
        assert!(matches!(
            FileLocalStore::new("/tmp", "../etc/passwd"),
            Err(StorageError::InvalidSession(_))
        ));
        assert!(FileLocalStore::new("/tmp", "").is_err());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::new(dir.path(), "sess-1").unwrap();
        tokio::fs::write(store.path(), "{not json").await.unwrap();
        assert!(matches!(store.load().await, Err(StorageError::Encoding(_))));
    }

    #[tokio::test]
    async fn test_unknown_version_is_rejected() {
        let store = MemoryLocalStore::new();
        store.save(&[line("v-1", 1)]).await.unwrap();
        let raw = store.raw().unwrap().replace("\"version\":1", "\"version\":99");
        *store.blob.lock().unwrap() = Some(raw);
        assert!(matches!(
            store.load().await,
            Err(StorageError::UnsupportedVersion(99))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_write_failure() {
        let store = MemoryLocalStore::new();
        store.save(&[line("v-1", 1)]).await.unwrap();
        store.set_fail_writes(true);

        assert!(store.save(&[line("v-1", 5)]).await.is_err());
        assert!(store.clear().await.is_err());
        assert_eq!(store.load().await.unwrap(), vec![line("v-1", 1)]);
    }
}

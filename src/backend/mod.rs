//! Key-value persistence behind the record store.
//!
//! Values are opaque bytes. The store decides what goes in them (encrypted
//! envelopes, the installation salt, plaintext audit entries).

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Storage quota exceeded on {backend}: {detail}")]
    QuotaExceeded { backend: &'static str, detail: String },

    #[error("Backend {backend} unavailable: {reason}")]
    Unavailable { backend: &'static str, reason: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },
}

impl BackendError {
    /// Errors that switch the store onto its fallback backend.
    pub fn is_fallback_trigger(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. } | Self::Unavailable { .. })
    }

    /// Errors worth retrying: busy, locked or I/O failures. A full store
    /// stays full, and other SQLite errors fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Best-effort storage usage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
}

impl StorageEstimate {
    pub fn usage_ratio(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 1.0;
        }
        self.usage_bytes as f64 / self.quota_bytes as f64
    }
}

/// Asynchronous key-value store.
///
/// Implementations must be cheap to share: the record store holds one
/// handle, and opening a second store on the same data clones it.
#[allow(async_fn_in_trait)]
pub trait KvBackend: Send + Sync {
    /// Short label used in logs and events.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// All keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// `None` when the backend cannot tell.
    async fn estimate(&self) -> Option<StorageEstimate> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_and_outage_trigger_fallback() {
        let quota = BackendError::QuotaExceeded { backend: "memory", detail: "full".into() };
        let outage = BackendError::Unavailable { backend: "sqlite", reason: "locked".into() };
        assert!(quota.is_fallback_trigger());
        assert!(outage.is_fallback_trigger());
        assert!(!quota.is_transient());
        assert!(outage.is_transient());
    }

    #[test]
    fn migration_failure_is_terminal() {
        let err = BackendError::MigrationFailed { version: 1, reason: "bad sql".into() };
        assert!(!err.is_fallback_trigger());
        assert!(!err.is_transient());
    }

    #[test]
    fn usage_ratio() {
        let estimate = StorageEstimate { usage_bytes: 80, quota_bytes: 100 };
        assert!((estimate.usage_ratio() - 0.8).abs() < f64::EPSILON);
        let empty_quota = StorageEstimate { usage_bytes: 0, quota_bytes: 0 };
        assert_eq!(empty_quota.usage_ratio(), 1.0);
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BackendError, KvBackend, StorageEstimate};

const BACKEND_NAME: &str = "memory";

/// In-process key-value store. Used as the degraded-mode fallback and as a
/// primary in tests. Clones share the same entries.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, Vec<u8>>,
    quota_bytes: Option<u64>,
}

impl MemoryState {
    fn usage(&self) -> u64 {
        self.entries
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push total key+value bytes past `quota_bytes`.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                entries: BTreeMap::new(),
                quota_bytes: Some(quota_bytes),
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, BackendError> {
        self.inner.lock().map_err(|_| BackendError::Unavailable {
            backend: BACKEND_NAME,
            reason: "state lock poisoned".into(),
        })
    }
}

impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.lock()?.entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        if let Some(quota) = state.quota_bytes {
            let replaced = state
                .entries
                .get(key)
                .map(|old| (key.len() + old.len()) as u64)
                .unwrap_or(0);
            let projected = state.usage() - replaced + (key.len() + value.len()) as u64;
            if projected > quota {
                return Err(BackendError::QuotaExceeded {
                    backend: BACKEND_NAME,
                    detail: format!("{projected} of {quota} bytes"),
                });
            }
        }
        state.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.lock()?.entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn estimate(&self) -> Option<StorageEstimate> {
        let state = self.lock().ok()?;
        let quota_bytes = state.quota_bytes?;
        Some(StorageEstimate { usage_bytes: state.usage(), quota_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let backend = MemoryBackend::new();
        backend.set("patient_a", b"one".to_vec()).await.unwrap();
        assert_eq!(backend.get("patient_a").await.unwrap().unwrap(), b"one");
        backend.delete("patient_a").await.unwrap();
        assert!(backend.get("patient_a").await.unwrap().is_none());
        backend.delete("patient_a").await.unwrap();
    }

    #[tokio::test]
    async fn list_keys_filters_by_prefix_in_order() {
        let backend = MemoryBackend::new();
        for key in ["patient_b", "audit_1", "patient_a", "patientx", "vault_salt"] {
            backend.set(key, vec![0]).await.unwrap();
        }
        let keys = backend.list_keys("patient_").await.unwrap();
        assert_eq!(keys, vec!["patient_a", "patient_b"]);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let backend = MemoryBackend::new();
        let other = backend.clone();
        backend.set("k", vec![1]).await.unwrap();
        assert_eq!(other.get("k").await.unwrap(), Some(vec![1]));
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn quota_rejects_oversized_write() {
        let backend = MemoryBackend::with_quota(16);
        backend.set("k", vec![0; 10]).await.unwrap();
        let err = backend.set("j", vec![0; 10]).await.unwrap_err();
        assert!(matches!(err, BackendError::QuotaExceeded { .. }));
        // Overwriting in place only counts the difference
        backend.set("k", vec![0; 15]).await.unwrap();
    }

    #[tokio::test]
    async fn estimate_reports_usage_only_with_quota() {
        assert!(MemoryBackend::new().estimate().await.is_none());
        let backend = MemoryBackend::with_quota(100);
        backend.set("abcd", vec![0; 6]).await.unwrap();
        let estimate = backend.estimate().await.unwrap();
        assert_eq!(estimate.usage_bytes, 10);
        assert_eq!(estimate.quota_bytes, 100);
    }
}

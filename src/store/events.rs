//! Lifecycle events for observers (UI, diagnostics).
//!
//! Events carry record ids and counts only. Delivery is best-effort: with no
//! subscriber, or a lagging one, events are dropped rather than blocking the
//! store.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ErrorReport;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    Saved { id: String, version: u32, fallback: bool },
    Loaded { id: String, from_cache: bool },
    Deleted { id: String },
    BackupCreated { id: String, backup_key: String },
    BatchProgress { completed: usize, total: usize, failed: usize },
    FallbackActivated { backend: String, reason: String },
    QuotaWarning { usage_ratio: f64 },
    Exported { record_count: usize, size_bytes: u64 },
    Imported { imported: usize, skipped: usize, failed: usize },
    Migrated { migrated: usize, failed: usize },
    Error { id: Option<String>, report: ErrorReport },
}

pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: StoreEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

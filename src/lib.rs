pub mod backend;
pub mod config;
pub mod crypto;
pub mod error;
pub mod models;
pub mod store;
pub mod validation;

pub use backend::{BackendError, KvBackend, MemoryBackend, SqliteBackend};
pub use config::StoreConfig;
pub use error::{ErrorKind, ErrorReport, StoreError};
pub use models::{AuditAction, AuditLogEntry, ConflictStrategy, PatientRecord, RecordMetadata};
pub use store::{
    BatchReport, DeleteOptions, LoadOptions, MigrationReport, RecordStore, SaveOptions,
    SearchCriteria, SearchOptions, SearchPage, StoreEvent,
};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::{BackendError, KvBackend, StorageEstimate};

const BACKEND_NAME: &str = "sqlite";

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS schema_version (
             version INTEGER PRIMARY KEY,
             applied_at TEXT NOT NULL DEFAULT (datetime('now'))
         );
         CREATE TABLE IF NOT EXISTS kv_store (
             key TEXT PRIMARY KEY NOT NULL,
             value BLOB NOT NULL,
             updated_at TEXT NOT NULL DEFAULT (datetime('now'))
         );
         INSERT INTO schema_version (version) VALUES (1);",
    ),
];

/// Persistent primary backend: one `kv_store` table in a SQLite file.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    quota_bytes: Option<u64>,
}

impl SqliteBackend {
    /// Open a SQLite file at the given path and run migrations
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Cap the database file size; writes beyond it fail with `QuotaExceeded`.
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    fn init(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA busy_timeout=2000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            quota_bytes: None,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, BackendError> {
        self.conn.lock().map_err(|_| BackendError::Unavailable {
            backend: BACKEND_NAME,
            reason: "connection lock poisoned".into(),
        })
    }

    fn usage_bytes(conn: &Connection) -> Result<u64, BackendError> {
        let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((pages.max(0) as u64) * (page_size.max(0) as u64))
    }
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), BackendError> {
    let current_version = get_current_version(conn);

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            tracing::info!("Running migration v{version}");
            conn.execute_batch(sql).map_err(|e| BackendError::MigrationFailed {
                version: *version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, i64>(0)
    })
    .unwrap_or(0)
}

/// Map SQLite failures onto the store's fallback/retry classes.
fn classify(err: rusqlite::Error) -> BackendError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => BackendError::QuotaExceeded {
            backend: BACKEND_NAME,
            detail: err.to_string(),
        },
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::ReadOnly,
        ) => BackendError::Unavailable {
            backend: BACKEND_NAME,
            reason: err.to_string(),
        },
        _ => BackendError::Sqlite(err),
    }
}

impl KvBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let conn = self.lock()?;
        conn.query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .optional()
        .map_err(classify)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        let conn = self.lock()?;
        if let Some(quota) = self.quota_bytes {
            let projected = Self::usage_bytes(&conn)? + (key.len() + value.len()) as u64;
            if projected > quota {
                return Err(BackendError::QuotaExceeded {
                    backend: BACKEND_NAME,
                    detail: format!("{projected} of {quota} bytes"),
                });
            }
        }
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )
        .map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])
            .map_err(classify)?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT key FROM kv_store
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )
            .map_err(classify)?;
        let keys = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;
        Ok(keys)
    }

    async fn estimate(&self) -> Option<StorageEstimate> {
        let quota_bytes = self.quota_bytes?;
        let conn = self.lock().ok()?;
        let usage_bytes = Self::usage_bytes(&conn).ok()?;
        Some(StorageEstimate { usage_bytes, quota_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_overwrite_delete() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.set("patient_a", b"v1".to_vec()).await.unwrap();
        backend.set("patient_a", b"v2".to_vec()).await.unwrap();
        assert_eq!(backend.get("patient_a").await.unwrap().unwrap(), b"v2");
        backend.delete("patient_a").await.unwrap();
        assert!(backend.get("patient_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_keys_matches_literal_prefix() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for key in ["patient_2", "patient_1", "patient%x", "backup_patient_1_5", "audit_1"] {
            backend.set(key, vec![1]).await.unwrap();
        }
        // `%` and `_` are not wildcards here
        assert_eq!(
            backend.list_keys("patient_").await.unwrap(),
            vec!["patient_1", "patient_2"]
        );
        assert_eq!(backend.list_keys("patient%").await.unwrap(), vec!["patient%x"]);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intake.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.set("vault_salt", vec![7; 32]).await.unwrap();
        }
        let reopened = SqliteBackend::open(&path).unwrap();
        assert_eq!(reopened.get("vault_salt").await.unwrap(), Some(vec![7; 32]));
    }

    #[test]
    fn migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn), 1);
    }

    #[tokio::test]
    async fn quota_blocks_writes_past_the_cap() {
        let backend = SqliteBackend::open_in_memory().unwrap().with_quota(1);
        let err = backend.set("patient_a", vec![0; 64]).await.unwrap_err();
        assert!(matches!(err, BackendError::QuotaExceeded { .. }));
        let estimate = backend.estimate().await.unwrap();
        assert_eq!(estimate.quota_bytes, 1);
        assert!(estimate.usage_bytes > 0);
    }

    #[test]
    fn only_busy_and_io_failures_are_retried() {
        let failure = |code| rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None);

        let busy = classify(failure(rusqlite::ffi::SQLITE_BUSY));
        assert!(matches!(busy, BackendError::Unavailable { .. }));
        assert!(busy.is_transient());
        assert!(classify(failure(rusqlite::ffi::SQLITE_IOERR)).is_transient());

        let constraint = classify(failure(rusqlite::ffi::SQLITE_CONSTRAINT));
        assert!(matches!(constraint, BackendError::Sqlite(_)));
        assert!(!constraint.is_transient());
        assert!(!classify(rusqlite::Error::InvalidQuery).is_transient());
        assert!(!classify(failure(rusqlite::ffi::SQLITE_FULL)).is_transient());
    }

    #[tokio::test]
    async fn estimate_unknown_without_quota() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(backend.estimate().await.is_none());
    }
}

//! Encrypted record store.
//!
//! `RecordStore` is the only writer to its backend. Every record goes
//! through the same pipeline on the way in (validate, stamp, encrypt, write)
//! and the reverse on the way out (read, decrypt, validate). Decrypted
//! records live only in the bounded cache and in the values returned to the
//! caller.
//!
//! Backend writes are retried on transient failures. When retries run out
//! with a quota or availability error, the store switches to an in-memory
//! fallback and keeps serving. Fallback data is not copied back to the
//! primary.

pub mod cache;
pub mod events;
pub mod quota;
pub mod retry;
pub mod search;
pub mod transfer;

pub use cache::{CacheStats, RecordCache};
pub use events::{EventBus, StoreEvent};
pub use quota::QuotaStatus;
pub use search::{Condition, SearchCriteria, SearchOptions, SearchPage};
pub use transfer::{
    ExportEnvelope, ExportMetadata, ImportOptions, ImportPayload, ImportReport, ItemError,
    SealedExportMetadata,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use zeroize::Zeroizing;

use crate::backend::{BackendError, KvBackend, MemoryBackend};
use crate::config::StoreConfig;
use crate::crypto::{load_or_create_salt, EncryptedEnvelope, RecordKey};
use crate::error::{ErrorKind, StoreError};
use crate::models::{AuditAction, AuditLogEntry, ConflictStrategy, PatientRecord};
use crate::validation::{self, FieldIssue, Problem, ValidationError};

use retry::with_retry;

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Copy the current ciphertext to a timestamped backup key first.
    pub backup: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Skip the cache for both lookup and insertion.
    pub bypass_cache: bool,
    /// Bump `accessCount`/`lastAccessed` and write the record back.
    pub track_access: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { bypass_cache: false, track_access: true }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    pub backup: bool,
}

/// Outcome of `save_many`. Failures never abort the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
}

pub struct RecordStore<B: KvBackend> {
    primary: B,
    fallback: MemoryBackend,
    degraded: AtomicBool,
    cache: Mutex<RecordCache>,
    events: EventBus,
    config: StoreConfig,
    key: RecordKey,
}

impl<B: KvBackend> RecordStore<B> {
    /// Open a store on `backend`, creating the installation salt on first use.
    pub async fn open(backend: B, config: StoreConfig, passphrase: &str) -> Result<Self, StoreError> {
        config.validate()?;
        let salt = load_or_create_salt(&backend).await?;
        let key = RecordKey::derive_blocking(
            Zeroizing::new(passphrase.to_string()),
            salt,
            config.kdf_iterations,
        )
        .await?;

        tracing::info!(
            backend = backend.name(),
            cache_capacity = config.cache_capacity,
            "Record store opened"
        );

        Ok(Self {
            primary: backend,
            fallback: MemoryBackend::new(),
            degraded: AtomicBool::new(false),
            cache: Mutex::new(RecordCache::new(config.cache_capacity)),
            events: EventBus::new(),
            config,
            key,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// True once a write has landed on the in-memory fallback.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache().stats()
    }

    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    // ─── Record CRUD ────────────────────────────────────────

    /// Validate, encrypt and persist `record` under `id`.
    ///
    /// Returns the record as stored, with timestamps and metadata stamped.
    pub async fn save(
        &self,
        id: &str,
        record: PatientRecord,
        options: SaveOptions,
    ) -> Result<PatientRecord, StoreError> {
        let result = self.save_inner(id, record, options, Some(AuditAction::Save)).await;
        self.report_failure(Some(id), result)
    }

    pub async fn load(&self, id: &str, options: LoadOptions) -> Result<Option<PatientRecord>, StoreError> {
        let result = self.load_inner(id, options).await;
        self.report_failure(Some(id), result)
    }

    /// Merge `patch` into the stored record and save it.
    pub async fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<PatientRecord, StoreError> {
        let result = async {
            let mut record = self
                .peek(id)
                .await?
                .ok_or_else(|| StoreError::not_found(id))?;
            record.apply_patch(patch)?;
            self.save_inner(id, record, SaveOptions::default(), Some(AuditAction::Update))
                .await
        }
        .await;
        self.report_failure(Some(id), result)
    }

    pub async fn delete(&self, id: &str, options: DeleteOptions) -> Result<(), StoreError> {
        let result = self.delete_inner(id, options).await;
        self.report_failure(Some(id), result)
    }

    async fn save_inner(
        &self,
        id: &str,
        mut record: PatientRecord,
        options: SaveOptions,
        audit: Option<AuditAction>,
    ) -> Result<PatientRecord, StoreError> {
        match quota::check(&self.primary, &self.config.quota).await {
            QuotaStatus::Exceeded(ratio) => {
                return Err(ErrorKind::QuotaExceeded(format!(
                    "{} is {:.0}% full",
                    self.primary.name(),
                    ratio * 100.0
                ))
                .into());
            }
            QuotaStatus::Warning(ratio) => {
                tracing::warn!(backend = self.primary.name(), usage_ratio = ratio, "Storage nearly full");
                self.events.emit(StoreEvent::QuotaWarning { usage_ratio: ratio });
            }
            QuotaStatus::Ok(_) | QuotaStatus::Unknown => {}
        }

        if record.id != id {
            return Err(ValidationError {
                issues: vec![FieldIssue { field: "id".into(), problem: Problem::Mismatch }],
            }
            .into());
        }
        validation::validate_for_write(&record)?;

        let storage_key = self.record_key(id);
        let existing = self.fetch(id).await?;

        if options.backup {
            if let Some((bytes, _)) = &existing {
                self.write_backup(id, bytes.clone()).await?;
            }
        }

        let previous = existing.map(|(_, record)| record);
        record.stamp_for_write(previous.as_ref(), &self.config.schema_version, Utc::now());

        let bytes = self.encode(id, &record)?;
        let fallback = self.write(&storage_key, bytes).await?;

        self.cache().put(&storage_key, record.clone());
        let version = record.metadata.as_ref().map_or(1, |m| m.version);
        tracing::debug!(record_id = %id, version, fallback, "Record saved");
        self.events.emit(StoreEvent::Saved { id: id.to_string(), version, fallback });

        if let Some(action) = audit {
            let action = match (action, previous.is_some()) {
                (AuditAction::Save, true) => AuditAction::Update,
                (action, _) => action,
            };
            self.audit(action, Some(id), None).await;
        }
        Ok(record)
    }

    async fn load_inner(&self, id: &str, options: LoadOptions) -> Result<Option<PatientRecord>, StoreError> {
        let storage_key = self.record_key(id);

        let cached = if options.bypass_cache {
            None
        } else {
            self.cache().get(&storage_key)
        };
        let from_cache = cached.is_some();
        let mut record = match cached {
            Some(record) => record,
            None => match self.fetch(id).await? {
                Some((_, record)) => record,
                None => return Ok(None),
            },
        };

        if options.track_access {
            record.touch(&self.config.schema_version, Utc::now());
            // Write-on-read is best-effort; the caller still gets the record.
            let persisted = match self.encode(id, &record) {
                Ok(bytes) => self.write(&storage_key, bytes).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = persisted {
                tracing::warn!(record_id = %id, error = %e, "Failed to persist access metadata");
            }
        }

        if !options.bypass_cache {
            self.cache().put(&storage_key, record.clone());
        }
        self.events.emit(StoreEvent::Loaded { id: id.to_string(), from_cache });
        Ok(Some(record))
    }

    async fn delete_inner(&self, id: &str, options: DeleteOptions) -> Result<(), StoreError> {
        let storage_key = self.record_key(id);
        let Some(bytes) = self.read(&storage_key).await? else {
            return Err(StoreError::not_found(id));
        };

        if options.backup {
            self.write_backup(id, bytes).await?;
        }

        self.remove(&storage_key).await?;
        self.cache().remove(&storage_key);

        tracing::debug!(record_id = %id, "Record deleted");
        self.events.emit(StoreEvent::Deleted { id: id.to_string() });
        self.audit(AuditAction::Delete, Some(id), None).await;
        Ok(())
    }

    // ─── Bulk operations ────────────────────────────────────

    /// Save records in chunks of `batch_chunk_size`. Chunks run one after
    /// another, records within a chunk concurrently.
    pub async fn save_many(&self, records: Vec<PatientRecord>, options: SaveOptions) -> BatchReport {
        let total = records.len();
        let report = self.save_chunked(records, options, Some(AuditAction::Save)).await;
        tracing::info!(total, successful = report.successful, failed = report.failed, "Batch save finished");
        report
    }

    /// Shared by `save_many` and `import_all`. Emits `BatchProgress` after
    /// every chunk.
    async fn save_chunked(
        &self,
        records: Vec<PatientRecord>,
        options: SaveOptions,
        audit: Option<AuditAction>,
    ) -> BatchReport {
        let total = records.len();
        let mut report = BatchReport::default();

        for chunk in records.chunks(self.config.batch_chunk_size) {
            let results = join_all(chunk.iter().map(|record| async move {
                let result = self.save_inner(&record.id, record.clone(), options, audit).await;
                self.report_failure(Some(&record.id), result)
            }))
            .await;

            for (record, result) in chunk.iter().zip(results) {
                match result {
                    Ok(_) => report.successful += 1,
                    Err(e) => {
                        report.failed += 1;
                        report.errors.push(ItemError { id: Some(record.id.clone()), error: e.report() });
                    }
                }
            }

            self.events.emit(StoreEvent::BatchProgress {
                completed: report.successful + report.failed,
                total,
                failed: report.failed,
            });
        }
        report
    }

    /// Every readable record, keyed by id. Bypasses the cache and does not
    /// count as an access. Unreadable records are skipped and reported as
    /// `Error` events.
    pub async fn load_all(&self) -> Result<BTreeMap<String, PatientRecord>, StoreError> {
        let keys = self.list_keys(&self.config.record_prefix).await?;
        let mut records = BTreeMap::new();

        for key in keys {
            let Some(id) = key.strip_prefix(&self.config.record_prefix) else {
                continue;
            };
            match self.fetch(id).await {
                Ok(Some((_, record))) => {
                    records.insert(id.to_string(), record);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(record_id = %id, code = e.code(), "Skipping unreadable record");
                    self.events.emit(StoreEvent::Error { id: Some(id.to_string()), report: e.report() });
                }
            }
        }
        Ok(records)
    }

    pub async fn search(&self, criteria: &SearchCriteria, options: &SearchOptions) -> Result<SearchPage, StoreError> {
        let records = self.load_all().await?.into_values().collect();
        search::run(records, criteria, options)
    }

    // ─── Import / export ────────────────────────────────────

    pub async fn export_all(&self) -> Result<ExportEnvelope, StoreError> {
        let records: Vec<PatientRecord> = self.load_all().await?.into_values().collect();
        let envelope = ExportEnvelope::new(records, &self.config.schema_version);

        let size_bytes = serde_json::to_vec(&envelope)?.len() as u64;
        if transfer::check_size(size_bytes, &self.config.export)? == transfer::SizeStatus::Warning {
            tracing::warn!(size_bytes, limit = self.config.export.warn_bytes, "Export is unusually large");
        }

        let record_count = envelope.patients.len();
        tracing::info!(record_count, size_bytes, "Exported records");
        self.events.emit(StoreEvent::Exported { record_count, size_bytes });
        self.audit(AuditAction::Export, None, Some(format!("{record_count} records"))).await;
        Ok(envelope)
    }

    /// Apply the conflict strategy to every incoming record, then save the
    /// survivors through the chunked batch path. `BatchProgress` counts only
    /// those survivors. Failures are collected, never fatal. Importing an
    /// export of this store changes nothing under `KeepNewer`.
    pub async fn import_all(&self, payload: ImportPayload, options: ImportOptions) -> ImportReport {
        let mut report = ImportReport {
            warnings: payload.warnings(&self.config.schema_version),
            ..Default::default()
        };
        for warning in &report.warnings {
            tracing::warn!(warning = %warning, "Import metadata");
        }

        let mut accepted = Vec::new();
        for raw in payload.records {
            let id = raw.get("id").and_then(Value::as_str).map(str::to_string);
            match self.import_candidate(raw, options.conflict).await {
                Ok(Some(record)) => accepted.push(record),
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(ItemError { id, error: e.report() });
                }
            }
        }

        let batch = self.save_chunked(accepted, SaveOptions::default(), None).await;
        report.imported = batch.successful;
        report.failed += batch.failed;
        report.errors.extend(batch.errors);

        tracing::info!(
            imported = report.imported,
            skipped = report.skipped,
            failed = report.failed,
            "Import finished"
        );
        self.events.emit(StoreEvent::Imported {
            imported: report.imported,
            skipped: report.skipped,
            failed: report.failed,
        });
        self.audit(
            AuditAction::Import,
            None,
            Some(format!("{} imported, {} skipped, {} failed", report.imported, report.skipped, report.failed)),
        )
        .await;
        report
    }

    /// `Ok(None)` when the conflict strategy keeps the stored record.
    async fn import_candidate(
        &self,
        raw: Value,
        strategy: ConflictStrategy,
    ) -> Result<Option<PatientRecord>, StoreError> {
        let incoming: PatientRecord = serde_json::from_value(raw)?;
        validation::validate_for_write(&incoming)?;

        if let Some(existing) = self.peek(&incoming.id).await? {
            if !transfer::should_replace(&existing, &incoming, strategy) {
                return Ok(None);
            }
        }
        Ok(Some(incoming))
    }

    /// Export every record into a passphrase-encrypted file.
    pub async fn seal_export(&self, passphrase: &str) -> Result<Vec<u8>, StoreError> {
        let envelope = self.export_all().await?;
        transfer::seal(&envelope, passphrase, self.config.kdf_iterations).await
    }

    pub async fn open_sealed_export(&self, bytes: &[u8], passphrase: &str) -> Result<ExportEnvelope, StoreError> {
        transfer::open_sealed(bytes, passphrase).await
    }

    /// Move plaintext JSON records stored under `legacy_prefix` in `source`
    /// into this store. Migrated legacy keys are removed; failed ones stay.
    ///
    /// `source` must not be this store's own backend with `legacy_prefix`
    /// equal to the record prefix.
    pub async fn migrate_legacy<S: KvBackend>(
        &self,
        source: &S,
        legacy_prefix: &str,
    ) -> Result<MigrationReport, StoreError> {
        let keys = source
            .list_keys(legacy_prefix)
            .await
            .map_err(|e| StoreError::new(ErrorKind::Migration(e.to_string())))?;

        let mut report = MigrationReport::default();
        for key in keys {
            let legacy_id = key.strip_prefix(legacy_prefix).unwrap_or(&key).to_string();
            match self.migrate_one(source, &key, &legacy_id).await {
                Ok(()) => report.migrated += 1,
                Err(e) => {
                    tracing::warn!(legacy_key = %key, code = e.code(), "Legacy record not migrated");
                    report.failed += 1;
                    report.errors.push(ItemError { id: Some(legacy_id), error: e.report() });
                }
            }
        }

        tracing::info!(migrated = report.migrated, failed = report.failed, "Legacy migration finished");
        self.events.emit(StoreEvent::Migrated { migrated: report.migrated, failed: report.failed });
        if report.migrated > 0 {
            self.audit(AuditAction::Migrate, None, Some(format!("{} records", report.migrated))).await;
        }
        Ok(report)
    }

    async fn migrate_one<S: KvBackend>(&self, source: &S, key: &str, legacy_id: &str) -> Result<(), StoreError> {
        let bytes = source
            .get(key)
            .await?
            .ok_or_else(|| StoreError::not_found(legacy_id))?;

        let mut value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::corrupted(legacy_id, e.to_string()))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| StoreError::corrupted(legacy_id, "legacy value is not an object"))?;
        object
            .entry("id")
            .or_insert_with(|| Value::String(legacy_id.to_string()));
        if !object.contains_key("createdAt") && !object.contains_key("dateCreated") {
            object.insert("createdAt".into(), serde_json::to_value(Utc::now())?);
        }

        let record: PatientRecord = serde_json::from_value(value)?;
        let id = record.id.clone();
        self.save_inner(&id, record, SaveOptions::default(), None).await?;

        if let Err(e) = source.delete(key).await {
            tracing::warn!(legacy_key = %key, error = %e, "Migrated record left behind in legacy store");
        }
        Ok(())
    }

    // ─── Backups ────────────────────────────────────────────

    /// Backup keys for `id`, oldest first.
    pub async fn list_backups(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let prefix = self.backup_prefix_for(id);
        let keys = self.list_keys(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter(|key| is_backup_suffix(&key[prefix.len()..]))
            .collect())
    }

    /// Save the record held in `backup_key` as the current version of `id`.
    /// The version being replaced is backed up first.
    pub async fn restore_backup(&self, id: &str, backup_key: &str) -> Result<PatientRecord, StoreError> {
        let result = async {
            let belongs = backup_key
                .strip_prefix(&self.backup_prefix_for(id))
                .is_some_and(is_backup_suffix);
            if !belongs {
                return Err(StoreError::not_found(backup_key));
            }
            let bytes = self
                .read(backup_key)
                .await?
                .ok_or_else(|| StoreError::not_found(backup_key))?;
            let record = self.decode(id, &bytes)?;
            self.save_inner(id, record, SaveOptions { backup: true }, Some(AuditAction::Restore))
                .await
        }
        .await;
        self.report_failure(Some(id), result)
    }

    async fn write_backup(&self, id: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let backup_key = format!("{}{}", self.backup_prefix_for(id), Utc::now().timestamp_millis());
        self.write(&backup_key, bytes).await?;
        tracing::debug!(record_id = %id, backup_key = %backup_key, "Backup created");
        self.events.emit(StoreEvent::BackupCreated { id: id.to_string(), backup_key });
        Ok(())
    }

    // ─── Audit trail ────────────────────────────────────────

    async fn audit(&self, action: AuditAction, subject_id: Option<&str>, detail: Option<String>) {
        if !self.config.audit_enabled {
            return;
        }
        let entry = AuditLogEntry::new(action, subject_id, detail);
        let result = match serde_json::to_vec(&entry) {
            Ok(bytes) => self.write(&entry.storage_key(&self.config.audit_prefix), bytes).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(action = %action, error = %e, "Failed to write audit entry");
        }
    }

    /// Audit entries, oldest first.
    pub async fn audit_trail(&self) -> Result<Vec<AuditLogEntry>, StoreError> {
        let keys = self.list_keys(&self.config.audit_prefix).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.read(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<AuditLogEntry>(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(audit_key = %key, error = %e, "Skipping unreadable audit entry"),
            }
        }
        // Keys only order to the millisecond.
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    /// Drop audit entries older than `retention_days`. Returns how many were
    /// removed.
    pub async fn prune_audit_log(&self, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - Duration::days(i64::from(retention_days))).timestamp_millis();
        let prefix = &self.config.audit_prefix;
        let keys = self.list_keys(prefix).await?;

        let mut removed = 0;
        for key in keys {
            let millis = key[prefix.len()..]
                .split('_')
                .next()
                .and_then(|m| m.parse::<i64>().ok());
            if millis.is_some_and(|m| m < cutoff) {
                self.remove(&key).await?;
                removed += 1;
            }
        }
        tracing::info!(removed, retention_days, "Pruned audit log");
        Ok(removed)
    }

    // ─── Internals ──────────────────────────────────────────

    fn cache(&self) -> MutexGuard<'_, RecordCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}{id}", self.config.record_prefix)
    }

    fn backup_prefix_for(&self, id: &str) -> String {
        format!("{}{id}_", self.config.backup_prefix)
    }

    fn report_failure<T>(&self, id: Option<&str>, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(e) = &result {
            tracing::debug!(record_id = ?id, code = e.code(), "Store operation failed");
            self.events.emit(StoreEvent::Error { id: id.map(str::to_string), report: e.report() });
        }
        result
    }

    /// Ciphertexts are bound to their record id.
    fn encode(&self, id: &str, record: &PatientRecord) -> Result<Vec<u8>, StoreError> {
        let json = Zeroizing::new(serde_json::to_vec(record)?);
        Ok(self.key.encrypt(&json, id.as_bytes())?.to_bytes())
    }

    fn decode(&self, id: &str, bytes: &[u8]) -> Result<PatientRecord, StoreError> {
        let envelope = EncryptedEnvelope::from_bytes(bytes)?;
        let json = Zeroizing::new(self.key.decrypt(&envelope, id.as_bytes())?);
        let value: Value = serde_json::from_slice(&json).map_err(|e| StoreError::corrupted(id, e.to_string()))?;
        validation::validate_for_read(value, id)
    }

    /// Raw bytes and decoded record for `id`, straight from the backend.
    async fn fetch(&self, id: &str) -> Result<Option<(Vec<u8>, PatientRecord)>, StoreError> {
        let Some(bytes) = self.read(&self.record_key(id)).await? else {
            return Ok(None);
        };
        let record = self.decode(id, &bytes)?;
        Ok(Some((bytes, record)))
    }

    /// Current record without counting an access.
    async fn peek(&self, id: &str) -> Result<Option<PatientRecord>, StoreError> {
        let cached = self.cache().get(&self.record_key(id));
        if cached.is_some() {
            return Ok(cached);
        }
        Ok(self.fetch(id).await?.map(|(_, record)| record))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if self.is_degraded() {
            if let Some(bytes) = self.fallback.get(key).await? {
                return Ok(Some(bytes));
            }
        }
        let primary = &self.primary;
        Ok(with_retry(&self.config.retry, "get", move || primary.get(key)).await?)
    }

    /// Returns whether the write landed on the fallback.
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<bool, StoreError> {
        let primary = &self.primary;
        let attempt = {
            let bytes = bytes.clone();
            with_retry(&self.config.retry, "set", move || primary.set(key, bytes.clone())).await
        };

        match attempt {
            Ok(()) => {
                if self.is_degraded() {
                    // The primary now holds the newer copy.
                    self.fallback.delete(key).await?;
                }
                Ok(false)
            }
            Err(e) if e.is_fallback_trigger() => {
                self.activate_fallback(&e);
                match self.fallback.set(key, bytes).await {
                    Ok(()) => Ok(true),
                    Err(fallback_err) => {
                        Err(StoreError::from(e).annotate(format!("fallback write failed: {fallback_err}")))
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let primary = &self.primary;
        with_retry(&self.config.retry, "delete", move || primary.delete(key)).await?;
        if self.is_degraded() {
            self.fallback.delete(key).await?;
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let primary = &self.primary;
        let listed = with_retry(&self.config.retry, "list_keys", move || primary.list_keys(prefix)).await;
        if !self.is_degraded() {
            return Ok(listed?);
        }

        let mut keys: BTreeSet<String> = match listed {
            Ok(keys) => keys.into_iter().collect(),
            Err(e) if e.is_fallback_trigger() => {
                tracing::warn!(backend = primary.name(), error = %e, "Listing fallback keys only");
                BTreeSet::new()
            }
            Err(e) => return Err(e.into()),
        };
        keys.extend(self.fallback.list_keys(prefix).await?);
        Ok(keys.into_iter().collect())
    }

    fn activate_fallback(&self, error: &BackendError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                backend = self.primary.name(),
                error = %error,
                "Primary backend failing, switching to in-memory fallback"
            );
            self.events.emit(StoreEvent::FallbackActivated {
                backend: self.primary.name().to_string(),
                reason: error.to_string(),
            });
        }
    }
}

/// Backup keys end in `<id>_<millis>`. Requiring digits after the id keeps
/// backups of `a_1` out of the listing for `a`.
fn is_backup_suffix(suffix: &str) -> bool {
    !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit())
}

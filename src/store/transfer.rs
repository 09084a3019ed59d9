//! Export/import document formats.
//!
//! Plain exports are JSON: `{metadata: {...}, patients: [...]}`. Imports
//! accept that envelope or a bare array of records. Sealed exports wrap the
//! same JSON in an encrypted container:
//!
//! ```text
//! [8-byte magic][u32 LE metadata length][metadata JSON][iv + ciphertext]
//! ```
//!
//! The metadata block is readable without the passphrase and carries the
//! salt used to derive the export key.

use std::io::{Cursor, Read};

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::config::{ExportLimits, APP_VERSION};
use crate::crypto::{generate_salt, EncryptedEnvelope, RecordKey, SALT_LENGTH};
use crate::error::{ErrorKind, ErrorReport, StoreError};
use crate::models::{ConflictStrategy, PatientRecord};

const SEALED_MAGIC: &[u8; 8] = b"INTAKEV\x01";
const SEALED_FORMAT_VERSION: u32 = 1;
const MAX_SEALED_METADATA_BYTES: usize = 64 * 1024;
/// Accepted `kdfIterations` range when opening a sealed export.
const SEALED_KDF_ITERATIONS: std::ops::RangeInclusive<u32> = 1_000..=10_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub export_timestamp: DateTime<Utc>,
    pub record_count: usize,
    pub schema_version: String,
    #[serde(default)]
    pub app_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEnvelope {
    pub metadata: ExportMetadata,
    pub patients: Vec<PatientRecord>,
}

impl ExportEnvelope {
    pub fn new(patients: Vec<PatientRecord>, schema_version: &str) -> Self {
        Self {
            metadata: ExportMetadata {
                export_timestamp: Utc::now(),
                record_count: patients.len(),
                schema_version: schema_version.to_string(),
                app_version: Some(APP_VERSION.to_string()),
            },
            patients,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeStatus {
    Ok,
    Warning,
}

/// Reject exports above `max_bytes`, flag those above `warn_bytes`.
pub fn check_size(size_bytes: u64, limits: &ExportLimits) -> Result<SizeStatus, StoreError> {
    if size_bytes > limits.max_bytes {
        return Err(ErrorKind::ExportTooLarge { size_bytes, limit_bytes: limits.max_bytes }.into());
    }
    if size_bytes > limits.warn_bytes {
        return Ok(SizeStatus::Warning);
    }
    Ok(SizeStatus::Ok)
}

/// Import metadata is read leniently: every field may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMetadata {
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub record_count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    metadata: ImportMetadata,
    patients: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawPayload {
    Envelope(RawEnvelope),
    Bare(Vec<Value>),
}

/// A parsed import document. Records stay as raw JSON so one malformed
/// entry fails alone instead of sinking the whole file.
#[derive(Debug, Clone)]
pub struct ImportPayload {
    pub metadata: Option<ImportMetadata>,
    pub records: Vec<Value>,
}

impl ImportPayload {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw: RawPayload = serde_json::from_slice(bytes)?;
        Ok(raw.into())
    }

    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        let raw: RawPayload = serde_json::from_value(value)?;
        Ok(raw.into())
    }

    /// Warnings about the document itself (never fatal).
    pub fn warnings(&self, expected_schema: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(metadata) = &self.metadata {
            match metadata.schema_version.as_deref() {
                Some(v) if v == expected_schema => {}
                Some(v) => warnings.push(format!(
                    "schema version {v} differs from {expected_schema}; importing anyway"
                )),
                None => warnings.push("export metadata has no schema version".into()),
            }
            if let Some(count) = metadata.record_count {
                if count != self.records.len() {
                    warnings.push(format!(
                        "metadata lists {count} records but file contains {}",
                        self.records.len()
                    ));
                }
            }
        }
        warnings
    }
}

impl From<RawPayload> for ImportPayload {
    fn from(raw: RawPayload) -> Self {
        match raw {
            RawPayload::Envelope(env) => Self { metadata: Some(env.metadata), records: env.patients },
            RawPayload::Bare(records) => Self { metadata: None, records },
        }
    }
}

impl From<ExportEnvelope> for ImportPayload {
    fn from(envelope: ExportEnvelope) -> Self {
        let records = envelope
            .patients
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        Self {
            metadata: Some(ImportMetadata {
                schema_version: Some(envelope.metadata.schema_version),
                record_count: Some(envelope.metadata.record_count),
            }),
            records,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub conflict: ConflictStrategy,
}

/// Per-item failure in a batch, import or migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemError {
    pub id: Option<String>,
    pub error: ErrorReport,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<ItemError>,
}

/// Whether an incoming record should replace the stored one.
pub fn should_replace(existing: &PatientRecord, incoming: &PatientRecord, strategy: ConflictStrategy) -> bool {
    match strategy {
        ConflictStrategy::Overwrite => true,
        ConflictStrategy::Skip => false,
        ConflictStrategy::KeepNewer => match (existing.updated_at, incoming.updated_at) {
            (Some(stored), Some(new)) => new > stored,
            (None, Some(_)) => true,
            (_, None) => false,
        },
    }
}

// ═══════════════════════════════════════════════════════════
// Sealed exports
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedExportMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    pub app_version: String,
    /// Base64-encoded salt for key derivation on open.
    pub salt_b64: String,
    pub kdf_iterations: u32,
}

fn malformed(reason: impl Into<String>) -> StoreError {
    StoreError::corrupted("sealed-export", reason)
}

/// Encrypt an export under a fresh salt derived from `passphrase`.
pub async fn seal(
    envelope: &ExportEnvelope,
    passphrase: &str,
    kdf_iterations: u32,
) -> Result<Vec<u8>, StoreError> {
    let salt = generate_salt();
    let key = RecordKey::derive_blocking(Zeroizing::new(passphrase.to_string()), salt, kdf_iterations).await?;

    let metadata = SealedExportMetadata {
        version: SEALED_FORMAT_VERSION,
        created_at: Utc::now(),
        record_count: envelope.patients.len(),
        app_version: APP_VERSION.to_string(),
        salt_b64: base64::engine::general_purpose::STANDARD.encode(salt),
        kdf_iterations,
    };

    // The header travels in the clear; sealing under it detects edits.
    let metadata_json = serde_json::to_vec(&metadata)?;
    let plaintext = Zeroizing::new(serde_json::to_vec(envelope)?);
    let payload = key.encrypt(&plaintext, &metadata_json)?.to_bytes();

    let mut out = Vec::with_capacity(SEALED_MAGIC.len() + 4 + metadata_json.len() + payload.len());
    out.extend_from_slice(SEALED_MAGIC);
    out.extend_from_slice(&(metadata_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&metadata_json);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Parsed metadata plus its raw bytes, which the payload is sealed under.
fn read_header(cursor: &mut Cursor<&[u8]>) -> Result<(SealedExportMetadata, Vec<u8>), StoreError> {
    let mut magic = [0u8; 8];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| malformed("file too short"))?;
    if &magic != SEALED_MAGIC {
        return Err(malformed("not a sealed intake export"));
    }

    let mut len_bytes = [0u8; 4];
    cursor
        .read_exact(&mut len_bytes)
        .map_err(|_| malformed("truncated header"))?;
    let metadata_len = u32::from_le_bytes(len_bytes) as usize;
    if metadata_len > MAX_SEALED_METADATA_BYTES {
        return Err(malformed("metadata block too large"));
    }

    let mut metadata_bytes = vec![0u8; metadata_len];
    cursor
        .read_exact(&mut metadata_bytes)
        .map_err(|_| malformed("truncated metadata"))?;
    let metadata: SealedExportMetadata = serde_json::from_slice(&metadata_bytes)?;
    Ok((metadata, metadata_bytes))
}

/// Read the unencrypted metadata block only.
pub fn preview_sealed(bytes: &[u8]) -> Result<SealedExportMetadata, StoreError> {
    read_header(&mut Cursor::new(bytes)).map(|(metadata, _)| metadata)
}

/// Decrypt a sealed export. A wrong passphrase is a `CRYPTO_ERROR`.
pub async fn open_sealed(bytes: &[u8], passphrase: &str) -> Result<ExportEnvelope, StoreError> {
    let mut cursor = Cursor::new(bytes);
    let (metadata, header) = read_header(&mut cursor)?;
    if metadata.version > SEALED_FORMAT_VERSION {
        return Err(malformed(format!("format version {} is newer than supported", metadata.version)));
    }
    if !SEALED_KDF_ITERATIONS.contains(&metadata.kdf_iterations) {
        return Err(malformed(format!("implausible kdf iteration count {}", metadata.kdf_iterations)));
    }

    let salt_bytes = base64::engine::general_purpose::STANDARD
        .decode(&metadata.salt_b64)
        .map_err(|e| malformed(format!("invalid salt: {e}")))?;
    let salt: [u8; SALT_LENGTH] = salt_bytes
        .try_into()
        .map_err(|_| malformed("invalid salt length"))?;

    let mut payload = Vec::new();
    cursor
        .read_to_end(&mut payload)
        .map_err(|_| malformed("truncated payload"))?;
    let encrypted = EncryptedEnvelope::from_bytes(&payload)?;

    let key = RecordKey::derive_blocking(Zeroizing::new(passphrase.to_string()), salt, metadata.kdf_iterations).await?;
    let plaintext = Zeroizing::new(key.decrypt(&encrypted, &header)?);
    Ok(serde_json::from_slice(&plaintext)?)
}

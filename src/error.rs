//! Store-level error type.
//!
//! Every failure surfaced by the record store carries a stable code and the
//! time it happened, so callers can branch on `code()` without parsing text.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::crypto::{CryptoError, SaltError};
use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Stored record {id} is corrupted: {reason}")]
    DataCorruption { id: String, reason: String },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Legacy migration failed: {0}")]
    Migration(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid search criteria: {0}")]
    InvalidQuery(String),

    #[error("Export of {size_bytes} bytes exceeds the {limit_bytes} byte limit")]
    ExportTooLarge { size_bytes: u64, limit_bytes: u64 },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::DataCorruption { .. } => "DATA_CORRUPTION",
            Self::Crypto(_) => "CRYPTO_ERROR",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::ExportTooLarge { .. } => "EXPORT_TOO_LARGE",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<BackendError> for ErrorKind {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::QuotaExceeded { .. } => Self::QuotaExceeded(e.to_string()),
            other => Self::BackendUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: ErrorKind,
    pub occurred_at: DateTime<Utc>,
    pub note: Option<String>,
}

impl StoreError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, occurred_at: Utc::now(), note: None }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Attach context without replacing the original error.
    pub fn annotate(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn not_found(id: &str) -> Self {
        ErrorKind::NotFound(id.to_string()).into()
    }

    pub fn corrupted(id: &str, reason: impl Into<String>) -> Self {
        ErrorKind::DataCorruption { id: id.to_string(), reason: reason.into() }.into()
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
            timestamp: self.occurred_at,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.kind)?;
        if let Some(note) = &self.note {
            write!(f, " ({note})")?;
        }
        Ok(())
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

macro_rules! into_store_error {
    ($($source:ty),+ $(,)?) => {
        $(
            impl From<$source> for StoreError {
                fn from(e: $source) -> Self {
                    Self::new(e.into())
                }
            }
        )+
    };
}

impl From<ErrorKind> for StoreError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

into_store_error!(ValidationError, CryptoError, BackendError, ConfigError, serde_json::Error);

impl From<SaltError> for StoreError {
    fn from(e: SaltError) -> Self {
        match e {
            SaltError::Backend(e) => e.into(),
            SaltError::Crypto(e) => e.into(),
        }
    }
}

/// Serializable snapshot of an error, for events and batch reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::crypto::PBKDF2_ITERATIONS;

/// Application-level constants
pub const APP_NAME: &str = "IntakeVault";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version written into record metadata and export envelopes.
pub const SCHEMA_VERSION: &str = "1.0";

/// Get the application data directory (~/IntakeVault/)
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Default SQLite data file for the CLI
pub fn default_db_path() -> PathBuf {
    app_data_dir().join("intake.db")
}

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "intake_vault=info,warn"
}

/// Install the global fmt subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Bounded exponential backoff for backend writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 100, max_delay_ms: 2_000 }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Storage usage thresholds checked before every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    pub warn_ratio: f64,
    pub reject_ratio: f64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self { warn_ratio: 0.80, reject_ratio: 0.95 }
    }
}

/// Size guards for generated export documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportLimits {
    pub warn_bytes: u64,
    pub max_bytes: u64,
}

impl Default for ExportLimits {
    fn default() -> Self {
        Self { warn_bytes: 10 * 1024 * 1024, max_bytes: 50 * 1024 * 1024 }
    }
}

/// Everything a `RecordStore` is built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub record_prefix: String,
    pub backup_prefix: String,
    pub audit_prefix: String,
    pub cache_capacity: usize,
    pub batch_chunk_size: usize,
    pub retry: RetryPolicy,
    pub quota: QuotaPolicy,
    pub export: ExportLimits,
    pub schema_version: String,
    /// PBKDF2 rounds. Lower only in test harnesses.
    pub kdf_iterations: u32,
    /// Write-ahead audit entries for save/delete/import/export.
    pub audit_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            record_prefix: "patient_".into(),
            backup_prefix: "backup_patient_".into(),
            audit_prefix: "audit_".into(),
            cache_capacity: 50,
            batch_chunk_size: 10,
            retry: RetryPolicy::default(),
            quota: QuotaPolicy::default(),
            export: ExportLimits::default(),
            schema_version: SCHEMA_VERSION.into(),
            kdf_iterations: PBKDF2_ITERATIONS,
            audit_enabled: true,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl StoreConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.record_prefix.is_empty() {
            return Err(ConfigError::Invalid("record_prefix must not be empty".into()));
        }
        // A record key must never be listed as a backup or audit key, and the
        // other way round.
        for other in [&self.backup_prefix, &self.audit_prefix] {
            if other.starts_with(&self.record_prefix) || self.record_prefix.starts_with(other.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "prefix {other:?} overlaps record prefix {:?}",
                    self.record_prefix
                )));
            }
        }
        if self.cache_capacity == 0 || self.batch_chunk_size == 0 {
            return Err(ConfigError::Invalid("cache_capacity and batch_chunk_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.quota.warn_ratio)
            || !(0.0..=1.0).contains(&self.quota.reject_ratio)
            || self.quota.warn_ratio > self.quota.reject_ratio
        {
            return Err(ConfigError::Invalid("quota ratios must satisfy 0 <= warn <= reject <= 1".into()));
        }
        if self.export.warn_bytes > self.export.max_bytes {
            return Err(ConfigError::Invalid("export.warn_bytes exceeds export.max_bytes".into()));
        }
        if self.kdf_iterations < 1_000 {
            return Err(ConfigError::Invalid("kdf_iterations must be at least 1000".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with(APP_NAME));
        assert!(default_db_path().starts_with(app_data_dir()));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn defaults_are_valid() {
        let config = StoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.kdf_iterations, 600_000);
        assert_eq!(config.schema_version, "1.0");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_attempts: 5, base_delay_ms: 100, max_delay_ms: 350 };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"cache_capacity": 5, "retry": {"max_attempts": 7}}"#).unwrap();
        let config = StoreConfig::from_file(&path).unwrap();
        assert_eq!(config.cache_capacity, 5);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.record_prefix, "patient_");
    }

    #[test]
    fn overlapping_prefixes_rejected() {
        let config = StoreConfig { backup_prefix: "patient_bak_".into(), ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn inverted_quota_ratios_rejected() {
        let config = StoreConfig {
            quota: QuotaPolicy { warn_ratio: 0.9, reject_ratio: 0.5 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

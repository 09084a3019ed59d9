//! intake-vault operator CLI
//!
//! Works against a SQLite data file. The vault passphrase is read from
//! `INTAKE_VAULT_PASSPHRASE`.
//!
//! Usage:
//!   intake-vault export <file> [--sealed]
//!   intake-vault import <file> [--conflict keep_newer|overwrite|skip]
//!   intake-vault list
//!   intake-vault search '<criteria json>' [--limit N] [--offset N] [--sort-by path] [--descending]
//!   intake-vault audit [--prune-days N]

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use intake_vault::config::{self, StoreConfig};
use intake_vault::store::transfer;
use intake_vault::store::{ImportOptions, ImportPayload};
use intake_vault::{ConflictStrategy, RecordStore, SearchCriteria, SearchOptions, SqliteBackend};

#[derive(Parser)]
#[command(name = "intake-vault")]
#[command(version)]
#[command(about = "Inspect, export and import an encrypted intake record vault", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite data file (defaults to ~/IntakeVault/intake.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON store configuration; missing fields take defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, env = "INTAKE_VAULT_PASSPHRASE", hide_env_values = true, hide = true)]
    passphrase: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Write every record to an export file
    Export {
        output: PathBuf,

        /// Encrypt the export with INTAKE_VAULT_EXPORT_PASSPHRASE
        #[arg(long)]
        sealed: bool,

        #[arg(long, env = "INTAKE_VAULT_EXPORT_PASSPHRASE", hide_env_values = true, hide = true)]
        export_passphrase: Option<String>,
    },

    /// Import records from a plain or sealed export file
    Import {
        input: PathBuf,

        /// keep_newer, overwrite or skip
        #[arg(long, default_value = "keep_newer")]
        conflict: ConflictStrategy,

        #[arg(long, env = "INTAKE_VAULT_EXPORT_PASSPHRASE", hide_env_values = true, hide = true)]
        export_passphrase: Option<String>,
    },

    /// List stored record ids
    List,

    /// Search records with a JSON criteria object
    Search {
        criteria: String,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value = "0")]
        offset: usize,

        /// Dotted field path, e.g. patientInfo.age
        #[arg(long)]
        sort_by: Option<String>,

        #[arg(long)]
        descending: bool,
    },

    /// Print the audit trail
    Audit {
        /// Remove entries older than this many days first
        #[arg(long)]
        prune_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    config::init_tracing();
    let cli = Cli::parse();

    let store_config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };

    let db_path = cli.db.clone().unwrap_or_else(config::default_db_path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let backend = SqliteBackend::open(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    let store = RecordStore::open(backend, store_config, &cli.passphrase).await?;
    tracing::debug!(db = %db_path.display(), "Vault opened");

    let output: Value = match cli.command {
        Commands::Export { output, sealed, export_passphrase } => {
            let (bytes, record_count) = if sealed {
                let Some(secret) = export_passphrase else {
                    bail!("--sealed needs INTAKE_VAULT_EXPORT_PASSPHRASE");
                };
                let bytes = store.seal_export(&secret).await?;
                let count = transfer::preview_sealed(&bytes)?.record_count;
                (bytes, count)
            } else {
                let envelope = store.export_all().await?;
                let count = envelope.patients.len();
                (serde_json::to_vec_pretty(&envelope)?, count)
            };
            fs::write(&output, &bytes)
                .with_context(|| format!("writing {}", output.display()))?;
            json!({
                "file": output.display().to_string(),
                "records": record_count,
                "bytes": bytes.len(),
                "sealed": sealed,
            })
        }
        Commands::Import { input, conflict, export_passphrase } => {
            let bytes = fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let payload = if transfer::preview_sealed(&bytes).is_ok() {
                let Some(secret) = export_passphrase else {
                    bail!("{} is sealed; set INTAKE_VAULT_EXPORT_PASSPHRASE", input.display());
                };
                ImportPayload::from(store.open_sealed_export(&bytes, &secret).await?)
            } else {
                ImportPayload::from_slice(&bytes)?
            };
            let report = store.import_all(payload, ImportOptions { conflict }).await;
            serde_json::to_value(report)?
        }
        Commands::List => {
            let records = store.load_all().await?;
            let rows: Vec<Value> = records
                .values()
                .map(|r| {
                    json!({
                        "id": r.id,
                        "updatedAt": r.updated_at,
                        "version": r.metadata.as_ref().map(|m| m.version),
                    })
                })
                .collect();
            Value::Array(rows)
        }
        Commands::Search { criteria, limit, offset, sort_by, descending } => {
            let criteria: Value = serde_json::from_str(&criteria).context("criteria must be JSON")?;
            let criteria = SearchCriteria::from_json(&criteria)?;
            let options = SearchOptions { limit, offset, sort_by, descending };
            serde_json::to_value(store.search(&criteria, &options).await?)?
        }
        Commands::Audit { prune_days } => {
            if let Some(days) = prune_days {
                let removed = store.prune_audit_log(days).await?;
                eprintln!("Pruned {removed} audit entries");
            }
            serde_json::to_value(store.audit_trail().await?)?
        }
    };

    if store.is_degraded() {
        eprintln!("warning: primary storage failed during this run; some writes were not persisted");
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_import_conflict_strategy() {
        let cli = Cli::try_parse_from([
            "intake-vault",
            "--passphrase",
            "pw",
            "import",
            "in.json",
            "--conflict",
            "overwrite",
        ])
        .unwrap();
        match cli.command {
            Commands::Import { conflict, .. } => assert_eq!(conflict, ConflictStrategy::Overwrite),
            _ => panic!("expected import"),
        }
    }
}

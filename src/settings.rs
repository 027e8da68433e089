//! Configuration loading: defaults, then an optional file, then `VISUALIMG__*` env vars.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{IngestError, Result};

const CONFIG_FILE: &str = "config/ingest";
const ENV_PREFIX: &str = "VISUALIMG";

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub data_dir: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_upload_bytes: u64,
    pub ledger: LedgerConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub file_name: String,
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub default_limit: usize,
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl IngestConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(&self.ledger.file_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(IngestError::Validation("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(IngestError::Validation(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.ledger.file_name.trim().is_empty() {
            return Err(IngestError::Validation(
                "ledger.file_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            workers: 3,
            queue_capacity: 100,
            max_upload_bytes: 50 * 1024 * 1024,
            ledger: LedgerConfig {
                file_name: "index.md".to_string(),
                lock_timeout_ms: 30_000,
            },
            search: SearchConfig { default_limit: 10 },
        }
    }
}

/// Load from `config/ingest.*` in the working directory if present.
pub fn load() -> Result<IngestConfig> {
    load_from(None)
}

/// Load with an explicit config file, which must exist when given.
pub fn load_from(path: Option<&Path>) -> Result<IngestConfig> {
    let defaults = IngestConfig::default();
    let mut builder = Config::builder()
        .set_default(
            "data_dir",
            defaults.data_dir.to_string_lossy().to_string(),
        )?
        .set_default("workers", defaults.workers as i64)?
        .set_default("queue_capacity", defaults.queue_capacity as i64)?
        .set_default("max_upload_bytes", defaults.max_upload_bytes as i64)?
        .set_default("ledger.file_name", defaults.ledger.file_name.clone())?
        .set_default("ledger.lock_timeout_ms", defaults.ledger.lock_timeout_ms as i64)?
        .set_default("search.default_limit", defaults.search.default_limit as i64)?;

    builder = match path {
        Some(path) => builder.add_source(File::from(path).required(true)),
        None => builder.add_source(File::with_name(CONFIG_FILE).required(false)),
    };

    let cfg: IngestConfig = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    cfg.validate()?;
    Ok(cfg)
}

//! Configuration loading for the bulk index action.
//!
//! Layered config: defaults -> config file -> explicit file -> env vars.
//! Config file at ~/.config/bulk-index/config.toml; env vars use the
//! `BULK_` prefix (e.g. `BULK_FLUSH_INTERVAL_SECS=5`).

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::BulkError;

/// Settings of one index action pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexActionSettings {
    /// Action name the pipeline serves; completion events are filtered on it
    #[serde(default = "default_action_name")]
    pub action_name: String,

    /// Byte ceiling of one sub-request produced by the batch builder
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,

    /// Byte threshold that triggers a flush of the submission buffer
    #[serde(default = "default_bulk_size_bytes")]
    pub bulk_size_bytes: usize,

    /// Operation-count threshold that triggers a flush of the submission buffer
    #[serde(default = "default_bulk_actions")]
    pub bulk_actions: usize,

    /// Periodic flush and checkpoint interval
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Partitions of the stream between builder and submitter
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Initial retry delay of the submission buffer
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Number of retries of a rejected submission
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Log indexing failures instead of aborting the submitter
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_action_name() -> String {
    "index".to_string()
}

fn default_batch_max_bytes() -> usize {
    900_000
}

fn default_bulk_size_bytes() -> usize {
    5_242_880
}

fn default_bulk_actions() -> usize {
    1_000
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_partitions() -> usize {
    4
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IndexActionSettings {
    fn default() -> Self {
        Self {
            action_name: default_action_name(),
            batch_max_bytes: default_batch_max_bytes(),
            bulk_size_bytes: default_bulk_size_bytes(),
            bulk_actions: default_bulk_actions(),
            flush_interval_secs: default_flush_interval_secs(),
            partitions: default_partitions(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
            continue_on_failure: false,
            log_level: default_log_level(),
        }
    }
}

impl IndexActionSettings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/bulk-index/config.toml)
    /// 3. Explicit config file (optional)
    /// 4. Environment variables (BULK_*)
    pub fn load(config_path: Option<&str>) -> Result<Self, BulkError> {
        let config_dir = ProjectDirs::from("", "", "bulk-index")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("action_name", default_action_name())
            .map_err(|e| BulkError::Config(e.to_string()))?
            .set_default("batch_max_bytes", default_batch_max_bytes() as i64)
            .map_err(|e| BulkError::Config(e.to_string()))?
            .set_default("bulk_size_bytes", default_bulk_size_bytes() as i64)
            .map_err(|e| BulkError::Config(e.to_string()))?
            .set_default("bulk_actions", default_bulk_actions() as i64)
            .map_err(|e| BulkError::Config(e.to_string()))?
            .set_default("flush_interval_secs", default_flush_interval_secs() as i64)
            .map_err(|e| BulkError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| BulkError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Single underscores belong to field names, so nested keys are not used here
        builder = builder.add_source(Environment::with_prefix("BULK").try_parsing(true));

        let settings: Self = builder
            .build()
            .map_err(|e| BulkError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| BulkError::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), BulkError> {
        if self.action_name.is_empty() {
            return Err(BulkError::Config("action_name must not be empty".to_string()));
        }
        if self.batch_max_bytes == 0 {
            return Err(BulkError::Config("batch_max_bytes must be > 0".to_string()));
        }
        if self.bulk_size_bytes == 0 || self.bulk_actions == 0 {
            return Err(BulkError::Config(
                "bulk_size_bytes and bulk_actions must be > 0".to_string(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(BulkError::Config("flush_interval_secs must be > 0".to_string()));
        }
        if self.partitions == 0 {
            return Err(BulkError::Config("partitions must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

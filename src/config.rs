//! Process configuration - loaded once from the environment (and `.env`)

use crate::error::{Result, SyncError};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings shared by the connector layer, the data store and the CLI.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory for parquet spills of ingested batches
    pub data_dir: PathBuf,

    /// Maximum number of batches resident in memory
    pub max_in_memory_datasets: usize,

    /// Whether ingested batches are also written to disk
    pub persist_datasets: bool,

    /// Where incremental sync state is saved between runs
    pub state_file: PathBuf,

    /// JSON file holding configured connectors
    pub connectors_file: PathBuf,

    /// Base delay of the exponential retry backoff
    pub retry_base_delay: Duration,

    /// Timeout applied to every network/database request
    pub request_timeout: Duration,

    /// Connection pool size for SQL sources
    pub sql_pool_size: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/datasets"),
            max_in_memory_datasets: 10,
            persist_datasets: true,
            state_file: PathBuf::from("data/sync_state.json"),
            connectors_file: PathBuf::from("connectors.json"),
            retry_base_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            sql_pool_size: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_in_memory_datasets: usize =
            parse_var(&lookup, "SYNC_MAX_IN_MEMORY_DATASETS", defaults.max_in_memory_datasets)?;
        if max_in_memory_datasets == 0 {
            return Err(SyncError::Configuration(
                "SYNC_MAX_IN_MEMORY_DATASETS must be at least 1".to_string(),
            ));
        }

        let retry_ms: u64 = parse_var(
            &lookup,
            "SYNC_RETRY_BASE_DELAY_MS",
            defaults.retry_base_delay.as_millis() as u64,
        )?;
        let timeout_secs: u64 = parse_var(
            &lookup,
            "SYNC_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        )?;

        Ok(Self {
            data_dir: lookup("SYNC_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            max_in_memory_datasets,
            persist_datasets: parse_var(&lookup, "SYNC_PERSIST_DATASETS", defaults.persist_datasets)?,
            state_file: lookup("SYNC_STATE_FILE").map(PathBuf::from).unwrap_or(defaults.state_file),
            connectors_file: lookup("SYNC_CONNECTORS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.connectors_file),
            retry_base_delay: Duration::from_millis(retry_ms),
            request_timeout: Duration::from_secs(timeout_secs),
            sql_pool_size: parse_var(&lookup, "SYNC_SQL_POOL_SIZE", defaults.sql_pool_size)?,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| {
            SyncError::Configuration(format!("Invalid value '{}' for {}: {}", raw, key, e))
        }),
    }
}

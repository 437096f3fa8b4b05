use crate::storage::{ChunkCodec, DEFAULT_ITEM_SIZE};
use crate::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub table_name: String,
    pub path: String,
    #[serde(default)]
    pub lock_table: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-region endpoint overrides, keyed by region name
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    /// Regions holding replicas of the lock table
    #[serde(default)]
    pub replica_regions: Vec<String>,
    /// Days to keep archived versions. 0 keeps them forever, -1 disables
    /// archiving.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub compression: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_true")]
    pub global_table_health_check: bool,
    #[serde(default)]
    pub polling: PollingConfig,
}

fn default_retention_days() -> i64 {
    -1
}

fn default_chunk_size() -> usize {
    DEFAULT_ITEM_SIZE
}

fn default_true() -> bool {
    true
}

/// Timing of the retry and replication loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_consistency_timeout_ms")]
    pub consistency_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub chain_read_interval_ms: u64,
    /// Upper bound on waiting for replicas to agree; unbounded when unset
    #[serde(default)]
    pub replication_timeout_ms: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_consistency_timeout_ms() -> u64 {
    10_000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            consistency_timeout_ms: default_consistency_timeout_ms(),
            chain_read_interval_ms: default_poll_interval_ms(),
            replication_timeout_ms: None,
        }
    }
}

impl PollingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn consistency_timeout(&self) -> Duration {
        Duration::from_millis(self.consistency_timeout_ms)
    }

    pub fn chain_read_interval(&self) -> Duration {
        Duration::from_millis(self.chain_read_interval_ms)
    }

    pub fn replication_timeout(&self) -> Option<Duration> {
        self.replication_timeout_ms.map(Duration::from_millis)
    }
}

impl StoreConfig {
    pub fn new(table_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            path: path.into(),
            lock_table: None,
            region: None,
            endpoint: None,
            endpoints: HashMap::new(),
            replica_regions: Vec::new(),
            retention_days: default_retention_days(),
            compression: false,
            chunk_size: default_chunk_size(),
            global_table_health_check: true,
            polling: PollingConfig::default(),
        }
    }

    /// Load from a file, with `DYNASTATE_*` environment variables taking
    /// precedence. Nested keys use `__`, e.g. `DYNASTATE_POLLING__POLL_INTERVAL_MS`.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("DYNASTATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| StateError::Config(e.to_string()))?;

        let config: StoreConfig = settings
            .try_deserialize()
            .map_err(|e| StateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_name("table_name", &self.table_name)?;
        if self.path.trim().is_empty() {
            return Err(StateError::config("path cannot be empty"));
        }
        if let Some(lock_table) = &self.lock_table {
            check_name("lock_table", lock_table)?;
        }

        if self.retention_days < -1 {
            return Err(StateError::config(format!(
                "retention_days must be -1 or greater, got {}",
                self.retention_days
            )));
        }

        if !self.replica_regions.is_empty() {
            if self.lock_table.is_none() {
                return Err(StateError::config(
                    "replica_regions requires a lock_table",
                ));
            }
            if self.region.as_deref().unwrap_or_default().trim().is_empty() {
                return Err(StateError::config(
                    "region is required when replica_regions are set",
                ));
            }
        }

        ChunkCodec::new(self.compression, self.chunk_size)?;
        Ok(())
    }

    /// Key of the lock record, and prefix of the digest record
    pub fn lock_path(&self) -> String {
        format!("{}/{}", self.table_name, self.path)
    }

    pub fn codec(&self) -> Result<ChunkCodec> {
        ChunkCodec::new(self.compression, self.chunk_size)
    }

    /// Endpoint for `region`, preferring the per-region override
    pub fn endpoint_for(&self, region: &str) -> Option<&str> {
        self.endpoints
            .get(region)
            .map(String::as_str)
            .or(self.endpoint.as_deref())
            .filter(|endpoint| !endpoint.trim().is_empty())
    }
}

fn check_name(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StateError::config(format!("{} cannot be empty", field)));
    }
    if value.contains('/') || value.contains('=') {
        return Err(StateError::config(format!(
            "{} must not contain '/' nor '=', got {:?}",
            field, value
        )));
    }
    Ok(())
}

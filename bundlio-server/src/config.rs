use bundlio_core::{
    AggregateLimits, BackendBuilder, BundlioError, DEFAULT_MAX_ATTEMPTS, DEFAULT_VISIBILITY_TIMEOUT,
    Result,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    pub storage: StorageConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    pub marketplace: MarketplaceConfig,
    pub oracle: OracleConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// Store and queue backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[serde(default)]
    pub namespace: Option<String>,
    pub redis: Option<RedisConfig>,
    /// SQLite file for deal tracking. Deals are kept in memory when unset.
    #[serde(default)]
    pub tracker_db_path: Option<PathBuf>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds a taken queue message may go unacknowledged before redelivery.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

impl StorageConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("bundlio")
    }

    pub fn backend_builder(&self) -> BackendBuilder {
        let mut builder = BackendBuilder::new()
            .backend(self.backend.as_str())
            .namespace(self.namespace_or_default())
            .max_attempts(self.max_attempts)
            .visibility_timeout(Duration::from_secs(self.visibility_timeout_secs));
        if let Some(redis) = self.redis.as_ref() {
            builder = builder.redis_url(redis.url.clone());
        }
        if let Some(path) = self.tracker_db_path.as_ref() {
            builder = builder.tracker_db_path(path.clone());
        }
        builder
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_visibility_timeout_secs() -> u64 {
    DEFAULT_VISIBILITY_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Redis,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_max_aggregate_size")]
    pub max_aggregate_size: u64,
    #[serde(default = "default_min_aggregate_size")]
    pub min_aggregate_size: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_aggregate_size: default_max_aggregate_size(),
            min_aggregate_size: default_min_aggregate_size(),
        }
    }
}

impl AggregationConfig {
    pub fn limits(&self) -> Result<AggregateLimits> {
        AggregateLimits::new(self.max_aggregate_size, self.min_aggregate_size)
    }
}

fn default_max_aggregate_size() -> u64 {
    2u64.pow(34)
}

fn default_min_aggregate_size() -> u64 {
    2u64.pow(34) / 2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    pub endpoint: String,
    pub issuer: String,
    pub audience: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub url: String,
    #[serde(default = "default_oracle_interval_secs")]
    pub interval_secs: u64,
}

fn default_oracle_interval_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("BUNDLIO"))
            .build()
            .map_err(|e| BundlioError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BundlioError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.aggregation.limits()?;
        if self.workers.batch_size == 0 {
            return Err(BundlioError::Config(
                "workers.batch_size must be positive".to_string(),
            ));
        }
        if self.workers.poll_interval_ms == 0 {
            return Err(BundlioError::Config(
                "workers.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.storage.visibility_timeout_secs == 0 {
            return Err(BundlioError::Config(
                "storage.visibility_timeout_secs must be positive".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Redis && self.storage.redis.is_none() {
            return Err(BundlioError::Config(
                "storage.redis is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}

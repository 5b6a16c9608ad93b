use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

use crate::transfer::consumer::CommitPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub use_json: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default)]
    pub http: HttpConfig,
    /// Absent: jobs and accounts live in memory
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Absent: in-memory cache and broker
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Seed accounts for the in-memory account directory
    #[serde(default)]
    pub dev_accounts: Vec<DevAccount>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_file() -> String {
    "transfer_jobs.log".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub expiration_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiration_secs: 300,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
    /// Redis Streams when `redis_url` is set, memory otherwise
    #[default]
    Auto,
    Memory,
    Redis,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    pub partitions: u32,
    pub group_id: String,
    pub consumer_name: String,
    pub auto_commit: bool,
    pub poll_block_ms: u64,
    pub poll_batch: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Auto,
            partitions: 4,
            group_id: "transfer_jobs".to_string(),
            consumer_name: "transfer_jobs-1".to_string(),
            auto_commit: false,
            poll_block_ms: 1000,
            poll_batch: 64,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub create_transaction_url: String,
    /// Provider transfer id is appended verbatim
    pub get_transaction_url: String,
    /// Queried with `bank_id`, `account_name` and `account_number`
    pub get_bank_account_url: String,
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            create_transaction_url: "http://localhost:9090/transactions".to_string(),
            get_transaction_url: "http://localhost:9090/transactions/".to_string(),
            get_bank_account_url: "http://localhost:9090/bank-accounts".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    pub topic: String,
    pub page_limit: i64,
    /// Pending jobs older than this are failed by the sweep
    pub job_active_duration_secs: u64,
    /// Sweep ignores jobs younger than this
    pub min_job_age_secs: u64,
    pub commit_policy: CommitPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            topic: "transfer".to_string(),
            page_limit: 10,
            job_active_duration_secs: 3600,
            min_job_age_secs: 60,
            commit_policy: CommitPolicy::Always,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    pub get_transfer_callback: SweepConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SweepConfig {
    pub name: String,
    pub interval_secs: u64,
    /// Rows read per batch; one pass covers the whole window
    pub limit: i64,
    /// Days before today included in the window (0 = today only)
    pub lookback_days: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            name: "get_transfer_callback".to_string(),
            interval_secs: 60,
            limit: 100,
            lookback_days: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DevAccount {
    pub id: i64,
    pub name: String,
    pub api_key: String,
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.topic.is_empty() {
            return Err(ConfigError::Invalid("transfer.topic is empty".into()));
        }
        if self.transfer.page_limit <= 0 {
            return Err(ConfigError::Invalid("transfer.page_limit must be > 0".into()));
        }
        if self.scheduler.get_transfer_callback.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.get_transfer_callback.interval_secs must be > 0".into(),
            ));
        }
        if self.scheduler.get_transfer_callback.lookback_days < 0 {
            return Err(ConfigError::Invalid(
                "scheduler.get_transfer_callback.lookback_days must be >= 0".into(),
            ));
        }
        if self.bus.partitions == 0 {
            return Err(ConfigError::Invalid("bus.partitions must be > 0".into()));
        }
        if self.bus.backend == BusBackend::Redis && self.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "bus.backend is redis but redis_url is not set".into(),
            ));
        }
        Ok(())
    }

    /// Broker actually used after resolving `Auto`
    pub fn bus_backend(&self) -> BusBackend {
        match self.bus.backend {
            BusBackend::Auto if self.redis_url.is_some() => BusBackend::Redis,
            BusBackend::Auto => BusBackend::Memory,
            other => other,
        }
    }
}

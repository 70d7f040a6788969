use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::fee::DEFAULT_PLATFORM_FEE;
use crate::money::Amount;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    /// PostgreSQL connection URL for the ledger store
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub fees: FeesConfig,
    /// Notification recipient for operator alerts (flagged funds, exhausted payouts)
    #[serde(default = "default_operator_id")]
    pub operator_id: String,
}

fn default_operator_id() -> String {
    "operators".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub queue_size: usize,
}

/// Event ingestion worker pool
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IngestionConfig {
    pub workers: usize,
    /// Times a premature event is re-queued before it is parked in the inbox
    pub max_deferrals: u32,
    pub defer_delay_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_deferrals: 10,
            defer_delay_ms: 500,
        }
    }
}

impl IngestionConfig {
    pub fn defer_delay(&self) -> Duration {
        Duration::from_millis(self.defer_delay_ms)
    }
}

/// Payout dispatcher retry policy
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DispatcherConfig {
    /// Attempts per fund record per kind (transfer/refund)
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Scan period for dispatches interrupted by a crash or outage
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
    /// A held fund must be idle this long before recovery touches it
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_recovery_interval_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    60
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            recovery_interval_secs: default_recovery_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Non-terminal records younger than this are left alone
    pub grace_period_secs: u64,
    pub batch_size: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            grace_period_secs: 1800,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProcessorConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:12111".to_string(),
            api_key: None,
            timeout_ms: 10_000,
        }
    }
}

/// Plan tier fee table
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FeesConfig {
    pub default_tier: String,
    /// Tier name -> fee rate in 10^6 precision
    pub tiers: HashMap<String, u64>,
    #[serde(default)]
    pub payer_tiers: HashMap<String, String>,
    /// Payer -> lifetime gross volume captured without a platform fee
    #[serde(default)]
    pub fee_free_allowances: HashMap<String, Amount>,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            default_tier: "free".to_string(),
            tiers: HashMap::from([("free".to_string(), DEFAULT_PLATFORM_FEE)]),
            payer_tiers: HashMap::new(),
            fee_free_allowances: HashMap::new(),
        }
    }
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
        if self.ingestion.workers == 0 {
            return Err(ConfigError::Invalid("ingestion.workers must be > 0".into()));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.max_attempts must be > 0".into(),
            ));
        }
        if self.gateway.queue_size == 0 {
            return Err(ConfigError::Invalid("gateway.queue_size must be > 0".into()));
        }
        Ok(())
    }
}

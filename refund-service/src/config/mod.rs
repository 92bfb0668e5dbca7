use crate::services::providers::MobileMoneyConfig;
use crate::services::settlement::SettlementSettings;
use serde::Deserialize;
use taxfree_core::config::{CommonConfig, DatabaseConfig};
use taxfree_core::error::AppError;

#[derive(Debug, Deserialize, Clone)]
pub struct RefundConfig {
    pub common: CommonConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub mobile_money: MobileMoneyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Seconds between retry sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Fixed backoff before a failed refund becomes due again.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_retries: default_max_retries(),
            provider_timeout_secs: default_provider_timeout_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_retry_backoff_secs() -> i64 {
    900
}

fn default_max_retries() -> i32 {
    3
}

fn default_provider_timeout_secs() -> u64 {
    30
}

impl RefundConfig {
    pub fn load() -> Result<Self, AppError> {
        taxfree_core::config::load()
    }

    pub fn settlement_settings(&self) -> SettlementSettings {
        SettlementSettings {
            max_retries: self.worker.max_retries,
            retry_backoff: chrono::Duration::seconds(self.worker.retry_backoff_secs),
            provider_timeout: std::time::Duration::from_secs(self.worker.provider_timeout_secs),
        }
    }
}

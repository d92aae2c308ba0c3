use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::PriorityQueueConfig;

pub const DEFAULT_JOB_TTL_SECS: u64 = 7 * 24 * 60 * 60; // persisted job configs live 7 days
pub const DEFAULT_CONDITION_CHECK_SECS: u64 = 30;
pub const DEFAULT_STATS_SWEEP_SECS: u64 = 3600;
pub const DEFAULT_QUEUES: [&str; 5] = [
    "default",
    "email",
    "notifications",
    "reports",
    "maintenance",
];

/// Top-level config (fairq.toml + FAIRQ_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairqConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Known queues. Fixed for the life of the process; only their policy changes.
    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, PriorityQueueConfig>,
}

impl Default for FairqConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            database: DatabaseConfig::default(),
            queues: default_queues(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// TTL applied to every persisted job config.
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,
    /// Cadence of the periodic re-check for conditional jobs.
    #[serde(default = "default_condition_check_secs")]
    pub condition_check_interval_secs: u64,
    /// Cadence of the queue trend/backlog sweep.
    #[serde(default = "default_stats_sweep_secs")]
    pub stats_sweep_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub default_batch_size: u32,
    #[serde(default = "default_batch_concurrency")]
    pub default_batch_concurrency: u32,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub default_retries: u32,
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: DEFAULT_JOB_TTL_SECS,
            condition_check_interval_secs: DEFAULT_CONDITION_CHECK_SECS,
            stats_sweep_interval_secs: DEFAULT_STATS_SWEEP_SECS,
            default_batch_size: default_batch_size(),
            default_batch_concurrency: default_batch_concurrency(),
            default_timeout_ms: default_timeout_ms(),
            default_retries: default_retries(),
            backoff_delay_ms: default_backoff_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_queues() -> BTreeMap<String, PriorityQueueConfig> {
    DEFAULT_QUEUES
        .iter()
        .map(|name| (name.to_string(), PriorityQueueConfig::default()))
        .collect()
}
fn default_job_ttl_secs() -> u64 {
    DEFAULT_JOB_TTL_SECS
}
fn default_condition_check_secs() -> u64 {
    DEFAULT_CONDITION_CHECK_SECS
}
fn default_stats_sweep_secs() -> u64 {
    DEFAULT_STATS_SWEEP_SECS
}
fn default_batch_size() -> u32 {
    50
}
fn default_batch_concurrency() -> u32 {
    5
}
fn default_timeout_ms() -> u64 {
    300_000
}
fn default_retries() -> u32 {
    3
}
fn default_backoff_delay_ms() -> u64 {
    2000
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fairq/fairq.db", home)
}

impl FairqConfig {
    /// Load config from a TOML file with FAIRQ_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `FAIRQ_SCHEDULER__CONDITION_CHECK_INTERVAL_SECS=10`.
    /// A missing file is not an error; defaults fill every gap.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: FairqConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FAIRQ_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fairq/fairq.toml", home)
}

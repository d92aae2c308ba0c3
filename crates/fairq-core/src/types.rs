use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared urgency tier of a job. Ordering follows urgency: `Urgent` sorts first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
    Deferred,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Deferred,
    ];

    /// Fixed ordinal weight, 1 (urgent) through 5 (deferred). Lower is more urgent.
    pub fn weight(self) -> u8 {
        match self {
            Priority::Urgent => 1,
            Priority::High => 2,
            Priority::Normal => 3,
            Priority::Low => 4,
            Priority::Deferred => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Deferred => "deferred",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "deferred" => Ok(Priority::Deferred),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// How a job reaches the executor.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Immediate,
    Delayed,
    Recurring,
    Conditional,
    Batch,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::Immediate,
        Strategy::Delayed,
        Strategy::Recurring,
        Strategy::Conditional,
        Strategy::Batch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Immediate => "immediate",
            Strategy::Delayed => "delayed",
            Strategy::Recurring => "recurring",
            Strategy::Conditional => "conditional",
            Strategy::Batch => "batch",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

/// Recurrence settings. `pattern` is optional here so that a missing pattern
/// can be reported as a validation failure rather than a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeatOptions {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// IANA timezone name, e.g. `Europe/Berlin`. UTC when absent.
    #[serde(default)]
    pub tz: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDepthTrigger {
    pub queue: String,
    pub threshold: u64,
}

/// Local wall-clock window, both ends `HH:mm` and inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemLoadTrigger {
    pub threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionTriggers {
    #[serde(default)]
    pub queue_depth: Option<QueueDepthTrigger>,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub system_load: Option<SystemLoadTrigger>,
}

/// Gate for a conditional job. Every declared part must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCondition {
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub triggers: Option<ConditionTriggers>,
}

/// Caller-supplied description of a job to schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub queue_name: String,
    pub job_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub execute_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub repeat: Option<RepeatOptions>,
    #[serde(default)]
    pub condition: Option<JobCondition>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl JobSpec {
    pub fn new(name: &str, queue_name: &str, job_type: &str) -> Self {
        Self {
            name: name.to_string(),
            queue_name: queue_name.to_string(),
            job_type: job_type.to_string(),
            ..Default::default()
        }
    }
}

/// A registered unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobConfig {
    /// UUID v4 string, assigned on creation and never changed.
    pub id: String,
    pub name: String,
    pub queue_name: String,
    pub job_type: String,
    /// Opaque payload forwarded to the executor.
    pub data: Value,
    pub priority: Priority,
    pub strategy: Strategy,
    pub execute_at: Option<DateTime<Utc>>,
    pub delay_ms: Option<u64>,
    pub repeat: Option<RepeatOptions>,
    pub condition: Option<JobCondition>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub backoff: Backoff,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl ScheduledJobConfig {
    pub fn from_spec(id: String, spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            queue_name: spec.queue_name,
            job_type: spec.job_type,
            data: spec.data,
            priority: spec.priority,
            strategy: spec.strategy,
            execute_at: spec.execute_at,
            delay_ms: spec.delay_ms,
            repeat: spec.repeat,
            condition: spec.condition,
            timeout_ms: spec.timeout_ms,
            retries: spec.retries,
            backoff: spec.backoff,
            tags: spec.tags,
            metadata: spec.metadata,
            created_by: spec.created_by,
            created_at: now,
            last_modified: now,
        }
    }
}

/// Per-tier tuning inside a queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityLevel {
    pub weight: u32,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub window_ms: u64,
    pub max_jobs: u32,
}

/// Fairness policy of one named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityQueueConfig {
    #[serde(default = "default_priority_levels")]
    pub priority_levels: BTreeMap<Priority, PriorityLevel>,
    /// In `[0, 1]`. Zero disables fairness throttling.
    #[serde(default = "default_fairness_ratio")]
    pub fairness_ratio: f64,
    #[serde(default = "bool_true")]
    pub starvation_prevention: bool,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,
    #[serde(default)]
    pub rate_limiting: Option<RateLimit>,
}

impl Default for PriorityQueueConfig {
    fn default() -> Self {
        Self {
            priority_levels: default_priority_levels(),
            fairness_ratio: default_fairness_ratio(),
            starvation_prevention: true,
            max_queue_size: default_max_queue_size(),
            rate_limiting: None,
        }
    }
}

/// Partial update applied by `update_priority_queue_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityQueuePatch {
    #[serde(default)]
    pub priority_levels: Option<BTreeMap<Priority, PriorityLevel>>,
    #[serde(default)]
    pub fairness_ratio: Option<f64>,
    #[serde(default)]
    pub starvation_prevention: Option<bool>,
    #[serde(default)]
    pub max_queue_size: Option<u64>,
    #[serde(default)]
    pub rate_limiting: Option<RateLimit>,
    /// Removes any rate limit. Wins over `rate_limiting`.
    #[serde(default)]
    pub clear_rate_limiting: bool,
}

impl PriorityQueuePatch {
    pub fn apply(self, config: &mut PriorityQueueConfig) {
        if let Some(levels) = self.priority_levels {
            // Tiers not mentioned keep their current settings.
            config.priority_levels.extend(levels);
        }
        if let Some(ratio) = self.fairness_ratio {
            config.fairness_ratio = ratio.clamp(0.0, 1.0);
        }
        if let Some(enabled) = self.starvation_prevention {
            config.starvation_prevention = enabled;
        }
        if let Some(size) = self.max_queue_size {
            config.max_queue_size = size.max(1);
        }
        if self.rate_limiting.is_some() {
            config.rate_limiting = self.rate_limiting;
        }
        if self.clear_rate_limiting {
            config.rate_limiting = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionResult {
    /// Identifier assigned by the executor; absent when submission failed.
    pub job_id: Option<String>,
    pub scheduled_job_id: String,
    pub status: ExecutionStatus,
    pub executed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub next_execution: Option<DateTime<Utc>>,
}

fn default_priority_levels() -> BTreeMap<Priority, PriorityLevel> {
    [
        (Priority::Urgent, 100, 20),
        (Priority::High, 50, 10),
        (Priority::Normal, 20, 5),
        (Priority::Low, 10, 2),
        (Priority::Deferred, 1, 1),
    ]
    .into_iter()
    .map(|(p, weight, max_concurrency)| {
        (
            p,
            PriorityLevel {
                weight,
                max_concurrency,
            },
        )
    })
    .collect()
}

fn default_fairness_ratio() -> f64 {
    0.8
}

fn default_max_queue_size() -> u64 {
    10_000
}

fn bool_true() -> bool {
    true
}

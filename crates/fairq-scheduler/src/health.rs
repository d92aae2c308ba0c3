//! Scheduler health classification derived from the stats snapshot.

use std::collections::BTreeMap;
use std::fmt;

use fairq_core::types::PriorityQueueConfig;
use serde::Serialize;

use crate::stats::SchedulingStats;

const DEGRADED_FAILURE_RATE: f64 = 0.10;
const UNHEALTHY_FAILURE_RATE: f64 = 0.25;
const SLOW_SUBMISSION_MS: f64 = 5_000.0;
const BACKLOG_WARN_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Jobs currently held by the registry.
    pub scheduled_jobs: usize,
    /// Armed delayed/recurring/conditional tasks.
    pub pending_jobs: usize,
    pub failure_rate: f64,
    pub avg_execution_ms: f64,
    pub issues: Vec<String>,
}

pub fn assess(
    stats: &SchedulingStats,
    queues: &BTreeMap<String, PriorityQueueConfig>,
    scheduled_jobs: usize,
    pending_jobs: usize,
) -> HealthReport {
    let failure_rate = stats.failure_rate();
    let avg_execution_ms = stats.avg_execution_ms();
    let mut issues = Vec::new();

    if failure_rate > DEGRADED_FAILURE_RATE {
        issues.push(format!("high failure rate: {:.1}%", failure_rate * 100.0));
    }
    if avg_execution_ms > SLOW_SUBMISSION_MS {
        issues.push(format!("slow submissions: {avg_execution_ms:.0}ms average"));
    }
    for (name, snapshot) in &stats.queues {
        let Some(config) = queues.get(name) else {
            continue;
        };
        let limit = config.max_queue_size.max(1) as f64 * BACKLOG_WARN_RATIO;
        if snapshot.backlog as f64 > limit {
            issues.push(format!(
                "queue '{name}' backlog {} of {}",
                snapshot.backlog, config.max_queue_size
            ));
        }
    }

    let status = if failure_rate > UNHEALTHY_FAILURE_RATE {
        HealthStatus::Unhealthy
    } else if !issues.is_empty() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    HealthReport {
        status,
        scheduled_jobs,
        pending_jobs,
        failure_rate,
        avg_execution_ms,
        issues,
    }
}

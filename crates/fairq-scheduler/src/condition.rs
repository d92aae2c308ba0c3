//! Condition evaluation for conditional jobs.
//!
//! A condition holds when every declared part holds: all dependencies have a
//! `completed` result, every trigger is satisfied, and the expression (if
//! any) evaluates true. Any error while evaluating counts as "not yet".

use std::sync::Arc;

use chrono::{Local, NaiveTime, Timelike};
use fairq_core::types::{ConditionTriggers, ScheduledJobConfig, TimeWindow};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::CollaboratorError;
use crate::expr::{Expr, ExprError};
use crate::probe::{QueueHealth, SystemLoad};
use crate::results::ResultTracker;
use crate::stats::StatsCollector;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("expression error: {0}")]
    Expression(#[from] ExprError),

    #[error("queue depth probe for '{queue}' failed: {source}")]
    QueueDepth {
        queue: String,
        #[source]
        source: CollaboratorError,
    },

    #[error("system load probe failed: {0}")]
    SystemLoad(#[source] CollaboratorError),

    #[error("invalid time '{0}', expected HH:mm")]
    InvalidTime(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Parse a zero-padded `HH:mm` wall-clock time.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime, ConditionError> {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return Err(ConditionError::InvalidTime(s.to_string()));
    }
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| ConditionError::InvalidTime(s.to_string()))
}

/// Whether `now` (minute resolution) falls inside `[start, end]`.
///
/// A window whose start is after its end wraps past midnight, so
/// `22:00–02:00` contains both 23:30 and 01:00.
pub fn within_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    let now = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now);
    if start <= end {
        now >= start && now <= end
    } else {
        now >= start || now <= end
    }
}

pub fn check_time_window(window: &TimeWindow, now: NaiveTime) -> Result<bool, ConditionError> {
    let start = parse_hhmm(&window.start)?;
    let end = parse_hhmm(&window.end)?;
    Ok(within_window(now, start, end))
}

pub struct ConditionEvaluator {
    results: Arc<ResultTracker>,
    stats: Arc<StatsCollector>,
    queue_health: Arc<dyn QueueHealth>,
    system_load: Arc<dyn SystemLoad>,
}

impl ConditionEvaluator {
    pub fn new(
        results: Arc<ResultTracker>,
        stats: Arc<StatsCollector>,
        queue_health: Arc<dyn QueueHealth>,
        system_load: Arc<dyn SystemLoad>,
    ) -> Self {
        Self {
            results,
            stats,
            queue_health,
            system_load,
        }
    }

    /// Fail-closed check: errors are logged and read as "not satisfied".
    pub async fn check(&self, job: &ScheduledJobConfig) -> bool {
        match self.evaluate(job).await {
            Ok(met) => met,
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    error = %e,
                    "condition evaluation failed; treating as not met"
                );
                false
            }
        }
    }

    pub async fn evaluate(&self, job: &ScheduledJobConfig) -> Result<bool, ConditionError> {
        let Some(condition) = &job.condition else {
            return Ok(true);
        };

        if let Some(pending) = condition
            .dependencies
            .iter()
            .find(|dep| !self.results.is_completed(dep))
        {
            debug!(job_id = %job.id, dependency = %pending, "dependency not completed");
            return Ok(false);
        }

        if let Some(triggers) = &condition.triggers {
            if !self.triggers_met(triggers).await? {
                debug!(job_id = %job.id, "trigger not satisfied");
                return Ok(false);
            }
        }

        if let Some(source) = &condition.expression {
            let expr = Expr::parse(source)?;
            let ctx = json!({
                "job": serde_json::to_value(job)?,
                "stats": serde_json::to_value(self.stats.snapshot())?,
            });
            if !expr.eval(&ctx) {
                debug!(job_id = %job.id, "expression false");
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn triggers_met(&self, triggers: &ConditionTriggers) -> Result<bool, ConditionError> {
        if let Some(depth) = &triggers.queue_depth {
            let stats = self
                .queue_health
                .queue_stats(&depth.queue)
                .await
                .map_err(|source| ConditionError::QueueDepth {
                    queue: depth.queue.clone(),
                    source,
                })?;
            if stats.backlog() < depth.threshold {
                return Ok(false);
            }
        }

        if let Some(window) = &triggers.time_window {
            if !check_time_window(window, Local::now().time())? {
                return Ok(false);
            }
        }

        if let Some(load) = &triggers.system_load {
            let current = self
                .system_load
                .load_average()
                .await
                .map_err(ConditionError::SystemLoad)?;
            if current > load.threshold {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

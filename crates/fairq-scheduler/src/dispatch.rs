//! The immediate and batch dispatch paths.
//!
//! Every other strategy ends up here when its timer fires or its condition
//! holds. Each call records exactly one [`JobExecutionResult`] and one stats
//! outcome.

use std::time::Instant;

use chrono::{DateTime, Utc};
use fairq_core::types::{ExecutionStatus, JobExecutionResult, ScheduledJobConfig};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::batch::{payload_items, BatchOptions};
use crate::engine::Shared;
use crate::error::{CollaboratorError, Result, SchedulerError};
use crate::executor::{BackoffOptions, SubmitOptions};
use crate::priority::dynamic_priority;

impl Shared {
    /// Current backlog of `queue`. A failed lookup reads as an idle queue.
    pub(crate) async fn backlog(&self, queue: &str) -> u64 {
        match self.queue_health.queue_stats(queue).await {
            Ok(stats) => {
                let backlog = stats.backlog();
                self.stats.set_backlog(queue, backlog);
                backlog
            }
            Err(e) => {
                warn!(%queue, error = %e, "queue health lookup failed; assuming empty queue");
                0
            }
        }
    }

    /// Score the job, pick its delay, and hand it to the executor.
    pub(crate) async fn dispatch(
        &self,
        job: &ScheduledJobConfig,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let queue = job.queue_name.as_str();
        let config = self.queue_config(queue).await;
        let backlog = self.backlog(queue).await;
        let now = Utc::now();

        let starvation = self
            .fairness
            .starvation_boost(queue, job.priority, &config, now);
        let score = dynamic_priority(job.priority, job.created_at, now, backlog, starvation);
        let decision = self.fairness.delay(queue, score.score, backlog, &config, now);
        debug!(
            job_id = %job.id,
            %queue,
            backlog,
            score = score.score,
            fairness_ms = decision.fairness_ms,
            capacity_ms = decision.capacity_ms,
            rate_ms = decision.rate_ms,
            "dispatch decision"
        );

        let options = SubmitOptions {
            priority: score.executor_priority(),
            delay_ms: decision.delay_ms,
            attempts: job
                .retries
                .unwrap_or(self.config.default_retries)
                .saturating_add(1),
            timeout_ms: job.timeout_ms.unwrap_or(self.config.default_timeout_ms),
            backoff: BackoffOptions {
                kind: job.backoff,
                delay_ms: self.config.backoff_delay_ms,
            },
        };

        let started = Instant::now();
        let outcome = self
            .executor
            .submit(queue, &job.job_type, &job.data, &options)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.record_outcome(job, &outcome, now, elapsed_ms, decision.delay_ms, next_execution);
        match outcome {
            Ok(executor_job_id) => {
                self.fairness.record_submission(queue, job.priority, &config, Utc::now());
                info!(
                    job_id = %job.id,
                    executor_job_id = %executor_job_id,
                    %queue,
                    priority = options.priority,
                    delay_ms = options.delay_ms,
                    "job dispatched"
                );
                self.wake_dependents(&job.id);
                Ok(executor_job_id)
            }
            Err(source) => Err(SchedulerError::Dispatch {
                job_id: job.id.clone(),
                source,
            }),
        }
    }

    /// Hand the job's items to the batch processor and stash the returned
    /// batch id in the job's metadata.
    pub(crate) async fn dispatch_batch(&self, job: &ScheduledJobConfig) -> Result<String> {
        let Some(processor) = self.batch.as_ref() else {
            return Err(SchedulerError::Validation(
                "batch jobs require a batch processor".into(),
            ));
        };
        let items = payload_items(&job.data);
        let options = BatchOptions {
            priority: job.priority,
            batch_size: metadata_u32(job, "batch_size").unwrap_or(self.config.default_batch_size),
            concurrency: metadata_u32(job, "concurrency")
                .unwrap_or(self.config.default_batch_concurrency),
            scheduled_at: job.execute_at,
            metadata: job.metadata.clone(),
        };

        let now = Utc::now();
        let started = Instant::now();
        let outcome = processor
            .submit_batch(&job.job_type, items, &options)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.record_outcome(job, &outcome, now, elapsed_ms, 0, None);

        let batch_id = outcome.map_err(|source| SchedulerError::Dispatch {
            job_id: job.id.clone(),
            source,
        })?;
        if let Err(e) = self
            .registry
            .update_metadata(&job.id, "batch_id", Value::from(batch_id.clone()))
            .await
        {
            warn!(job_id = %job.id, %batch_id, error = %e, "failed to record batch id");
        }
        info!(job_id = %job.id, %batch_id, batch_size = options.batch_size, "batch submitted");
        self.wake_dependents(&job.id);
        Ok(batch_id)
    }

    fn record_outcome(
        &self,
        job: &ScheduledJobConfig,
        outcome: &std::result::Result<String, CollaboratorError>,
        executed_at: DateTime<Utc>,
        elapsed_ms: u64,
        wait_ms: u64,
        next_execution: Option<DateTime<Utc>>,
    ) {
        let ok = outcome.is_ok();
        let (job_id, status, error) = match outcome {
            Ok(id) => (Some(id.clone()), ExecutionStatus::Completed, None),
            Err(e) => (None, ExecutionStatus::Failed, Some(e.to_string())),
        };
        self.results.record(JobExecutionResult {
            job_id,
            scheduled_job_id: job.id.clone(),
            status,
            executed_at,
            completed_at: Some(Utc::now()),
            duration_ms: Some(elapsed_ms),
            error,
            retry_count: 0,
            next_execution,
        });
        self.stats.record_dispatch(
            &job.queue_name,
            job.priority,
            job.strategy,
            ok,
            wait_ms,
            elapsed_ms,
        );
    }

    /// Re-check every conditional job waiting on `job_id` right away.
    pub(crate) fn wake_dependents(&self, job_id: &str) {
        let Some(dependents) = self.dependents.get(job_id) else {
            return;
        };
        for dependent in dependents.iter() {
            if self.tasks.wake(dependent) {
                debug!(job_id = %dependent, dependency = %job_id, "dependent woken");
            }
        }
    }
}

fn metadata_u32(job: &ScheduledJobConfig, key: &str) -> Option<u32> {
    job.metadata
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
}

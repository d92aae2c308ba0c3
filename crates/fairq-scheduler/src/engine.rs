use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fairq_core::config::SchedulerConfig;
use fairq_core::types::{
    JobExecutionResult, JobSpec, PriorityQueueConfig, PriorityQueuePatch, ScheduledJobConfig,
    Strategy,
};
use fairq_core::FairqConfig;
use serde_json::Value;
use tokio::sync::{watch, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batch::BatchProcessor;
use crate::condition::ConditionEvaluator;
use crate::cron::{CronSource, CronerSource};
use crate::error::{Result, SchedulerError};
use crate::executor::Executor;
use crate::fairness::FairnessController;
use crate::health::{self, HealthReport};
use crate::probe::{ProcLoadAverage, QueueHealth, SystemLoad};
use crate::registry::{validate_spec, JobFilter, JobRegistry};
use crate::results::ResultTracker;
use crate::stats::{SchedulingStats, StatsCollector, Trend};
use crate::store::KvStore;
use crate::tasks::{TaskKind, TaskSet};

/// Metadata key counting how many times a recurring job has fired.
pub const FIRE_COUNT_KEY: &str = "fire_count";
/// Metadata key set once a delayed or conditional job has been dispatched.
pub const DISPATCHED_AT_KEY: &str = "dispatched_at";

/// External services the engine talks to.
pub struct Collaborators {
    pub executor: Arc<dyn Executor>,
    pub store: Arc<dyn KvStore>,
    pub queue_health: Arc<dyn QueueHealth>,
    pub cron: Arc<dyn CronSource>,
    pub system_load: Arc<dyn SystemLoad>,
    pub batch: Option<Arc<dyn BatchProcessor>>,
}

impl Collaborators {
    /// Croner for recurrence, `/proc/loadavg` for load, no batch processor.
    pub fn new(
        executor: Arc<dyn Executor>,
        store: Arc<dyn KvStore>,
        queue_health: Arc<dyn QueueHealth>,
    ) -> Self {
        Self {
            executor,
            store,
            queue_health,
            cron: Arc::new(CronerSource),
            system_load: Arc::new(ProcLoadAverage),
            batch: None,
        }
    }

    pub fn with_cron(mut self, cron: Arc<dyn CronSource>) -> Self {
        self.cron = cron;
        self
    }

    pub fn with_system_load(mut self, system_load: Arc<dyn SystemLoad>) -> Self {
        self.system_load = system_load;
        self
    }

    pub fn with_batch(mut self, batch: Arc<dyn BatchProcessor>) -> Self {
        self.batch = Some(batch);
        self
    }
}

/// State shared by the engine handle and every armed task.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) queues: RwLock<BTreeMap<String, PriorityQueueConfig>>,
    pub(crate) registry: JobRegistry,
    pub(crate) fairness: FairnessController,
    pub(crate) results: Arc<ResultTracker>,
    pub(crate) stats: Arc<StatsCollector>,
    pub(crate) conditions: ConditionEvaluator,
    pub(crate) tasks: TaskSet,
    /// dependency id -> conditional jobs waiting on it
    pub(crate) dependents: DashMap<String, HashSet<String>>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) queue_health: Arc<dyn QueueHealth>,
    pub(crate) cron: Arc<dyn CronSource>,
    pub(crate) batch: Option<Arc<dyn BatchProcessor>>,
}

/// The scheduling authority. Cheap to clone; clones share all state.
///
/// Fairness bookkeeping and armed tasks are process-local, so run one engine
/// per job set.
#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<Shared>,
}

impl SchedulerEngine {
    pub fn new(config: FairqConfig, collaborators: Collaborators) -> Self {
        let results = Arc::new(ResultTracker::new());
        let stats = Arc::new(StatsCollector::new());
        let conditions = ConditionEvaluator::new(
            results.clone(),
            stats.clone(),
            collaborators.queue_health.clone(),
            collaborators.system_load,
        );
        let registry = JobRegistry::new(collaborators.store, config.scheduler.job_ttl_secs);
        Self {
            inner: Arc::new(Shared {
                config: config.scheduler,
                queues: RwLock::new(config.queues),
                registry,
                fairness: FairnessController::new(),
                results,
                stats,
                conditions,
                tasks: TaskSet::new(),
                dependents: DashMap::new(),
                executor: collaborators.executor,
                queue_health: collaborators.queue_health,
                cron: collaborators.cron,
                batch: collaborators.batch,
            }),
        }
    }

    /// Validate, persist, and route a job by its strategy. Returns the new
    /// job id.
    ///
    /// Validation failures are returned before anything is written. For
    /// `immediate` and `batch` jobs a rejected submission is returned as
    /// [`SchedulerError::Dispatch`]; the job stays registered and the failure
    /// is recorded.
    pub async fn schedule_job(&self, spec: JobSpec) -> Result<String> {
        {
            let queues = self.inner.queues.read().await;
            validate_spec(
                &spec,
                &queues,
                self.inner.cron.as_ref(),
                self.inner.batch.is_some(),
            )?;
        }

        let job = ScheduledJobConfig::from_spec(Uuid::new_v4().to_string(), spec, Utc::now());
        self.inner.registry.create(job.clone()).await?;
        self.inner.stats.record_scheduled(job.priority, job.strategy);
        info!(
            job_id = %job.id,
            name = %job.name,
            queue = %job.queue_name,
            priority = %job.priority,
            strategy = %job.strategy,
            "job scheduled"
        );

        match job.strategy {
            Strategy::Immediate => {
                self.inner.dispatch(&job, None).await?;
            }
            Strategy::Batch => {
                self.inner.dispatch_batch(&job).await?;
            }
            Strategy::Delayed | Strategy::Recurring | Strategy::Conditional => {
                self.inner.arm(&job);
            }
        }
        Ok(job.id)
    }

    pub async fn get_scheduled_job(&self, id: &str) -> Option<ScheduledJobConfig> {
        self.inner.registry.get(id).await
    }

    pub async fn list_scheduled_jobs(&self, filter: &JobFilter) -> Vec<ScheduledJobConfig> {
        self.inner.registry.list(filter).await
    }

    /// Remove the job and abort its armed task. `false` when the id is
    /// unknown. Work already handed to the executor is not recalled.
    pub async fn cancel_scheduled_job(&self, id: &str) -> Result<bool> {
        let task = self.inner.tasks.cancel(id);
        let removed = self.inner.registry.remove(id).await?;
        if let Some(job) = &removed {
            self.inner.unregister_dependencies(job);
        }
        if removed.is_none() && task.is_none() {
            return Ok(false);
        }
        info!(job_id = %id, task = ?task, "job cancelled");
        Ok(true)
    }

    pub fn get_scheduling_stats(&self) -> SchedulingStats {
        self.inner.stats.snapshot()
    }

    pub fn get_job_execution_result(&self, id: &str) -> Option<JobExecutionResult> {
        self.inner.results.get(id)
    }

    pub async fn queue_config(&self, queue: &str) -> Option<PriorityQueueConfig> {
        self.inner.queues.read().await.get(queue).cloned()
    }

    /// Apply `patch` to a known queue and return the resulting policy.
    pub async fn update_priority_queue_config(
        &self,
        queue: &str,
        patch: PriorityQueuePatch,
    ) -> Result<PriorityQueueConfig> {
        let mut queues = self.inner.queues.write().await;
        let config = queues
            .get_mut(queue)
            .ok_or_else(|| SchedulerError::UnknownQueue {
                name: queue.to_string(),
            })?;
        patch.apply(config);
        self.inner.fairness.sync_rate_limit(queue, config);
        info!(
            %queue,
            fairness_ratio = config.fairness_ratio,
            max_queue_size = config.max_queue_size,
            starvation_prevention = config.starvation_prevention,
            "queue policy updated"
        );
        Ok(config.clone())
    }

    pub async fn health_check(&self) -> HealthReport {
        let stats = self.inner.stats.snapshot();
        let queues = self.inner.queues.read().await;
        health::assess(
            &stats,
            &queues,
            self.inner.registry.len().await,
            self.inner.tasks.len(),
        )
    }

    /// Derived keys (`scheduled_{id}` ...) of every armed task.
    pub fn armed_tasks(&self) -> Vec<String> {
        self.inner.tasks.keys()
    }

    /// Reload persisted jobs and re-arm the ones still owed a firing:
    /// recurring jobs, and delayed or conditional jobs not yet dispatched.
    /// Immediate and batch jobs are never replayed. Returns how many were
    /// armed.
    pub async fn restore(&self) -> Result<usize> {
        let jobs = self.inner.registry.reload().await?;
        let mut armed = 0;
        for job in jobs {
            if self.inner.tasks.key(&job.id).is_some() {
                continue;
            }
            let owed = match job.strategy {
                Strategy::Recurring => true,
                Strategy::Delayed | Strategy::Conditional => {
                    !job.metadata.contains_key(DISPATCHED_AT_KEY)
                }
                Strategy::Immediate | Strategy::Batch => false,
            };
            if owed {
                self.inner.arm(&job);
                armed += 1;
            }
        }
        info!(armed, "scheduled jobs restored");
        Ok(armed)
    }

    /// Refresh every known queue's backlog and recompute trends.
    pub async fn sweep_stats(&self) -> Vec<(String, Trend)> {
        let names: Vec<String> = self.inner.queues.read().await.keys().cloned().collect();
        for name in &names {
            self.inner.backlog(name).await;
        }
        let changed = self.inner.stats.sweep_trends();
        for (queue, trend) in &changed {
            info!(%queue, trend = ?trend, "queue trend changed");
        }
        changed
    }

    /// Background loop: runs the stats sweep until `shutdown` broadcasts
    /// `true`, then aborts every armed task.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        let period = Duration::from_secs(self.inner.config.stats_sweep_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_stats().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    /// Abort every armed task. Registered jobs stay persisted and can be
    /// re-armed by [`SchedulerEngine::restore`].
    pub fn shutdown(&self) {
        let armed = self.inner.tasks.len();
        self.inner.tasks.abort_all();
        info!(armed, "armed tasks aborted");
    }
}

impl Shared {
    pub(crate) async fn queue_config(&self, queue: &str) -> PriorityQueueConfig {
        self.queues
            .read()
            .await
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Spawn the timer or condition task for a delayed, recurring or
    /// conditional job.
    fn arm(self: &Arc<Self>, job: &ScheduledJobConfig) {
        match job.strategy {
            Strategy::Delayed => self.arm_delayed(job),
            Strategy::Recurring => self.arm_recurring(job),
            Strategy::Conditional => self.arm_conditional(job),
            Strategy::Immediate | Strategy::Batch => {}
        }
    }

    fn arm_delayed(self: &Arc<Self>, job: &ScheduledJobConfig) {
        let execute_at = delayed_fire_time(job);
        let shared = Arc::clone(self);
        let id = job.id.clone();
        self.tasks.arm(&job.id, TaskKind::Scheduled, None, move |token| async move {
            tokio::time::sleep(until(execute_at)).await;
            shared.fire_once(&id).await;
            shared.tasks.disarm(&id, token);
        });
        info!(job_id = %job.id, %execute_at, "delayed job armed");
    }

    fn arm_recurring(self: &Arc<Self>, job: &ScheduledJobConfig) {
        let shared = Arc::clone(self);
        let id = job.id.clone();
        self.tasks.arm(&job.id, TaskKind::Recurring, None, move |token| async move {
            shared.recurring_loop(&id).await;
            shared.tasks.disarm(&id, token);
        });
        info!(job_id = %job.id, "recurring job armed");
    }

    fn arm_conditional(self: &Arc<Self>, job: &ScheduledJobConfig) {
        if let Some(condition) = &job.condition {
            for dependency in &condition.dependencies {
                self.dependents
                    .entry(dependency.clone())
                    .or_default()
                    .insert(job.id.clone());
            }
        }

        let wake = Arc::new(Notify::new());
        let woken = wake.clone();
        let period = Duration::from_secs(self.config.condition_check_interval_secs.max(1));
        let shared = Arc::clone(self);
        let id = job.id.clone();
        self.tasks.arm(&job.id, TaskKind::Conditional, Some(wake), move |token| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = woken.notified() => {}
                }
                let Some(job) = shared.registry.get(&id).await else {
                    break;
                };
                if shared.conditions.check(&job).await {
                    info!(job_id = %id, "condition met");
                    shared.unregister_dependencies(&job);
                    shared.fire_once(&id).await;
                    break;
                }
            }
            shared.tasks.disarm(&id, token);
        });
        info!(job_id = %job.id, every_secs = period.as_secs(), "conditional job armed");
    }

    /// Mark a one-shot job as dispatched, then dispatch it. Failures are
    /// only logged; there is no caller left to return them to.
    async fn fire_once(&self, id: &str) {
        let Some(job) = self.registry.get(id).await else {
            return;
        };
        let stamp = Value::from(Utc::now().to_rfc3339());
        if let Err(e) = self.registry.update_metadata(id, DISPATCHED_AT_KEY, stamp).await {
            warn!(job_id = %id, error = %e, "could not mark job dispatched");
        }
        if let Err(e) = self.dispatch(&job, None).await {
            warn!(job_id = %id, strategy = %job.strategy, error = %e, "background dispatch failed");
        }
    }

    /// Fire on every cron occurrence until the repeat limit or end date is
    /// reached, or the job disappears from the registry.
    async fn recurring_loop(&self, id: &str) {
        let mut after = Utc::now();
        loop {
            let Some(job) = self.registry.get(id).await else {
                return;
            };
            let Some(repeat) = job.repeat.clone() else {
                return;
            };
            let Some(pattern) = repeat.pattern.as_deref() else {
                return;
            };
            let tz = repeat.tz.as_deref();
            let fired = fire_count(&job);
            if repeat.limit.is_some_and(|limit| fired >= limit) {
                info!(job_id = %id, fired, "recurring job reached its limit");
                return;
            }

            let next = match self.cron.next_fire(pattern, tz, after) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    info!(job_id = %id, "recurring job has no further fire times");
                    return;
                }
                Err(e) => {
                    error!(
                        job_id = %id,
                        error = %e,
                        "cron evaluation failed; recurring job stopped"
                    );
                    return;
                }
            };
            if repeat.end_date.is_some_and(|end| next > end) {
                info!(job_id = %id, "recurring job passed its end date");
                return;
            }

            tokio::time::sleep(until(next)).await;

            // Cancellation may have raced the sleep.
            let Some(job) = self.registry.get(id).await else {
                return;
            };
            let fired = fired + 1;
            if let Err(e) = self
                .registry
                .update_metadata(id, FIRE_COUNT_KEY, Value::from(fired))
                .await
            {
                warn!(job_id = %id, error = %e, "could not persist fire count");
            }
            let following = if repeat.limit.is_some_and(|limit| fired >= limit) {
                None
            } else {
                self.cron
                    .next_fire(pattern, tz, next)
                    .ok()
                    .flatten()
                    .filter(|t| repeat.end_date.map_or(true, |end| *t <= end))
            };
            if let Err(e) = self.dispatch(&job, following).await {
                warn!(job_id = %id, error = %e, "recurring dispatch failed");
            }
            after = next.max(Utc::now());
        }
    }

    pub(crate) fn unregister_dependencies(&self, job: &ScheduledJobConfig) {
        let Some(condition) = &job.condition else {
            return;
        };
        for dependency in &condition.dependencies {
            if let Some(mut waiting) = self.dependents.get_mut(dependency) {
                waiting.remove(&job.id);
            }
            self.dependents.remove_if(dependency, |_, waiting| waiting.is_empty());
        }
    }
}

fn fire_count(job: &ScheduledJobConfig) -> u32 {
    job.metadata
        .get(FIRE_COUNT_KEY)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn delayed_fire_time(job: &ScheduledJobConfig) -> DateTime<Utc> {
    if let Some(at) = job.execute_at {
        return at;
    }
    let delay_ms = i64::try_from(job.delay_ms.unwrap_or(0)).unwrap_or(i64::MAX);
    job.created_at
        .checked_add_signed(chrono::Duration::milliseconds(delay_ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time left until `at`; zero once it has passed.
fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

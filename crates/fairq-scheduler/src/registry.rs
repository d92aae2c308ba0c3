//! Job registry: validated CRUD over [`ScheduledJobConfig`] records.
//!
//! Records live in memory for lookups and are written through to the
//! [`KvStore`] under `scheduled_job:{id}` with the configured TTL.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use fairq_core::types::{JobSpec, Priority, PriorityQueueConfig, ScheduledJobConfig, Strategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::condition::parse_hhmm;
use crate::cron::CronSource;
use crate::error::{Result, SchedulerError};
use crate::expr::Expr;
use crate::store::KvStore;

pub const JOB_KEY_PREFIX: &str = "scheduled_job:";

pub fn job_key(id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{id}")
}

/// Listing filter. Every set field must match; `tags` matches a job that
/// carries any of the listed tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &ScheduledJobConfig) -> bool {
        self.queue_name.as_ref().map_or(true, |q| *q == job.queue_name)
            && self.priority.map_or(true, |p| p == job.priority)
            && self.strategy.map_or(true, |s| s == job.strategy)
            && (self.tags.is_empty() || self.tags.iter().any(|t| job.tags.contains(t)))
    }
}

/// Strategy-aware validation, run once before anything is persisted.
pub fn validate_spec(
    spec: &JobSpec,
    queues: &BTreeMap<String, PriorityQueueConfig>,
    cron: &dyn CronSource,
    batch_available: bool,
) -> Result<()> {
    for (field, value) in [
        ("name", &spec.name),
        ("queue_name", &spec.queue_name),
        ("job_type", &spec.job_type),
    ] {
        if value.trim().is_empty() {
            return Err(SchedulerError::Validation(format!("{field} is required")));
        }
    }
    if !queues.contains_key(&spec.queue_name) {
        return Err(SchedulerError::UnknownQueue {
            name: spec.queue_name.clone(),
        });
    }

    match spec.strategy {
        Strategy::Immediate => {}
        Strategy::Delayed => {
            if spec.execute_at.is_none() && spec.delay_ms.is_none() {
                return Err(SchedulerError::Validation(
                    "delayed jobs require execute_at or delay_ms".into(),
                ));
            }
        }
        Strategy::Recurring => {
            let Some(pattern) = spec.repeat.as_ref().and_then(|r| r.pattern.as_deref()) else {
                return Err(SchedulerError::Validation(
                    "recurring jobs require repeat.pattern".into(),
                ));
            };
            let tz = spec.repeat.as_ref().and_then(|r| r.tz.as_deref());
            cron.next_fire(pattern, tz, Utc::now())
                .map_err(|e| SchedulerError::CronParse {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Strategy::Conditional => {
            let Some(condition) = &spec.condition else {
                return Err(SchedulerError::Validation(
                    "conditional jobs require condition".into(),
                ));
            };
            if let Some(window) = condition.triggers.as_ref().and_then(|t| t.time_window.as_ref()) {
                parse_hhmm(&window.start)
                    .and_then(|_| parse_hhmm(&window.end))
                    .map_err(|e| SchedulerError::Validation(e.to_string()))?;
            }
            if let Some(source) = &condition.expression {
                Expr::parse(source)
                    .map_err(|e| SchedulerError::Validation(format!("condition.expression: {e}")))?;
            }
        }
        Strategy::Batch => {
            if !batch_available {
                return Err(SchedulerError::Validation(
                    "batch jobs require a batch processor".into(),
                ));
            }
        }
    }
    Ok(())
}

pub struct JobRegistry {
    store: Arc<dyn KvStore>,
    jobs: RwLock<HashMap<String, ScheduledJobConfig>>,
    ttl_secs: u64,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            jobs: RwLock::new(HashMap::new()),
            ttl_secs,
        }
    }

    async fn persist(&self, job: &ScheduledJobConfig) -> Result<()> {
        let json = serde_json::to_string(job)?;
        self.store.set(&job_key(&job.id), &json, self.ttl_secs).await?;
        Ok(())
    }

    /// Persist then register. A store failure leaves the registry untouched.
    pub async fn create(&self, job: ScheduledJobConfig) -> Result<()> {
        self.persist(&job).await?;
        info!(job_id = %job.id, name = %job.name, queue = %job.queue_name, "job registered");
        self.jobs.write().await.insert(job.id.clone(), job);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<ScheduledJobConfig> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Matching jobs, oldest first.
    pub async fn list(&self, filter: &JobFilter) -> Vec<ScheduledJobConfig> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Set one metadata entry, bump `last_modified`, and write through.
    pub async fn update_metadata(
        &self,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<ScheduledJobConfig> {
        let updated = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
            job.metadata.insert(key.to_string(), value);
            job.last_modified = Utc::now();
            job.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// Drop the record from memory and the store. `None` when unknown.
    pub async fn remove(&self, id: &str) -> Result<Option<ScheduledJobConfig>> {
        let removed = self.jobs.write().await.remove(id);
        if removed.is_some() {
            self.store.delete(&job_key(id)).await?;
            debug!(job_id = %id, "job removed from registry");
        }
        Ok(removed)
    }

    /// Load every persisted record into memory. Undecodable entries are
    /// skipped with a warning. Returns the jobs that were loaded.
    pub async fn reload(&self) -> Result<Vec<ScheduledJobConfig>> {
        let keys = self.store.list_keys(JOB_KEY_PREFIX).await?;
        let mut loaded = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<ScheduledJobConfig>(&raw) {
                Ok(job) => loaded.push(job),
                Err(e) => warn!(%key, error = %e, "skipping undecodable job record"),
            }
        }
        let mut jobs = self.jobs.write().await;
        for job in &loaded {
            jobs.insert(job.id.clone(), job.clone());
        }
        info!(count = loaded.len(), "jobs reloaded from store");
        Ok(loaded)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::CronerSource;
    use crate::store::MemoryStore;
    use fairq_core::types::{ConditionTriggers, JobCondition, RepeatOptions, TimeWindow};
    use fairq_core::FairqConfig;

    fn queues() -> BTreeMap<String, PriorityQueueConfig> {
        FairqConfig::default().queues
    }

    fn check(spec: &JobSpec) -> Result<()> {
        validate_spec(spec, &queues(), &CronerSource, false)
    }

    fn spec(strategy: Strategy) -> JobSpec {
        JobSpec {
            strategy,
            ..JobSpec::new("nightly", "reports", "build_report")
        }
    }

    #[test]
    fn missing_identity_fields_and_unknown_queue() {
        let mut s = spec(Strategy::Immediate);
        s.name = " ".into();
        assert!(matches!(check(&s), Err(SchedulerError::Validation(_))));

        let mut s = spec(Strategy::Immediate);
        s.queue_name = "payments".into();
        assert!(matches!(check(&s), Err(SchedulerError::UnknownQueue { .. })));
    }

    #[test]
    fn each_strategy_requires_its_fields() {
        assert!(check(&spec(Strategy::Immediate)).is_ok());

        let mut delayed = spec(Strategy::Delayed);
        assert!(check(&delayed).is_err());
        delayed.delay_ms = Some(5_000);
        assert!(check(&delayed).is_ok());

        let mut recurring = spec(Strategy::Recurring);
        assert!(check(&recurring).is_err());
        recurring.repeat = Some(RepeatOptions::default());
        assert!(matches!(check(&recurring), Err(SchedulerError::Validation(_))));
        recurring.repeat = Some(RepeatOptions {
            pattern: Some("*/5 * * * *".into()),
            ..Default::default()
        });
        assert!(check(&recurring).is_ok());

        let mut conditional = spec(Strategy::Conditional);
        assert!(check(&conditional).is_err());
        conditional.condition = Some(JobCondition::default());
        assert!(check(&conditional).is_ok());

        let batch = spec(Strategy::Batch);
        assert!(check(&batch).is_err());
        assert!(validate_spec(&batch, &queues(), &CronerSource, true).is_ok());
    }

    #[test]
    fn bad_cron_is_cron_parse_error() {
        let mut s = spec(Strategy::Recurring);
        s.repeat = Some(RepeatOptions {
            pattern: Some("every tuesday".into()),
            ..Default::default()
        });
        let err = check(&s).unwrap_err();
        assert!(matches!(err, SchedulerError::CronParse { .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn conditional_triggers_and_expression_are_checked() {
        let mut s = spec(Strategy::Conditional);
        s.condition = Some(JobCondition {
            triggers: Some(ConditionTriggers {
                time_window: Some(TimeWindow {
                    start: "9:00".into(),
                    end: "17:00".into(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(check(&s).is_err());

        s.condition = Some(JobCondition {
            expression: Some("job.name == ".into()),
            ..Default::default()
        });
        assert!(check(&s).is_err());
    }

    fn job(id: &str, queue: &str, tags: &[&str]) -> ScheduledJobConfig {
        let mut spec = JobSpec::new(id, queue, "t");
        spec.tags = tags.iter().map(|t| t.to_string()).collect();
        ScheduledJobConfig::from_spec(id.to_string(), spec, Utc::now())
    }

    #[tokio::test]
    async fn create_persists_and_reload_restores() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let registry = JobRegistry::new(store.clone(), 60);
        registry.create(job("a", "email", &[])).await.unwrap();
        assert!(store.get("scheduled_job:a").await.unwrap().is_some());

        let fresh = JobRegistry::new(store, 60);
        assert!(fresh.is_empty().await);
        let loaded = fresh.reload().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(fresh.get("a").await.unwrap().queue_name, "email");
    }

    #[tokio::test]
    async fn list_filters_combine() {
        let registry = JobRegistry::new(Arc::new(MemoryStore::new()), 60);
        registry.create(job("a", "email", &["billing"])).await.unwrap();
        registry.create(job("b", "email", &["ops"])).await.unwrap();
        registry.create(job("c", "reports", &["billing"])).await.unwrap();

        let filter = JobFilter {
            queue_name: Some("email".into()),
            tags: vec!["billing".into(), "marketing".into()],
            ..Default::default()
        };
        let ids: Vec<_> = registry.list(&filter).await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(registry.list(&JobFilter::default()).await.len(), 3);
    }

    #[tokio::test]
    async fn metadata_update_and_remove() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let registry = JobRegistry::new(store.clone(), 60);
        registry.create(job("a", "email", &[])).await.unwrap();

        let updated = registry
            .update_metadata("a", "batch_id", Value::from("b-1"))
            .await
            .unwrap();
        assert_eq!(updated.metadata["batch_id"], "b-1");
        let raw = store.get("scheduled_job:a").await.unwrap().unwrap();
        assert!(raw.contains("b-1"));

        assert!(matches!(
            registry.update_metadata("zzz", "k", Value::Null).await,
            Err(SchedulerError::JobNotFound { .. })
        ));

        assert!(registry.remove("a").await.unwrap().is_some());
        assert!(registry.remove("a").await.unwrap().is_none());
        assert!(store.get("scheduled_job:a").await.unwrap().is_none());
    }
}

use dashmap::DashMap;
use fairq_core::types::{ExecutionStatus, JobExecutionResult};

/// Latest dispatch outcome per scheduled job. A re-dispatch replaces the
/// previous record rather than merging into it.
#[derive(Default)]
pub struct ResultTracker {
    results: DashMap<String, JobExecutionResult>,
}

impl ResultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: JobExecutionResult) {
        self.results.insert(result.scheduled_job_id.clone(), result);
    }

    pub fn get(&self, scheduled_job_id: &str) -> Option<JobExecutionResult> {
        self.results.get(scheduled_job_id).map(|r| r.clone())
    }

    /// True only when a result exists and its status is `completed`.
    pub fn is_completed(&self, scheduled_job_id: &str) -> bool {
        self.results
            .get(scheduled_job_id)
            .is_some_and(|r| r.status == ExecutionStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(id: &str, status: ExecutionStatus) -> JobExecutionResult {
        JobExecutionResult {
            job_id: Some("exec-1".to_string()),
            scheduled_job_id: id.to_string(),
            status,
            executed_at: Utc::now(),
            completed_at: None,
            duration_ms: Some(3),
            error: None,
            retry_count: 0,
            next_execution: None,
        }
    }

    #[test]
    fn later_result_supersedes_earlier() {
        let tracker = ResultTracker::new();
        tracker.record(result("a", ExecutionStatus::Failed));
        assert!(!tracker.is_completed("a"));
        tracker.record(result("a", ExecutionStatus::Completed));
        assert!(tracker.is_completed("a"));
        assert_eq!(tracker.get("a").unwrap().status, ExecutionStatus::Completed);
    }

    #[test]
    fn absent_result_is_not_completed() {
        let tracker = ResultTracker::new();
        assert!(!tracker.is_completed("missing"));
        assert!(tracker.get("missing").is_none());
    }
}

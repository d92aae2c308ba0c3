//! Executor seam: the queue/worker pool that actually runs job payloads.

use async_trait::async_trait;
use fairq_core::types::Backoff;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::CollaboratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffOptions {
    pub kind: Backoff,
    pub delay_ms: u64,
}

/// Per-submission options handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Rounded dynamic priority score; 1 is most urgent.
    pub priority: u32,
    pub delay_ms: u64,
    pub attempts: u32,
    pub timeout_ms: u64,
    pub backoff: BackoffOptions,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Hand a payload to the named queue. Returns the executor-assigned job id.
    async fn submit(
        &self,
        queue: &str,
        job_type: &str,
        payload: &Value,
        options: &SubmitOptions,
    ) -> Result<String, CollaboratorError>;
}

/// A submission as seen by whatever consumes a [`ChannelExecutor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub executor_job_id: String,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub options: SubmitOptions,
}

/// Executor that forwards every submission over a bounded mpsc channel.
///
/// The consumer owns delay handling and retries. Sending never blocks: a full
/// or closed channel is reported as a rejection.
pub struct ChannelExecutor {
    tx: mpsc::Sender<Submission>,
}

impl ChannelExecutor {
    pub fn new(tx: mpsc::Sender<Submission>) -> Self {
        Self { tx }
    }

    /// Convenience constructor returning the executor and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Submission>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Executor for ChannelExecutor {
    async fn submit(
        &self,
        queue: &str,
        job_type: &str,
        payload: &Value,
        options: &SubmitOptions,
    ) -> Result<String, CollaboratorError> {
        let executor_job_id = Uuid::new_v4().to_string();
        let submission = Submission {
            executor_job_id: executor_job_id.clone(),
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload: payload.clone(),
            options: *options,
        };
        if let Err(e) = self.tx.try_send(submission) {
            warn!(%queue, "executor channel full or closed; submission rejected");
            return Err(CollaboratorError::Rejected(e.to_string()));
        }
        Ok(executor_job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SubmitOptions {
        SubmitOptions {
            priority: 1,
            delay_ms: 0,
            attempts: 4,
            timeout_ms: 1000,
            backoff: BackoffOptions {
                kind: Backoff::Fixed,
                delay_ms: 100,
            },
        }
    }

    #[tokio::test]
    async fn forwards_submission_with_assigned_id() {
        let (executor, mut rx) = ChannelExecutor::channel(4);
        let id = executor
            .submit("email", "send", &serde_json::json!({"to": "a@b"}), &options())
            .await
            .unwrap();
        let sub = rx.recv().await.unwrap();
        assert_eq!(sub.executor_job_id, id);
        assert_eq!(sub.queue, "email");
        assert_eq!(sub.options.attempts, 4);
    }

    #[tokio::test]
    async fn closed_channel_rejects() {
        let (executor, rx) = ChannelExecutor::channel(1);
        drop(rx);
        let err = executor
            .submit("email", "send", &Value::Null, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected(_)));
    }
}

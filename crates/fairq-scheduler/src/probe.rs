//! Environmental signals: queue backlog and host load.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

/// Point-in-time counters for one executor queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueStats {
    /// Work the queue still has to get through.
    pub fn backlog(&self) -> u64 {
        self.waiting + self.active
    }
}

#[async_trait]
pub trait QueueHealth: Send + Sync {
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, CollaboratorError>;
}

#[async_trait]
pub trait SystemLoad: Send + Sync {
    /// One-minute load average.
    async fn load_average(&self) -> Result<f64, CollaboratorError>;
}

/// Reads the 1-minute load average from `/proc/loadavg` (Linux).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcLoadAverage;

#[async_trait]
impl SystemLoad for ProcLoadAverage {
    async fn load_average(&self) -> Result<f64, CollaboratorError> {
        let raw = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("/proc/loadavg: {e}")))?;
        parse_loadavg(&raw)
    }
}

fn parse_loadavg(raw: &str) -> Result<f64, CollaboratorError> {
    raw.split_whitespace()
        .next()
        .and_then(|first| first.parse::<f64>().ok())
        .ok_or_else(|| CollaboratorError::Unavailable(format!("malformed loadavg: {raw:?}")))
}

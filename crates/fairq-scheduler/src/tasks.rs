//! Armed background tasks, one per delayed/recurring/conditional job.
//!
//! Each task is a plain tokio task whose [`JoinHandle`] lives here under the
//! job id, so cancelling a job aborts exactly the task that would have fired
//! it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Scheduled,
    Recurring,
    Conditional,
}

impl TaskKind {
    /// Derived key used in logs and listings: `scheduled_{id}` and so on.
    pub fn key(self, job_id: &str) -> String {
        let prefix = match self {
            TaskKind::Scheduled => "scheduled",
            TaskKind::Recurring => "recurring",
            TaskKind::Conditional => "conditional",
        };
        format!("{prefix}_{job_id}")
    }
}

struct ArmedTask {
    kind: TaskKind,
    token: u64,
    handle: JoinHandle<()>,
    wake: Option<Arc<Notify>>,
}

#[derive(Default)]
pub struct TaskSet {
    tasks: DashMap<String, ArmedTask>,
    next_token: AtomicU64,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the future built by `make` and register it under `job_id`,
    /// aborting whatever was armed there before.
    ///
    /// `make` receives a token the task passes back to [`TaskSet::disarm`]
    /// when it finishes on its own, so a finished task never removes a
    /// newer one armed under the same id.
    pub fn arm<F, Fut>(&self, job_id: &str, kind: TaskKind, wake: Option<Arc<Notify>>, make: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        // Spawn while holding the entry so the task cannot disarm before it
        // is registered.
        match self.tasks.entry(job_id.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.get().handle.abort();
                let handle = tokio::spawn(make(token));
                slot.insert(ArmedTask {
                    kind,
                    token,
                    handle,
                    wake,
                });
            }
            Entry::Vacant(slot) => {
                let handle = tokio::spawn(make(token));
                slot.insert(ArmedTask {
                    kind,
                    token,
                    handle,
                    wake,
                });
            }
        }
    }

    /// Called by a task as it finishes.
    pub fn disarm(&self, job_id: &str, token: u64) {
        self.tasks.remove_if(job_id, |_, t| t.token == token);
    }

    /// Abort the job's task. Returns its derived key when one was armed.
    pub fn cancel(&self, job_id: &str) -> Option<String> {
        self.tasks.remove(job_id).map(|(_, task)| {
            task.handle.abort();
            task.kind.key(job_id)
        })
    }

    /// Nudge a waiting task (conditional re-check) without waiting for its
    /// next tick.
    pub fn wake(&self, job_id: &str) -> bool {
        match self.tasks.get(job_id).and_then(|t| t.wake.clone()) {
            Some(wake) => {
                wake.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn key(&self, job_id: &str) -> Option<String> {
        self.tasks.get(job_id).map(|t| t.kind.key(job_id))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .tasks
            .iter()
            .map(|t| t.kind.key(t.key()))
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn abort_all(&self) {
        self.tasks.retain(|_, task| {
            task.handle.abort();
            false
        });
    }
}

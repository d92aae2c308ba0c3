//! Scheduling statistics: counters per priority and per strategy, plus a
//! rolling per-queue health window.
//!
//! Purely observational: nothing here feeds back into scheduling decisions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fairq_core::types::{Priority, Strategy};
use serde::Serialize;

/// Rolling window for per-queue dispatch outcomes.
const WINDOW_SECS: u64 = 300; // 5 minutes
/// Helpful-fraction movement needed before a trend is reported.
const TREND_BAND: f64 = 0.05;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Counters {
    pub scheduled: u64,
    pub executed: u64,
    pub failed: u64,
    /// Mean submission delay imposed by the fairness controller.
    pub avg_wait_ms: f64,
    /// Mean time spent handing the job to the executor.
    pub avg_execution_ms: f64,
}

impl Counters {
    fn record_outcome(&mut self, ok: bool, wait_ms: u64, execution_ms: u64) {
        if ok {
            self.executed += 1;
        } else {
            self.failed += 1;
        }
        let n = (self.executed + self.failed) as f64;
        self.avg_wait_ms += (wait_ms as f64 - self.avg_wait_ms) / n;
        self.avg_execution_ms += (execution_ms as f64 - self.avg_execution_ms) / n;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    #[default]
    Stable,
    Declining,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueHealthSnapshot {
    pub backlog: u64,
    pub avg_processing_ms: f64,
    pub error_rate: f64,
    /// Dispatches per minute over the rolling window.
    pub throughput: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulingStats {
    pub total_scheduled: u64,
    pub total_executed: u64,
    pub total_failed: u64,
    pub by_priority: BTreeMap<Priority, Counters>,
    pub by_strategy: BTreeMap<Strategy, Counters>,
    pub queues: BTreeMap<String, QueueHealthSnapshot>,
}

impl SchedulingStats {
    /// Failed share of all dispatch attempts; zero before the first attempt.
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.total_executed + self.total_failed;
        if attempts == 0 {
            0.0
        } else {
            self.total_failed as f64 / attempts as f64
        }
    }

    /// Mean executor hand-off time across every strategy.
    pub fn avg_execution_ms(&self) -> f64 {
        let (sum, n) = self
            .by_strategy
            .values()
            .fold((0.0, 0u64), |(sum, n), c| {
                let attempts = c.executed + c.failed;
                (sum + c.avg_execution_ms * attempts as f64, n + attempts)
            });
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }
}

#[derive(Default)]
struct QueueWindow {
    /// (timestamp, was_success, latency_ms)
    outcomes: VecDeque<(Instant, bool, u64)>,
    backlog: u64,
    baseline: Option<f64>,
    trend: Trend,
}

impl QueueWindow {
    fn prune(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(Duration::from_secs(WINDOW_SECS)) else {
            return;
        };
        while self.outcomes.front().is_some_and(|(t, _, _)| *t < cutoff) {
            self.outcomes.pop_front();
        }
    }

    fn helpful_fraction(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let ok = self.outcomes.iter().filter(|(_, ok, _)| *ok).count();
        Some(ok as f64 / self.outcomes.len() as f64)
    }

    fn to_snapshot(&self) -> QueueHealthSnapshot {
        let total = self.outcomes.len();
        let (avg_processing_ms, error_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            let latency: u64 = self.outcomes.iter().map(|(_, _, lat)| lat).sum();
            let failed = self.outcomes.iter().filter(|(_, ok, _)| !*ok).count();
            (
                latency as f64 / total as f64,
                failed as f64 / total as f64,
            )
        };
        QueueHealthSnapshot {
            backlog: self.backlog,
            avg_processing_ms,
            error_rate,
            throughput: total as f64 / (WINDOW_SECS as f64 / 60.0),
            trend: self.trend,
        }
    }
}

#[derive(Default)]
struct Inner {
    totals: (u64, u64, u64),
    by_priority: BTreeMap<Priority, Counters>,
    by_strategy: BTreeMap<Strategy, Counters>,
    queues: BTreeMap<String, QueueWindow>,
}

/// Sole writer of [`SchedulingStats`]. Counters only grow; they reset with
/// the process.
#[derive(Default)]
pub struct StatsCollector {
    inner: Mutex<Inner>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scheduled(&self, priority: Priority, strategy: Strategy) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.totals.0 += 1;
        inner.by_priority.entry(priority).or_default().scheduled += 1;
        inner.by_strategy.entry(strategy).or_default().scheduled += 1;
    }

    /// Record one dispatch attempt and its outcome.
    pub fn record_dispatch(
        &self,
        queue: &str,
        priority: Priority,
        strategy: Strategy,
        ok: bool,
        wait_ms: u64,
        execution_ms: u64,
    ) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        if ok {
            inner.totals.1 += 1;
        } else {
            inner.totals.2 += 1;
        }
        inner
            .by_priority
            .entry(priority)
            .or_default()
            .record_outcome(ok, wait_ms, execution_ms);
        inner
            .by_strategy
            .entry(strategy)
            .or_default()
            .record_outcome(ok, wait_ms, execution_ms);

        let window = inner.queues.entry(queue.to_string()).or_default();
        window.prune();
        window.outcomes.push_back((Instant::now(), ok, execution_ms));
    }

    pub fn set_backlog(&self, queue: &str, backlog: u64) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.queues.entry(queue.to_string()).or_default().backlog = backlog;
    }

    /// Recompute every queue's trend against the baseline left by the
    /// previous sweep, then store the current fraction as the new baseline.
    /// Queues with no outcomes in the window keep their last trend.
    pub fn sweep_trends(&self) -> Vec<(String, Trend)> {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        let mut changed = Vec::new();
        for (name, window) in inner.queues.iter_mut() {
            window.prune();
            let Some(current) = window.helpful_fraction() else {
                continue;
            };
            let trend = match window.baseline {
                Some(base) if current > base + TREND_BAND => Trend::Improving,
                Some(base) if current < base - TREND_BAND => Trend::Declining,
                _ => Trend::Stable,
            };
            window.baseline = Some(current);
            if trend != window.trend {
                changed.push((name.clone(), trend));
            }
            window.trend = trend;
        }
        changed
    }

    pub fn snapshot(&self) -> SchedulingStats {
        let inner = self.inner.lock().expect("stats lock poisoned");
        SchedulingStats {
            total_scheduled: inner.totals.0,
            total_executed: inner.totals.1,
            total_failed: inner.totals.2,
            by_priority: inner.by_priority.clone(),
            by_strategy: inner.by_strategy.clone(),
            queues: inner
                .queues
                .iter()
                .map(|(name, w)| (name.clone(), w.to_snapshot()))
                .collect(),
        }
    }
}

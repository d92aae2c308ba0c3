//! Fairness controller: turns a priority score and queue backlog into a
//! submission delay, and tracks per-tier starvation.
//!
//! Three pressure signals produce candidate delays:
//!
//! | Signal   | Delay                                                          |
//! |----------|----------------------------------------------------------------|
//! | fairness | `1000 × (score − 1) × 0.5 × min(10, backlog / 100) × ratio` ms |
//! | capacity | `(utilisation − 0.8) × 10000` ms above 80 % utilisation        |
//! | rate     | time until the oldest submission leaves the rate window        |
//!
//! The final delay is the largest of them. They are alternatives, never summed.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use fairq_core::types::{Priority, PriorityQueueConfig, RateLimit};
use serde::Serialize;

/// A tier is starving once it has gone this long without a submission.
pub const STARVATION_THRESHOLD_MS: i64 = 300_000; // 5 minutes
/// Elapsed time worth one point of starvation boost.
pub const STARVATION_RAMP_MS: f64 = 600_000.0;
pub const MAX_STARVATION_BOOST: f64 = 2.0;

const FAIRNESS_UNIT_MS: f64 = 1000.0;
const BACKLOG_UNIT: f64 = 100.0;
const MAX_BACKLOG_FACTOR: f64 = 10.0;
const CAPACITY_THRESHOLD: f64 = 0.8;
const CAPACITY_SCALE_MS: f64 = 10_000.0;

/// Boost for a tier whose last submission was `elapsed_ms` ago.
///
/// Zero until the starvation threshold is crossed, then `elapsed / 10 min`,
/// capped at [`MAX_STARVATION_BOOST`].
pub fn starvation_boost(elapsed_ms: i64) -> f64 {
    if elapsed_ms <= STARVATION_THRESHOLD_MS {
        return 0.0;
    }
    (elapsed_ms as f64 / STARVATION_RAMP_MS).min(MAX_STARVATION_BOOST)
}

/// Weighted-fair-queuing delay. Zero for an idle queue, for the most urgent
/// score, or when the queue's fairness ratio is zero.
pub fn fairness_delay_ms(score: f64, backlog: u64, fairness_ratio: f64) -> f64 {
    let urgency_gap = (score - 1.0).max(0.0);
    let backlog_factor = (backlog as f64 / BACKLOG_UNIT).min(MAX_BACKLOG_FACTOR);
    FAIRNESS_UNIT_MS * urgency_gap * 0.5 * backlog_factor * fairness_ratio.clamp(0.0, 1.0)
}

/// Back-pressure delay once the queue is more than 80 % full.
pub fn capacity_delay_ms(backlog: u64, max_queue_size: u64) -> f64 {
    let utilisation = backlog as f64 / max_queue_size.max(1) as f64;
    if utilisation > CAPACITY_THRESHOLD {
        (utilisation - CAPACITY_THRESHOLD) * CAPACITY_SCALE_MS
    } else {
        0.0
    }
}

/// The candidate delays and the chosen one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DelayDecision {
    pub fairness_ms: f64,
    pub capacity_ms: f64,
    pub rate_ms: f64,
    pub delay_ms: u64,
}

/// Process-local fairness bookkeeping.
///
/// Holds the last submission instant per `(queue, tier)` and, for queues with
/// a rate limit, the recent submission instants. Not shared across processes.
#[derive(Default)]
pub struct FairnessController {
    last_execution: DashMap<(String, Priority), DateTime<Utc>>,
    recent: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl FairnessController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starvation boost for `priority` on `queue`, honouring the queue's
    /// `starvation_prevention` flag. A tier that has never been submitted has
    /// no reference point and gets no boost.
    pub fn starvation_boost(
        &self,
        queue: &str,
        priority: Priority,
        config: &PriorityQueueConfig,
        now: DateTime<Utc>,
    ) -> f64 {
        if !config.starvation_prevention {
            return 0.0;
        }
        self.last_execution
            .get(&(queue.to_string(), priority))
            .map(|last| starvation_boost((now - *last).num_milliseconds()))
            .unwrap_or(0.0)
    }

    /// Decide how long a submission with `score` should wait.
    pub fn delay(
        &self,
        queue: &str,
        score: f64,
        backlog: u64,
        config: &PriorityQueueConfig,
        now: DateTime<Utc>,
    ) -> DelayDecision {
        let fairness_ms = fairness_delay_ms(score, backlog, config.fairness_ratio);
        let capacity_ms = capacity_delay_ms(backlog, config.max_queue_size);
        let rate_ms = self.rate_delay_ms(queue, config, now);
        let delay_ms = fairness_ms.max(capacity_ms).max(rate_ms).max(0.0).round() as u64;
        DelayDecision {
            fairness_ms,
            capacity_ms,
            rate_ms,
            delay_ms,
        }
    }

    /// Note a successful submission: resets the tier's starvation clock and,
    /// when the queue is rate limited, feeds its rate window.
    pub fn record_submission(
        &self,
        queue: &str,
        priority: Priority,
        config: &PriorityQueueConfig,
        now: DateTime<Utc>,
    ) {
        self.last_execution.insert((queue.to_string(), priority), now);
        let Some(limit) = active_limit(config) else {
            self.recent.remove(queue);
            return;
        };
        let mut window = self.recent.entry(queue.to_string()).or_default();
        prune(&mut window, window_span(&limit), now);
        window.push_back(now);
        // Only the newest `max_jobs` entries can ever block a submission.
        while window.len() > limit.max_jobs as usize {
            window.pop_front();
        }
    }

    /// Drop the rate window of `queue` once it no longer has a rate limit.
    pub fn sync_rate_limit(&self, queue: &str, config: &PriorityQueueConfig) {
        if active_limit(config).is_none() {
            self.recent.remove(queue);
        }
    }

    fn rate_delay_ms(&self, queue: &str, config: &PriorityQueueConfig, now: DateTime<Utc>) -> f64 {
        let Some(limit) = active_limit(config) else {
            return 0.0;
        };
        let Some(mut window) = self.recent.get_mut(queue) else {
            return 0.0;
        };
        let span = window_span(&limit);
        prune(&mut window, span, now);
        if window.len() < limit.max_jobs as usize {
            return 0.0;
        }
        // The window is full; wait for the oldest entry that must leave
        // before another slot opens.
        let blocking = window[window.len() - limit.max_jobs as usize];
        match blocking.checked_add_signed(span) {
            Some(frees_at) => (frees_at - now).num_milliseconds().max(0) as f64,
            None => limit.window_ms as f64,
        }
    }
}

fn active_limit(config: &PriorityQueueConfig) -> Option<RateLimit> {
    config.rate_limiting.filter(|l| l.max_jobs > 0)
}

fn window_span(limit: &RateLimit) -> Duration {
    Duration::milliseconds(i64::try_from(limit.window_ms).unwrap_or(i64::MAX))
}

fn prune(window: &mut VecDeque<DateTime<Utc>>, span: Duration, now: DateTime<Utc>) {
    while window
        .front()
        .and_then(|t| t.checked_add_signed(span))
        .is_some_and(|end| end <= now)
    {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn queue(max_queue_size: u64) -> PriorityQueueConfig {
        PriorityQueueConfig {
            max_queue_size,
            ..Default::default()
        }
    }

    #[test]
    fn idle_queue_has_no_delay() {
        let fc = FairnessController::new();
        let d = fc.delay("email", 1.0, 0, &queue(1000), now());
        assert_eq!(d.delay_ms, 0);
        let d = fc.delay("email", 5.0, 0, &queue(1000), now());
        assert_eq!(d.delay_ms, 0);
    }

    #[test]
    fn capacity_delay_at_ninety_percent() {
        assert!((capacity_delay_ms(900, 1000) - 1000.0).abs() < 1e-6);
        assert_eq!(capacity_delay_ms(800, 1000), 0.0);
        assert!((capacity_delay_ms(1000, 1000) - 2000.0).abs() < 1e-6);

        let fc = FairnessController::new();
        let d = fc.delay("email", 1.9, 900, &queue(1000), now());
        assert!(d.delay_ms >= 1000);
        assert_eq!(d.delay_ms as f64, d.fairness_ms.max(d.capacity_ms).round());
    }

    #[test]
    fn fairness_delay_scales_with_score_backlog_and_ratio() {
        // 1000 × 2 × 0.5 × 5 × 0.8
        assert!((fairness_delay_ms(3.0, 500, 0.8) - 4000.0).abs() < 1e-6);
        // backlog factor caps at 10
        assert_eq!(fairness_delay_ms(3.0, 5000, 1.0), fairness_delay_ms(3.0, 1000, 1.0));
        assert_eq!(fairness_delay_ms(3.0, 500, 0.0), 0.0);
        assert!(fairness_delay_ms(4.0, 500, 0.5) > fairness_delay_ms(2.0, 500, 0.5));
    }

    #[test]
    fn delays_are_never_negative() {
        let fc = FairnessController::new();
        for score in [0.0, 1.0, 2.5, 7.0] {
            for backlog in [0, 1, 850, 10_000, u64::MAX] {
                for ratio in [-1.0, 0.0, 0.5, 1.0, 4.0] {
                    let config = PriorityQueueConfig {
                        fairness_ratio: ratio,
                        max_queue_size: 0,
                        ..Default::default()
                    };
                    let d = fc.delay("q", score, backlog, &config, now());
                    assert!(d.fairness_ms >= 0.0 && d.capacity_ms >= 0.0 && d.rate_ms >= 0.0);
                }
            }
        }
    }

    #[test]
    fn starvation_boost_thresholds_and_cap() {
        assert_eq!(starvation_boost(0), 0.0);
        assert_eq!(starvation_boost(STARVATION_THRESHOLD_MS), 0.0);
        assert!((starvation_boost(360_000) - 0.6).abs() < 1e-9);
        assert_eq!(starvation_boost(1_200_000), 2.0);
        assert_eq!(starvation_boost(i64::MAX), 2.0);
    }

    #[test]
    fn tracked_tier_gains_boost_when_idle() {
        let fc = FairnessController::new();
        let config = queue(1000);
        assert_eq!(fc.starvation_boost("email", Priority::Low, &config, now()), 0.0);

        fc.record_submission("email", Priority::Low, &config, now() - Duration::minutes(15));
        let boost = fc.starvation_boost("email", Priority::Low, &config, now());
        assert!((boost - 1.5).abs() < 1e-9);
        // Other tiers and queues are tracked separately.
        assert_eq!(fc.starvation_boost("email", Priority::High, &config, now()), 0.0);
        assert_eq!(fc.starvation_boost("reports", Priority::Low, &config, now()), 0.0);

        let disabled = PriorityQueueConfig {
            starvation_prevention: false,
            ..config
        };
        assert_eq!(fc.starvation_boost("email", Priority::Low, &disabled, now()), 0.0);
    }

    #[test]
    fn rate_limit_delays_until_window_frees() {
        let fc = FairnessController::new();
        let config = PriorityQueueConfig {
            rate_limiting: Some(RateLimit {
                window_ms: 10_000,
                max_jobs: 2,
            }),
            ..Default::default()
        };
        let t0 = now();
        fc.record_submission("email", Priority::Normal, &config, t0);
        assert_eq!(fc.delay("email", 1.0, 0, &config, t0).delay_ms, 0);

        fc.record_submission("email", Priority::Normal, &config, t0 + Duration::seconds(4));
        let d = fc.delay("email", 1.0, 0, &config, t0 + Duration::seconds(6));
        assert_eq!(d.delay_ms, 4000);

        // Oldest entry has left the window.
        let d = fc.delay("email", 1.0, 0, &config, t0 + Duration::seconds(10));
        assert_eq!(d.delay_ms, 0);
    }

    #[test]
    fn rate_window_is_empty_without_a_limit() {
        let fc = FairnessController::new();
        let config = PriorityQueueConfig::default();
        let t0 = now();
        for i in 0..5_000 {
            let at = t0 + Duration::milliseconds(i);
            fc.record_submission("email", Priority::Normal, &config, at);
            fc.delay("email", 1.0, 0, &config, at);
        }
        assert!(fc.recent.get("email").is_none());
    }

    #[test]
    fn rate_window_stays_bounded_by_max_jobs() {
        let fc = FairnessController::new();
        let limited = PriorityQueueConfig {
            rate_limiting: Some(RateLimit {
                window_ms: 60_000,
                max_jobs: 3,
            }),
            ..Default::default()
        };
        let t0 = now();
        for i in 0..1_000 {
            let at = t0 + Duration::milliseconds(i);
            fc.record_submission("email", Priority::Normal, &limited, at);
            assert!(fc.recent.get("email").map_or(0, |w| w.len()) <= 3);
        }
        // Still blocked by the newest three submissions.
        let d = fc.delay("email", 1.0, 0, &limited, t0 + Duration::seconds(1));
        assert_eq!(d.delay_ms, 59_997);

        // Entries older than the window are dropped on the next push.
        let later = t0 + Duration::minutes(5);
        fc.record_submission("email", Priority::Normal, &limited, later);
        assert_eq!(fc.recent.get("email").unwrap().len(), 1);

        // Lifting the limit discards the window.
        fc.sync_rate_limit("email", &PriorityQueueConfig::default());
        assert!(fc.recent.get("email").is_none());
    }
}

//! Dynamic priority scoring.
//!
//! A job's score starts at its tier weight (1 = urgent … 5 = deferred) and is
//! nudged by three signals: age pulls it toward urgency, queue backlog pushes
//! it away, and tier starvation (see [`crate::fairness`]) pulls it toward
//! urgency again. Lower is more urgent; the score never drops below 1.

use chrono::{DateTime, Utc};
use fairq_core::types::Priority;
use serde::Serialize;

/// Age at which the age boost saturates.
pub const AGE_BOOST_WINDOW_MS: f64 = 3_600_000.0; // 1 hour
pub const MAX_AGE_BOOST: f64 = 1.0;
/// Backlog size worth one point of penalty.
pub const LOAD_PENALTY_UNIT: f64 = 1000.0;
pub const MAX_LOAD_PENALTY: f64 = 2.0;
pub const MIN_SCORE: f64 = 1.0;

/// Every term that went into a score, kept for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriorityScore {
    pub base: f64,
    pub age_boost: f64,
    pub load_penalty: f64,
    pub starvation_boost: f64,
    pub score: f64,
}

impl PriorityScore {
    /// Integer priority for executors that only take whole numbers.
    pub fn executor_priority(&self) -> u32 {
        self.score.round().max(MIN_SCORE) as u32
    }
}

/// Up to one point gained linearly over the job's first hour.
pub fn age_boost(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_ms = (now - created_at).num_milliseconds().max(0) as f64;
    (age_ms / AGE_BOOST_WINDOW_MS).min(MAX_AGE_BOOST)
}

/// Up to two points lost as the queue backlog grows.
pub fn load_penalty(backlog: u64) -> f64 {
    (backlog as f64 / LOAD_PENALTY_UNIT).min(MAX_LOAD_PENALTY)
}

/// Combine tier, age, load and starvation into a single score.
pub fn dynamic_priority(
    priority: Priority,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    backlog: u64,
    starvation_boost: f64,
) -> PriorityScore {
    let base = f64::from(priority.weight());
    let age_boost = age_boost(created_at, now);
    let load_penalty = load_penalty(backlog);
    let score = (base - age_boost - starvation_boost + load_penalty).max(MIN_SCORE);
    PriorityScore {
        base,
        age_boost,
        load_penalty,
        starvation_boost,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn fresh_urgent_job_on_idle_queue_scores_one() {
        let s = dynamic_priority(Priority::Urgent, now(), now(), 0, 0.0);
        assert_eq!(s.score, 1.0);
        assert_eq!(s.executor_priority(), 1);
    }

    #[test]
    fn base_follows_tier_weight() {
        for p in Priority::ALL {
            let s = dynamic_priority(p, now(), now(), 0, 0.0);
            assert_eq!(s.base, f64::from(p.weight()));
            assert_eq!(s.score, s.base);
        }
    }

    #[test]
    fn age_boost_is_linear_then_capped() {
        assert_eq!(age_boost(now(), now()), 0.0);
        assert_eq!(age_boost(now() - Duration::minutes(30), now()), 0.5);
        assert_eq!(age_boost(now() - Duration::hours(1), now()), 1.0);
        assert_eq!(age_boost(now() - Duration::days(3), now()), 1.0);
        // Clock skew: a job from the future gets no boost.
        assert_eq!(age_boost(now() + Duration::minutes(5), now()), 0.0);
    }

    #[test]
    fn load_penalty_is_capped_at_two() {
        assert_eq!(load_penalty(0), 0.0);
        assert_eq!(load_penalty(900), 0.9);
        assert_eq!(load_penalty(2000), 2.0);
        assert_eq!(load_penalty(u64::MAX), 2.0);
    }

    #[test]
    fn score_is_non_increasing_with_age_and_bounded() {
        for p in Priority::ALL {
            for backlog in [0u64, 500, 5000] {
                let mut last = f64::INFINITY;
                for minutes in (0..=180).step_by(5) {
                    let created = now() - Duration::minutes(minutes);
                    let s = dynamic_priority(p, created, now(), backlog, 2.0);
                    assert!(s.score <= last, "score rose with age for {p}");
                    let floor = (s.base - 1.0 - 2.0 + s.load_penalty).max(1.0);
                    assert!(s.score >= floor);
                    last = s.score;
                }
            }
        }
    }

    #[test]
    fn starvation_boost_can_lift_deferred_work() {
        let created = now() - Duration::hours(2);
        let s = dynamic_priority(Priority::Deferred, created, now(), 0, 2.0);
        assert_eq!(s.score, 2.0);
    }

    #[test]
    fn score_never_below_one() {
        let created = now() - Duration::hours(5);
        let s = dynamic_priority(Priority::High, created, now(), 0, 2.0);
        assert_eq!(s.score, 1.0);
    }
}

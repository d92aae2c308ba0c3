//! `fairq-scheduler`: priority-aware job scheduling with weighted fairness.
//!
//! # Overview
//!
//! [`engine::SchedulerEngine`] decides *when* a job is handed to an external
//! executor and *at what priority*. Jobs are validated and persisted through
//! a [`store::KvStore`], scored by [`priority`], delayed by [`fairness`], and
//! routed by strategy:
//!
//! | Strategy      | Behaviour                                                   |
//! |---------------|-------------------------------------------------------------|
//! | `immediate`   | Scored and submitted now, with a fairness delay             |
//! | `delayed`     | One-shot task sleeps until `execute_at` / `delay_ms`        |
//! | `recurring`   | Task follows a 5-field cron pattern, honouring limit/end    |
//! | `conditional` | Task re-checks dependencies and triggers, fires once        |
//! | `batch`       | Payload items handed to a [`batch::BatchProcessor`]         |
//!
//! Background tasks are tokio tasks held in a [`tasks::TaskSet`]; cancelling
//! a job aborts its task.

pub mod batch;
pub mod condition;
pub mod cron;
pub mod db;
mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod fairness;
pub mod health;
pub mod priority;
pub mod probe;
pub mod registry;
pub mod results;
pub mod stats;
pub mod store;
pub mod tasks;

pub use engine::{Collaborators, SchedulerEngine};
pub use error::{CollaboratorError, Result, SchedulerError};
pub use health::{HealthReport, HealthStatus};
pub use registry::JobFilter;
pub use stats::SchedulingStats;

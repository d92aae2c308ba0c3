//! `fairq-core`: shared configuration, errors and data model for the fairq
//! priority scheduler.

pub mod config;
pub mod error;
pub mod types;

pub use config::FairqConfig;
pub use error::{CoreError, Result};

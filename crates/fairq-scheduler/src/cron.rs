use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;

use crate::error::CollaboratorError;

/// Source of fire times for recurring jobs.
pub trait CronSource: Send + Sync {
    /// Compute the next fire time strictly *after* `after`.
    ///
    /// Returns `Ok(None)` when the pattern never fires again, and
    /// `Err(Rejected)` when the pattern or timezone is malformed.
    fn next_fire(
        &self,
        pattern: &str,
        tz: Option<&str>,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CollaboratorError>;
}

/// Standard 5-field cron (`minute hour day-of-month month day-of-week`)
/// backed by the `croner` crate, evaluated in an optional IANA timezone.
#[derive(Debug, Default, Clone, Copy)]
pub struct CronerSource;

impl CronerSource {
    fn parse(pattern: &str) -> Result<Cron, CollaboratorError> {
        let fields = pattern.split_whitespace().count();
        if fields != 5 {
            return Err(CollaboratorError::Rejected(format!(
                "expected 5 fields, found {fields}"
            )));
        }
        Cron::from_str(pattern).map_err(|e| CollaboratorError::Rejected(e.to_string()))
    }
}

impl CronSource for CronerSource {
    fn next_fire(
        &self,
        pattern: &str,
        tz: Option<&str>,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CollaboratorError> {
        let cron = Self::parse(pattern)?;

        let next = match tz {
            None => cron.find_next_occurrence(&after, false).ok(),
            Some(name) => {
                let zone: Tz = name
                    .parse()
                    .map_err(|_| CollaboratorError::Rejected(format!("unknown timezone: {name}")))?;
                cron.find_next_occurrence(&after.with_timezone(&zone), false)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        };
        Ok(next)
    }
}

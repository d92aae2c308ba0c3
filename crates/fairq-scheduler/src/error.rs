use thiserror::Error;

/// Failures reported by external collaborators (executor, store, batch
/// processor, queue health, load probe).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator refused the request (unknown queue, full channel, …).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The collaborator could not be reached or is not in a usable state.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed job config: missing strategy fields, bad trigger, bad expression.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The job names a queue outside the known set.
    #[error("Unknown queue: {name}")]
    UnknownQueue { name: String },

    /// The recurring pattern or its timezone could not be parsed.
    #[error("Invalid cron pattern '{pattern}': {reason}")]
    CronParse { pattern: String, reason: String },

    /// The executor (or batch processor) rejected the submission.
    #[error("Dispatch of job {job_id} failed: {source}")]
    Dispatch {
        job_id: String,
        #[source]
        source: CollaboratorError,
    },

    /// The key/value store failed while persisting or loading job configs.
    #[error("Persistence error: {source}")]
    Persistence {
        #[source]
        source: CollaboratorError,
    },

    /// No job with the given ID exists in the registry.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// True for the failures that are reported synchronously at schedule time
    /// before anything is persisted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::Validation(_)
                | SchedulerError::UnknownQueue { .. }
                | SchedulerError::CronParse { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::UnknownQueue { .. } => "UNKNOWN_QUEUE",
            SchedulerError::CronParse { .. } => "CRON_PARSE_ERROR",
            SchedulerError::Dispatch { .. } => "DISPATCH_ERROR",
            SchedulerError::Persistence { .. } => "PERSISTENCE_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<CollaboratorError> for SchedulerError {
    fn from(source: CollaboratorError) -> Self {
        SchedulerError::Persistence { source }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

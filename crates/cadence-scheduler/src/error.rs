use thiserror::Error;

use crate::status::JobStatus;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored column could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The recurrence definition violates its construction rules.
    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(String),

    /// The requested status change is not an edge of the lifecycle graph.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// Another writer saved this job first; the caller's copy is stale.
    #[error("Concurrent modification of job {id}")]
    Conflict { id: String },

    /// The dispatch backend refused the job.
    #[error("Queue error: {0}")]
    Queue(String),
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::InvalidRecurrence(_) => "INVALID_RECURRENCE",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::Conflict { .. } => "CONFLICT",
            SchedulerError::Queue(_) => "QUEUE_ERROR",
        }
    }

    /// True when the error means "someone else got there first".
    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

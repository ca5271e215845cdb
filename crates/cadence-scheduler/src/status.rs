use serde::{Deserialize, Serialize};

/// Lifecycle state of a scheduled job.
///
/// ```text
/// Pending ──► Running ──► Completed
///    │           ├──────► FailedPermanent
///    │           └──────► Failed ──► Pending (retry)
///    │                      ├──────► FailedPermanent
///    └──► Canceled ◄────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next_run_at time.
    Pending,
    /// Claimed by exactly one worker and executing.
    Running,
    /// Finished all occurrences.
    Completed,
    /// Last attempt failed; eligible for retry after backoff.
    Failed,
    /// Retries exhausted. Never rescheduled.
    FailedPermanent,
    /// Stopped by an operator.
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::FailedPermanent,
        JobStatus::Canceled,
    ];

    /// The single source of truth for legal transitions.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Running | Canceled),
            Running => matches!(next, Completed | Failed | FailedPermanent),
            Failed => matches!(next, Pending | FailedPermanent | Canceled),
            Completed | FailedPermanent | Canceled => false,
        }
    }

    pub fn can_execute(self) -> bool {
        self == JobStatus::Pending
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::FailedPermanent | JobStatus::Canceled
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::FailedPermanent)
    }

    pub fn can_retry(self) -> bool {
        self == JobStatus::Failed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::FailedPermanent => "failed_permanent",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "failed_permanent" => Ok(JobStatus::FailedPermanent),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

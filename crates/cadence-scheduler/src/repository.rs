//! Persistence port for scheduled jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{error::Result, status::JobStatus, types::ScheduledJob};

/// The single source of truth for job state.
///
/// `save` is the atomic boundary. It must succeed only when the stored
/// `version` equals the caller's `job.version` (0 for a fresh insert), bump
/// the version on success, and fail with `SchedulerError::Conflict`
/// otherwise. Two workers claiming the same job therefore cannot both win.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<ScheduledJob>>;

    /// Pending or Failed jobs whose `next_run_at <= as_of`, earliest first.
    ///
    /// Failed rows are included so the runner can move them back to Pending
    /// once their backoff elapses.
    async fn find_due(&self, as_of: DateTime<Utc>) -> Result<Vec<ScheduledJob>>;

    async fn find_by_type(&self, job_type: &str) -> Result<Vec<ScheduledJob>>;

    async fn find_by_target(&self, target_id: &str) -> Result<Vec<ScheduledJob>>;

    async fn find_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<ScheduledJob>>;

    /// Compare-and-swap on `version`; updates `job.version` on success.
    async fn save(&self, job: &mut ScheduledJob) -> Result<()>;

    /// Returns `false` when no such job existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn count(&self, status: Option<JobStatus>) -> Result<usize>;
}

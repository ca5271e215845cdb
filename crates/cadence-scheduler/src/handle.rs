use std::sync::Arc;

use tracing::info;

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    recurrence::Recurrence,
    repository::ScheduleRepository,
    status::JobStatus,
    types::{NewJob, ScheduledJob},
};

/// Operator-facing job management (create, cancel, inspect, delete).
///
/// Shares the repository with the runners but never claims or executes
/// anything itself.
#[derive(Clone)]
pub struct SchedulerHandle {
    repository: Arc<dyn ScheduleRepository>,
    clock: Arc<dyn Clock>,
}

impl SchedulerHandle {
    pub fn new(repository: Arc<dyn ScheduleRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    /// Persist a new Pending job. Returns the fully populated record.
    pub async fn schedule(&self, new_job: NewJob) -> Result<ScheduledJob> {
        let mut job = ScheduledJob::new(new_job, self.clock.now());
        self.repository.save(&mut job).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            recurrence = %job.recurrence,
            next_run_at = %job.next_run_at,
            "job scheduled"
        );
        Ok(job)
    }

    /// Move a Pending or Failed job to Canceled.
    ///
    /// A Running job cannot be canceled; its occurrence runs to completion.
    /// Returns `Conflict` if a runner touched the job concurrently.
    pub async fn cancel(&self, id: &str) -> Result<ScheduledJob> {
        let mut job = self.load(id).await?;
        job.transition_to(JobStatus::Canceled, self.clock.now())?;
        self.repository.save(&mut job).await?;
        info!(job_id = %id, "job canceled");
        Ok(job)
    }

    /// Swap in a new recurrence for a job that is not finished or running.
    pub async fn replace_recurrence(&self, id: &str, recurrence: Recurrence) -> Result<ScheduledJob> {
        let mut job = self.load(id).await?;
        if job.status.is_final() || job.status == JobStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                from: job.status,
                to: JobStatus::Pending,
            });
        }
        job.recurrence = recurrence;
        job.updated_at = self.clock.now();
        self.repository.save(&mut job).await?;
        info!(job_id = %id, recurrence = %job.recurrence, "recurrence replaced");
        Ok(job)
    }

    /// Delete a job outright. Returns `JobNotFound` if nothing was deleted.
    pub async fn remove(&self, id: &str) -> Result<()> {
        if !self.repository.delete(id).await? {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job removed");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledJob>> {
        self.repository.find(id).await
    }

    pub async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<ScheduledJob>> {
        self.repository.find_by_status(status, limit).await
    }

    pub async fn list_by_type(&self, job_type: &str) -> Result<Vec<ScheduledJob>> {
        self.repository.find_by_type(job_type).await
    }

    pub async fn list_by_target(&self, target_id: &str) -> Result<Vec<ScheduledJob>> {
        self.repository.find_by_target(target_id).await
    }

    pub async fn count(&self, status: Option<JobStatus>) -> Result<usize> {
        self.repository.count(status).await
    }

    async fn load(&self, id: &str) -> Result<ScheduledJob> {
        self.repository
            .find(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }
}

//! In-memory repository for tests and single-process deployments.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::{Result, SchedulerError},
    repository::ScheduleRepository,
    status::JobStatus,
    types::ScheduledJob,
};

/// `HashMap`-backed store with the same version semantics as SQLite.
#[derive(Default)]
pub struct InMemoryRepository {
    jobs: Mutex<HashMap<String, ScheduledJob>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect<F>(&self, filter: F) -> Vec<ScheduledJob>
    where
        F: Fn(&ScheduledJob) -> bool,
    {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ScheduledJob> = jobs.values().filter(|j| filter(j)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryRepository {
    async fn find(&self, id: &str) -> Result<Option<ScheduledJob>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(id).cloned())
    }

    async fn find_due(&self, as_of: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        let mut due = self.collect(|j| {
            matches!(j.status, JobStatus::Pending | JobStatus::Failed) && j.next_run_at <= as_of
        });
        due.sort_by_key(|j| j.next_run_at);
        Ok(due)
    }

    async fn find_by_type(&self, job_type: &str) -> Result<Vec<ScheduledJob>> {
        Ok(self.collect(|j| j.job_type == job_type))
    }

    async fn find_by_target(&self, target_id: &str) -> Result<Vec<ScheduledJob>> {
        Ok(self.collect(|j| j.target_id == target_id))
    }

    async fn find_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<ScheduledJob>> {
        let mut matched = self.collect(|j| j.status == status);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn save(&self, job: &mut ScheduledJob) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let stored_version = jobs.get(&job.id).map(|j| j.version).unwrap_or(0);
        if stored_version != job.version {
            return Err(SchedulerError::Conflict { id: job.id.clone() });
        }
        job.version += 1;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.remove(id).is_some())
    }

    async fn count(&self, status: Option<JobStatus>) -> Result<usize> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match status {
            Some(status) => jobs.values().filter(|j| j.status == status).count(),
            None => jobs.len(),
        })
    }
}

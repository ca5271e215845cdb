use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    recurrence::Recurrence,
    status::JobStatus,
};

/// Latest instant a job can be scheduled at, 9999-12-31T23:59:59Z.
///
/// Past the four-digit years, RFC 3339 text no longer sorts chronologically.
pub fn latest_schedulable() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A persisted job record.
///
/// The repository owns the authoritative copy. Anything else holding a
/// `ScheduledJob` has a snapshot that must be saved (and may lose a version
/// race) before it counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// UUID v4 string, primary key.
    pub id: String,
    /// Selects the handler, e.g. "payroll.run".
    pub job_type: String,
    /// Entity the job acts on.
    pub target_id: String,
    pub recurrence: Recurrence,
    pub status: JobStatus,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Successful occurrences so far.
    pub occurrence_count: u32,
    /// Consecutive failures of the current occurrence.
    pub retry_count: u32,
    /// Opaque to the scheduler; handed to the handler untouched.
    pub payload: serde_json::Value,
    /// Reason of the most recent failure, cleared on success.
    pub last_error: Option<String>,
    /// Optimistic-concurrency token. 0 means never saved.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub target_id: String,
    pub recurrence: Recurrence,
    /// First fire time. `None` means "as soon as possible".
    pub first_run_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, target_id: impl Into<String>, recurrence: Recurrence) -> Self {
        Self {
            job_type: job_type.into(),
            target_id: target_id.into(),
            recurrence,
            first_run_at: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_run_at = Some(at);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

impl ScheduledJob {
    /// Build an unsaved Pending job.
    pub fn new(new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: new_job.job_type,
            target_id: new_job.target_id,
            recurrence: new_job.recurrence,
            status: JobStatus::Pending,
            next_run_at: new_job.first_run_at.unwrap_or(now),
            last_run_at: None,
            occurrence_count: 0,
            retry_count: 0,
            payload: new_job.payload,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending, scheduled time reached, and the recurrence still live.
    pub fn is_due(&self, clock: &dyn Clock) -> bool {
        let now = clock.now();
        self.status.can_execute()
            && self.next_run_at <= now
            && !self.recurrence.has_ended(now, self.occurrence_count)
    }

    /// Whether the occurrence this job is waiting on was already under way
    /// when its recurrence ran out: scheduled no later than the end date, or
    /// being retried after a failure. Such an occurrence still runs once
    /// picked up; only later ones are dropped.
    pub fn has_occurrence_in_flight(&self) -> bool {
        let within_budget = self
            .recurrence
            .max_occurrences()
            .map_or(true, |max| self.occurrence_count < max);
        let scheduled_in_window = self
            .recurrence
            .ends_at()
            .map_or(false, |end| self.next_run_at <= end);
        within_budget && (self.retry_count > 0 || scheduled_in_window)
    }

    /// Move to `next` if the lifecycle graph allows it; otherwise leave the
    /// job untouched and return `InvalidTransition`.
    pub fn transition_to(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Close the current occurrence of a recurring job and open the next one.
    ///
    /// This is the only way back to Pending from Running: it is an occurrence
    /// boundary, not a lifecycle edge, so `can_transition_to` still rejects
    /// `Running -> Pending`.
    pub fn begin_next_occurrence(&mut self, next_run_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.status = JobStatus::Pending;
        self.next_run_at = next_run_at;
        self.updated_at = now;
        Ok(())
    }
}

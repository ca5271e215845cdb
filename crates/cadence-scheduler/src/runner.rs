use std::{sync::Arc, time::Duration};

use cadence_core::config::SchedulerConfig;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    handler::{FailureNotifier, JobHandler, JobResult},
    queue::JobQueue,
    repository::ScheduleRepository,
    retry::RetryPolicy,
    status::JobStatus,
    types::{latest_schedulable, ScheduledJob},
};

/// Runner tuning, normally derived from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub tick_interval: Duration,
    /// Max due jobs processed per tick.
    pub batch_size: usize,
    /// Deadline for a synchronous handler call.
    pub execution_timeout: Duration,
    /// Running jobs not updated for this long are presumed orphaned.
    pub lease: Duration,
    pub retry: RetryPolicy,
}

impl RunnerConfig {
    /// Smallest lease that cannot expire while a handler is still inside
    /// its execution timeout.
    pub fn min_lease(&self) -> Duration {
        self.execution_timeout.saturating_add(self.tick_interval)
    }

    /// Raise `lease` to [`Self::min_lease`] if it is shorter.
    pub fn with_safe_lease(mut self) -> Self {
        let min = self.min_lease();
        if self.lease < min {
            warn!(
                lease_secs = self.lease.as_secs(),
                execution_timeout_secs = self.execution_timeout.as_secs(),
                "lease shorter than execution timeout; raising it to {}s",
                min.as_secs()
            );
            self.lease = min;
        }
        self
    }
}

impl From<&SchedulerConfig> for RunnerConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(cfg.tick_interval_secs.max(1)),
            batch_size: cfg.batch_size.max(1),
            execution_timeout: Duration::from_secs(cfg.execution_timeout_secs),
            lease: Duration::from_secs(cfg.lease_secs),
            retry: RetryPolicy::from(&cfg.retry),
        }
        .with_safe_lease()
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// What one tick did. Counters are per job, not per attempt.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Claims won (Pending → Running).
    pub claimed: usize,
    pub succeeded: usize,
    /// Failures that will be retried after backoff.
    pub failed: usize,
    pub permanently_failed: usize,
    /// Failed jobs moved back to Pending.
    pub retried: usize,
    /// Handed to the queue; outcome arrives later via `complete`.
    pub dispatched: usize,
    /// Claims given back because the queue refused the job.
    pub released: usize,
    /// Lost a race, or no longer due.
    pub skipped: usize,
    /// Completed without running because their recurrence had ended.
    pub retired: usize,
    /// Orphaned Running jobs pushed through the failure path.
    pub recovered: usize,
    /// Infrastructure errors; the affected job is retried on a later tick.
    pub errors: usize,
}

enum Execution {
    Finished(JobResult),
    Dispatched,
    Released(String),
}

/// Drives jobs through their lifecycle: poll, claim, execute, reschedule.
///
/// Any number of runners may share one repository. They never coordinate
/// directly; the repository's versioned `save` guarantees a single claim.
///
/// A claim is held for at most `lease`. Queue consumers must call
/// [`SchedulerRunner::complete`] within it, or the occurrence is failed and
/// retried.
pub struct SchedulerRunner {
    repository: Arc<dyn ScheduleRepository>,
    clock: Arc<dyn Clock>,
    handlers: Vec<Arc<dyn JobHandler>>,
    queue: Option<Arc<dyn JobQueue>>,
    notifier: Option<Arc<dyn FailureNotifier>>,
    config: RunnerConfig,
}

impl SchedulerRunner {
    pub fn new(
        repository: Arc<dyn ScheduleRepository>,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            repository,
            clock,
            handlers: Vec::new(),
            queue: None,
            notifier: None,
            config: config.with_safe_lease(),
        }
    }

    /// Register a synchronous handler. The first one whose `supports`
    /// matches a job's type wins.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Jobs no handler claims are dispatched here.
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Main event loop. Ticks every `tick_interval` until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.config.tick_interval.as_millis() as u64, "scheduler runner started");

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report != TickReport::default() {
                        debug!(?report, "tick finished");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler runner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One polling pass. Never fails: execution errors become job state and
    /// infrastructure errors are logged and counted.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        self.recover_stale_claims(&mut report).await;

        let due = match self.repository.find_due(self.clock.now()).await {
            Ok(due) => due,
            Err(e) => {
                error!("find_due failed: {e}");
                report.errors += 1;
                return report;
            }
        };

        for job in due {
            if report.claimed >= self.config.batch_size {
                break;
            }
            self.process(job, &mut report).await;
        }
        report
    }

    /// Out-of-band completion for a job previously handed to the queue.
    ///
    /// Returns the status the job ended up in.
    pub async fn complete(&self, job_id: &str, result: JobResult) -> Result<JobStatus> {
        let job = self
            .repository
            .find(job_id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: job_id.to_string() })?;
        if job.status != JobStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                from: job.status,
                to: if result.success {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                },
            });
        }
        self.apply_result(job, result).await
    }

    async fn process(&self, mut job: ScheduledJob, report: &mut TickReport) {
        if job.status.can_retry() {
            let now = self.clock.now();
            let requeued = match job.transition_to(JobStatus::Pending, now) {
                Ok(()) => self.repository.save(&mut job).await,
                Err(e) => Err(e),
            };
            match requeued {
                Ok(()) => {
                    debug!(job_id = %job.id, attempt = job.retry_count + 1, "retrying failed job");
                    report.retried += 1;
                }
                Err(e) => {
                    self.note_save_error(&job, "requeue", e, report);
                    return;
                }
            }
        }

        let now = self.clock.now();
        let run = if job.is_due(self.clock.as_ref()) {
            true
        } else if job.status.can_execute()
            && job.next_run_at <= now
            && job.recurrence.has_ended(now, job.occurrence_count)
        {
            // Ending a recurrence stops future occurrences, not one already
            // under way. Anything else left over is retired.
            job.has_occurrence_in_flight()
        } else {
            debug!(job_id = %job.id, status = %job.status, "not due; skipping");
            report.skipped += 1;
            return;
        };

        let claimed = match job.transition_to(JobStatus::Running, now) {
            Ok(()) => self.repository.save(&mut job).await,
            Err(e) => Err(e),
        };
        if let Err(e) = claimed {
            self.note_save_error(&job, "claim", e, report);
            return;
        }

        if !run {
            let retired = match job.transition_to(JobStatus::Completed, now) {
                Ok(()) => self.repository.save(&mut job).await,
                Err(e) => Err(e),
            };
            match retired {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        occurrences = job.occurrence_count,
                        "recurrence ended; job completed"
                    );
                    report.retired += 1;
                }
                Err(e) => self.note_save_error(&job, "retire", e, report),
            }
            return;
        }
        report.claimed += 1;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            occurrence = job.occurrence_count + 1,
            "job claimed"
        );

        match self.execute(&job).await {
            Execution::Dispatched => {
                debug!(job_id = %job.id, "job dispatched to queue");
                report.dispatched += 1;
            }
            Execution::Released(reason) => {
                warn!(job_id = %job.id, "dispatch failed, releasing claim: {reason}");
                match self.release(job, reason).await {
                    Ok(()) => report.released += 1,
                    Err(e) => {
                        error!("releasing claim failed: {e}");
                        report.errors += 1;
                    }
                }
            }
            Execution::Finished(result) => {
                let id = job.id.clone();
                match self.apply_result(job, result).await {
                    Ok(status) => tally(report, status),
                    Err(e) => {
                        error!(job_id = %id, "recording job outcome failed: {e}");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    fn note_save_error(&self, job: &ScheduledJob, step: &str, e: SchedulerError, report: &mut TickReport) {
        if e.is_conflict() {
            debug!(job_id = %job.id, step, "lost race to another worker");
            report.skipped += 1;
        } else {
            error!(job_id = %job.id, step, "{e}");
            report.errors += 1;
        }
    }

    async fn execute(&self, job: &ScheduledJob) -> Execution {
        if let Some(handler) = self.handlers.iter().find(|h| h.supports(&job.job_type)) {
            return Execution::Finished(self.run_handler(Arc::clone(handler), job.clone()).await);
        }
        if let Some(queue) = &self.queue {
            return match queue.dispatch(job, None).await {
                Ok(()) => Execution::Dispatched,
                Err(e) => Execution::Released(e.to_string()),
            };
        }
        Execution::Finished(JobResult::failure(format!(
            "no handler registered for job type '{}'",
            job.job_type
        )))
    }

    /// Run the handler on its own task so a panic or a hang cannot take the
    /// runner down with it.
    async fn run_handler(&self, handler: Arc<dyn JobHandler>, job: ScheduledJob) -> JobResult {
        let timeout = self.config.execution_timeout;
        let task = tokio::spawn(async move { handler.handle(&job).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => JobResult::failure(format!("handler error: {e:#}")),
            Ok(Err(join)) if join.is_panic() => JobResult::failure("handler panicked"),
            Ok(Err(_)) => JobResult::failure("handler task cancelled"),
            Err(_) => {
                abort.abort();
                JobResult::failure(format!("handler timed out after {}s", timeout.as_secs()))
            }
        }
    }

    /// Record the outcome of a Running job's occurrence and persist it.
    async fn apply_result(&self, mut job: ScheduledJob, result: JobResult) -> Result<JobStatus> {
        let now = self.clock.now();

        if result.success {
            job.occurrence_count += 1;
            job.last_run_at = Some(now);
            job.retry_count = 0;
            job.last_error = None;

            let next = if job.recurrence.has_ended(now, job.occurrence_count) {
                None
            } else {
                job.recurrence
                    .next_fire_after(now)
                    .filter(|next| job.recurrence.ends_at().map_or(true, |end| *next <= end))
            };
            match next {
                Some(next) => job.begin_next_occurrence(next, now)?,
                None => job.transition_to(JobStatus::Completed, now)?,
            }
        } else {
            job.retry_count += 1;
            let reason = result.message.unwrap_or_else(|| "job failed".to_string());
            job.last_error = Some(reason);
            if self.config.retry.should_retry(job.retry_count) {
                let delay = self.config.retry.backoff(job.retry_count);
                let latest = latest_schedulable();
                job.next_run_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .map_or(latest, |at| at.min(latest));
                job.transition_to(JobStatus::Failed, now)?;
            } else {
                job.transition_to(JobStatus::FailedPermanent, now)?;
            }
        }

        self.repository.save(&mut job).await?;

        match job.status {
            JobStatus::Pending => {
                info!(job_id = %job.id, next_run_at = %job.next_run_at, "occurrence completed")
            }
            JobStatus::Completed => {
                info!(job_id = %job.id, occurrences = job.occurrence_count, "job completed")
            }
            JobStatus::Failed => warn!(
                job_id = %job.id,
                retry = job.retry_count,
                next_run_at = %job.next_run_at,
                "job failed, retry scheduled: {}",
                job.last_error.as_deref().unwrap_or_default()
            ),
            JobStatus::FailedPermanent => self.alert(&job).await,
            _ => {}
        }
        Ok(job.status)
    }

    async fn alert(&self, job: &ScheduledJob) {
        let reason = job.last_error.as_deref().unwrap_or("job failed");
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            retries = job.retry_count,
            "job failed permanently: {reason}"
        );
        if let Some(notifier) = &self.notifier {
            notifier.permanent_failure(job, reason).await;
        }
    }

    /// Give back a claim without charging a retry: Running → Failed with the
    /// job's `next_run_at` untouched, so it is eligible again next tick.
    async fn release(&self, mut job: ScheduledJob, reason: String) -> Result<()> {
        job.last_error = Some(reason);
        job.transition_to(JobStatus::Failed, self.clock.now())?;
        self.repository.save(&mut job).await
    }

    /// A worker that died mid-occurrence leaves its job Running forever.
    /// Once the lease lapses, treat the occurrence as failed.
    async fn recover_stale_claims(&self, report: &mut TickReport) {
        let running = match self
            .repository
            .find_by_status(JobStatus::Running, self.config.batch_size)
            .await
        {
            Ok(running) => running,
            Err(e) => {
                error!("loading running jobs failed: {e}");
                report.errors += 1;
                return;
            }
        };

        let lease = chrono::Duration::from_std(self.config.lease).ok();
        let now = self.clock.now();
        for job in running {
            let expires = lease.and_then(|lease| job.updated_at.checked_add_signed(lease));
            if expires.map_or(true, |expires| expires > now) {
                continue;
            }
            warn!(job_id = %job.id, claimed_at = %job.updated_at, "claim lease expired");
            let id = job.id.clone();
            match self.apply_result(job, JobResult::failure("claim lease expired")).await {
                Ok(status) => {
                    report.recovered += 1;
                    tally(report, status);
                }
                Err(e) if e.is_conflict() => report.skipped += 1,
                Err(e) => {
                    error!(job_id = %id, "recovering stale claim failed: {e}");
                    report.errors += 1;
                }
            }
        }
    }
}

fn tally(report: &mut TickReport, status: JobStatus) {
    match status {
        JobStatus::Pending | JobStatus::Completed => report.succeeded += 1,
        JobStatus::Failed => report.failed += 1,
        JobStatus::FailedPermanent => report.permanently_failed += 1,
        JobStatus::Running | JobStatus::Canceled => {}
    }
}

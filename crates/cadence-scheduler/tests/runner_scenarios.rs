// End-to-end runner behaviour against in-memory and SQLite repositories,
// driven by a manual clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cadence_scheduler::{
    ChannelQueue, Clock, FailureNotifier, InMemoryRepository, JobHandler, JobResult, JobStatus,
    ManualClock, NewJob, Recurrence, RetryPolicy, RunnerConfig, ScheduleRepository,
    ScheduledJob, SchedulerHandle, SchedulerRunner, SqliteRepository, TickReport,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{Barrier, Notify};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
}

fn config() -> RunnerConfig {
    RunnerConfig {
        tick_interval: StdDuration::from_secs(1),
        batch_size: 100,
        execution_timeout: StdDuration::from_secs(5),
        lease: StdDuration::from_secs(15 * 60),
        retry: RetryPolicy::new(3, StdDuration::from_secs(10), StdDuration::from_secs(3600)),
    }
}

enum Behavior {
    Succeed,
    Fail,
    Error,
    Panic,
    Hang,
    Block {
        started: Arc<Notify>,
        release: Arc<Notify>,
    },
}

struct TestHandler {
    job_type: &'static str,
    behavior: Behavior,
    calls: AtomicUsize,
}

impl TestHandler {
    fn new(job_type: &'static str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            job_type,
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for TestHandler {
    fn supports(&self, job_type: &str) -> bool {
        job_type == self.job_type
    }

    async fn handle(&self, job: &ScheduledJob) -> anyhow::Result<JobResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => Ok(JobResult::success()
                .with_metadata(serde_json::json!({ "target": job.target_id }))),
            Behavior::Fail => Ok(JobResult::failure("downstream rejected")),
            Behavior::Error => Err(anyhow::anyhow!("connection reset")),
            Behavior::Panic => panic!("handler blew up"),
            Behavior::Hang => {
                tokio::time::sleep(StdDuration::from_secs(3600)).await;
                Ok(JobResult::success())
            }
            Behavior::Block { ref started, ref release } => {
                started.notify_one();
                release.notified().await;
                Ok(JobResult::success())
            }
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl FailureNotifier for RecordingNotifier {
    async fn permanent_failure(&self, job: &ScheduledJob, reason: &str) {
        self.alerts
            .lock()
            .unwrap()
            .push((job.id.clone(), reason.to_string()));
    }
}

/// Holds every `find_due` caller at two barriers so tests can line up
/// concurrent runners (or an operator action) between polling and claiming.
struct GatedRepository {
    inner: Arc<dyn ScheduleRepository>,
    fetched: Arc<Barrier>,
    release: Arc<Barrier>,
    gated_calls: AtomicUsize,
}

impl GatedRepository {
    fn new(inner: Arc<dyn ScheduleRepository>, parties: usize, gated_calls: usize) -> Self {
        Self {
            inner,
            fetched: Arc::new(Barrier::new(parties)),
            release: Arc::new(Barrier::new(parties)),
            gated_calls: AtomicUsize::new(gated_calls),
        }
    }
}

#[async_trait]
impl ScheduleRepository for GatedRepository {
    async fn find(&self, id: &str) -> cadence_scheduler::Result<Option<ScheduledJob>> {
        self.inner.find(id).await
    }

    async fn find_due(&self, as_of: DateTime<Utc>) -> cadence_scheduler::Result<Vec<ScheduledJob>> {
        let due = self.inner.find_due(as_of).await?;
        let gated = self
            .gated_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if gated {
            self.fetched.wait().await;
            self.release.wait().await;
        }
        Ok(due)
    }

    async fn find_by_type(&self, job_type: &str) -> cadence_scheduler::Result<Vec<ScheduledJob>> {
        self.inner.find_by_type(job_type).await
    }

    async fn find_by_target(&self, target_id: &str) -> cadence_scheduler::Result<Vec<ScheduledJob>> {
        self.inner.find_by_target(target_id).await
    }

    async fn find_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> cadence_scheduler::Result<Vec<ScheduledJob>> {
        self.inner.find_by_status(status, limit).await
    }

    async fn save(&self, job: &mut ScheduledJob) -> cadence_scheduler::Result<()> {
        self.inner.save(job).await
    }

    async fn delete(&self, id: &str) -> cadence_scheduler::Result<bool> {
        self.inner.delete(id).await
    }

    async fn count(&self, status: Option<JobStatus>) -> cadence_scheduler::Result<usize> {
        self.inner.count(status).await
    }
}

struct Harness {
    repo: Arc<InMemoryRepository>,
    clock: Arc<ManualClock>,
    handle: SchedulerHandle,
}

impl Harness {
    fn new() -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let handle = SchedulerHandle::new(repo.clone(), clock.clone());
        Self { repo, clock, handle }
    }

    fn runner(&self) -> SchedulerRunner {
        SchedulerRunner::new(self.repo.clone(), self.clock.clone(), config())
    }

    async fn schedule(&self, job_type: &str, recurrence: Recurrence) -> ScheduledJob {
        self.handle
            .schedule(NewJob::new(job_type, "acct-7", recurrence).starting_at(t0()))
            .await
            .unwrap()
    }

    async fn load(&self, id: &str) -> ScheduledJob {
        self.repo.find(id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn daily_job_returns_to_pending_one_day_later() {
    let h = Harness::new();
    let handler = TestHandler::new("report", Behavior::Succeed);
    let runner = h.runner().with_handler(handler.clone());
    let job = h.schedule("report", Recurrence::daily()).await;

    let report = runner.tick().await;
    assert_eq!(report.claimed, 1);
    assert_eq!(report.succeeded, 1);

    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.occurrence_count, 1);
    let last = stored.last_run_at.unwrap();
    assert_eq!(last, t0());
    assert_eq!(stored.next_run_at, last + Duration::days(1));

    // nothing more until tomorrow
    h.clock.advance(Duration::hours(23));
    assert_eq!(runner.tick().await.claimed, 0);
    h.clock.advance(Duration::hours(1));
    assert_eq!(runner.tick().await.claimed, 1);
    assert_eq!(handler.calls(), 2);
    assert_eq!(h.load(&job.id).await.occurrence_count, 2);
}

#[tokio::test]
async fn one_time_job_completes_after_success() {
    let h = Harness::new();
    let runner = h.runner().with_handler(TestHandler::new("once", Behavior::Succeed));
    let job = h.schedule("once", Recurrence::once()).await;

    runner.tick().await;
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.occurrence_count, 1);

    h.clock.advance(Duration::days(30));
    assert_eq!(runner.tick().await, TickReport::default());
}

#[tokio::test]
async fn occurrence_budget_completes_the_job() {
    let h = Harness::new();
    let handler = TestHandler::new("ping", Behavior::Succeed);
    let runner = h.runner().with_handler(handler.clone());
    let job = h
        .schedule("ping", Recurrence::every_n_hours(1).unwrap().with_max_occurrences(2).unwrap())
        .await;

    runner.tick().await;
    assert_eq!(h.load(&job.id).await.status, JobStatus::Pending);
    h.clock.advance(Duration::hours(1));
    runner.tick().await;
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.occurrence_count, 2);
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn next_occurrence_past_end_date_completes() {
    let h = Harness::new();
    let runner = h.runner().with_handler(TestHandler::new("digest", Behavior::Succeed));
    let job = h
        .schedule("digest", Recurrence::daily().ending_at(t0() + Duration::hours(12)))
        .await;

    runner.tick().await;
    assert_eq!(h.load(&job.id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn three_failures_with_three_retries_is_permanent() {
    let h = Harness::new();
    let handler = TestHandler::new("sync", Behavior::Fail);
    let notifier = Arc::new(RecordingNotifier::default());
    let runner = h
        .runner()
        .with_handler(handler.clone())
        .with_notifier(notifier.clone());
    let job = h.schedule("sync", Recurrence::daily()).await;

    let report = runner.tick().await;
    assert_eq!(report.failed, 1);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.next_run_at, t0() + Duration::seconds(10));
    assert_eq!(stored.last_error.as_deref(), Some("downstream rejected"));

    // backoff not yet elapsed
    h.clock.advance(Duration::seconds(5));
    assert_eq!(runner.tick().await.claimed, 0);

    h.clock.advance(Duration::seconds(5));
    let report = runner.tick().await;
    assert_eq!((report.retried, report.claimed, report.failed), (1, 1, 1));
    let stored = h.load(&job.id).await;
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.next_run_at, h.clock.now() + Duration::seconds(20));

    h.clock.advance(Duration::seconds(20));
    let report = runner.tick().await;
    assert_eq!(report.permanently_failed, 1);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::FailedPermanent);
    assert_eq!(stored.retry_count, 3);
    assert_eq!(handler.calls(), 3);

    let alerts = notifier.alerts.lock().unwrap().clone();
    assert_eq!(alerts, vec![(job.id.clone(), "downstream rejected".to_string())]);

    h.clock.advance(Duration::days(2));
    assert_eq!(runner.tick().await.claimed, 0);
    assert_eq!(handler.calls(), 3);
}

#[tokio::test]
async fn success_after_failure_resets_retry_count() {
    let h = Harness::new();
    let job = h.schedule("flaky", Recurrence::daily()).await;

    h.runner()
        .with_handler(TestHandler::new("flaky", Behavior::Fail))
        .tick()
        .await;
    assert_eq!(h.load(&job.id).await.retry_count, 1);

    h.clock.advance(Duration::seconds(10));
    h.runner()
        .with_handler(TestHandler::new("flaky", Behavior::Succeed))
        .tick()
        .await;
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert!(stored.last_error.is_none());
    assert_eq!(stored.occurrence_count, 1);
}

#[tokio::test]
async fn handler_error_and_panic_become_failures() {
    let h = Harness::new();
    let errored = h.schedule("err", Recurrence::once()).await;
    let panicked = h.schedule("boom", Recurrence::once()).await;
    let runner = h
        .runner()
        .with_handler(TestHandler::new("err", Behavior::Error))
        .with_handler(TestHandler::new("boom", Behavior::Panic));

    let report = runner.tick().await;
    assert_eq!(report.failed, 2);

    let e = h.load(&errored.id).await;
    assert_eq!(e.status, JobStatus::Failed);
    assert!(e.last_error.unwrap().contains("connection reset"));

    let p = h.load(&panicked.id).await;
    assert_eq!(p.status, JobStatus::Failed);
    assert_eq!(p.last_error.as_deref(), Some("handler panicked"));
}

#[tokio::test(start_paused = true)]
async fn hung_handler_times_out() {
    let h = Harness::new();
    let job = h.schedule("slow", Recurrence::once()).await;
    let runner = h.runner().with_handler(TestHandler::new("slow", Behavior::Hang));

    let report = runner.tick().await;
    assert_eq!(report.failed, 1);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn unhandled_job_type_fails() {
    let h = Harness::new();
    let job = h.schedule("orphan", Recurrence::once()).await;
    h.runner()
        .with_handler(TestHandler::new("other", Behavior::Succeed))
        .tick()
        .await;
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.last_error.unwrap().contains("orphan"));
}

#[tokio::test]
async fn first_supporting_handler_wins() {
    let h = Harness::new();
    h.schedule("report", Recurrence::once()).await;
    let first = TestHandler::new("report", Behavior::Succeed);
    let second = TestHandler::new("report", Behavior::Succeed);
    h.runner()
        .with_handler(first.clone())
        .with_handler(second.clone())
        .tick()
        .await;
    assert_eq!((first.calls(), second.calls()), (1, 0));
}

#[tokio::test]
async fn queued_job_completes_out_of_band() {
    let h = Harness::new();
    let (queue, mut rx) = ChannelQueue::new(8);
    let handler = TestHandler::new("sync-only", Behavior::Succeed);
    let runner = h
        .runner()
        .with_handler(handler.clone())
        .with_queue(Arc::new(queue));
    let job = h.schedule("email", Recurrence::weekly()).await;

    let report = runner.tick().await;
    assert_eq!((report.claimed, report.dispatched), (1, 1));
    assert_eq!(handler.calls(), 0, "a job goes to at most one port");

    let delivered = rx.recv().await.unwrap();
    assert_eq!(delivered.id, job.id);
    assert_eq!(delivered.status, JobStatus::Running);
    assert_eq!(h.load(&job.id).await.status, JobStatus::Running);

    // still Running: a second tick must not re-dispatch
    assert_eq!(runner.tick().await.dispatched, 0);

    h.clock.advance(Duration::minutes(3));
    let status = runner.complete(&job.id, JobResult::success()).await.unwrap();
    assert_eq!(status, JobStatus::Pending);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.next_run_at, t0() + Duration::minutes(3) + Duration::weeks(1));

    let err = runner.complete(&job.id, JobResult::success()).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
    assert_eq!(
        runner.complete("missing", JobResult::success()).await.unwrap_err().code(),
        "JOB_NOT_FOUND"
    );
}

#[tokio::test]
async fn queue_rejection_releases_claim_without_charging_a_retry() {
    let h = Harness::new();
    let (queue, mut rx) = ChannelQueue::new(1);
    // occupy the only slot
    let filler = ScheduledJob::new(NewJob::new("filler", "x", Recurrence::once()), t0());
    cadence_scheduler::JobQueue::dispatch(&queue, &filler, None).await.unwrap();

    let runner = h.runner().with_queue(Arc::new(queue));
    let job = h.schedule("email", Recurrence::once()).await;

    let report = runner.tick().await;
    assert_eq!(report.released, 1);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.next_run_at, t0());

    rx.recv().await.unwrap();
    let report = runner.tick().await;
    assert_eq!((report.retried, report.dispatched), (1, 1));
    assert_eq!(rx.recv().await.unwrap().id, job.id);
}

#[tokio::test]
async fn canceled_job_is_never_run() {
    let h = Harness::new();
    let handler = TestHandler::new("report", Behavior::Succeed);
    let runner = h.runner().with_handler(handler.clone());
    let job = h.schedule("report", Recurrence::daily()).await;

    h.handle.cancel(&job.id).await.unwrap();
    runner.tick().await;
    assert_eq!(handler.calls(), 0);
    assert_eq!(h.load(&job.id).await.status, JobStatus::Canceled);
}

#[tokio::test]
async fn cancel_between_poll_and_claim_is_honored() {
    let clock = Arc::new(ManualClock::new(t0()));
    let gated = Arc::new(GatedRepository::new(Arc::new(InMemoryRepository::new()), 2, 1));
    let handle = SchedulerHandle::new(gated.clone(), clock.clone());
    let handler = TestHandler::new("report", Behavior::Succeed);
    let runner = SchedulerRunner::new(gated.clone(), clock.clone(), config())
        .with_handler(handler.clone());
    let job = handle
        .schedule(NewJob::new("report", "t", Recurrence::daily()).starting_at(t0()))
        .await
        .unwrap();

    let operator = async {
        gated.fetched.wait().await;
        handle.cancel(&job.id).await.unwrap();
        gated.release.wait().await;
    };
    let (report, ()) = tokio::join!(runner.tick(), operator);

    assert_eq!(report.claimed, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(handler.calls(), 0);
    assert_eq!(
        handle.get(&job.id).await.unwrap().unwrap().status,
        JobStatus::Canceled
    );
}

async fn race_two_runners(repo: Arc<dyn ScheduleRepository>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let gated = Arc::new(GatedRepository::new(repo, 2, 2));
    let handler = TestHandler::new("payroll", Behavior::Succeed);
    let a = SchedulerRunner::new(gated.clone(), clock.clone(), config()).with_handler(handler.clone());
    let b = SchedulerRunner::new(gated.clone(), clock.clone(), config()).with_handler(handler.clone());

    let mut job = ScheduledJob::new(
        NewJob::new("payroll", "acme", Recurrence::monthly()).starting_at(t0()),
        t0(),
    );
    gated.save(&mut job).await.unwrap();

    let (ra, rb) = tokio::join!(a.tick(), b.tick());

    assert_eq!(ra.claimed + rb.claimed, 1, "exactly one claim wins");
    assert_eq!(ra.skipped + rb.skipped, 1, "the loser skips quietly");
    assert_eq!(ra.errors + rb.errors, 0);
    assert_eq!(handler.calls(), 1);

    let stored = gated.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.occurrence_count, 1);
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.next_run_at, Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap());
}

#[tokio::test]
async fn two_runners_race_in_memory() {
    race_two_runners(Arc::new(InMemoryRepository::new())).await;
}

#[tokio::test]
async fn two_runners_race_sqlite() {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    race_two_runners(Arc::new(SqliteRepository::new(conn).unwrap())).await;
}

#[tokio::test]
async fn orphaned_claim_is_recovered_after_lease() {
    let h = Harness::new();
    let runner = h.runner();
    let mut job = h.schedule("report", Recurrence::daily()).await;
    job.transition_to(JobStatus::Running, t0()).unwrap();
    h.repo.save(&mut job).await.unwrap();

    h.clock.advance(Duration::minutes(10));
    assert_eq!(runner.tick().await.recovered, 0);

    h.clock.advance(Duration::minutes(6));
    let report = runner.tick().await;
    assert_eq!(report.recovered, 1);
    assert_eq!(report.failed, 1);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("claim lease expired"));
}

#[tokio::test]
async fn batch_size_limits_claims_per_tick() {
    let h = Harness::new();
    for _ in 0..5 {
        h.schedule("bulk", Recurrence::once()).await;
    }
    let runner = SchedulerRunner::new(
        h.repo.clone(),
        h.clock.clone(),
        RunnerConfig {
            batch_size: 2,
            ..config()
        },
    )
    .with_handler(TestHandler::new("bulk", Behavior::Succeed));

    assert_eq!(runner.tick().await.claimed, 2);
    assert_eq!(runner.tick().await.claimed, 2);
    assert_eq!(runner.tick().await.claimed, 1);
    assert_eq!(h.repo.count(Some(JobStatus::Completed)).await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_shutdown() {
    let h = Harness::new();
    let handler = TestHandler::new("report", Behavior::Succeed);
    let runner = Arc::new(h.runner().with_handler(handler.clone()));
    h.schedule("report", Recurrence::once()).await;

    let (tx, rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(runner.run(rx));

    tokio::time::sleep(StdDuration::from_secs(3)).await;
    tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn final_occurrence_picked_up_after_end_still_runs() {
    let h = Harness::new();
    let handler = TestHandler::new("digest", Behavior::Succeed);
    let runner = h.runner().with_handler(handler.clone());
    let end = t0() + Duration::days(1);
    let job = h.schedule("digest", Recurrence::daily().ending_at(end)).await;

    runner.tick().await;
    assert_eq!(h.load(&job.id).await.next_run_at, end);

    h.clock.set(end + Duration::seconds(1));
    let report = runner.tick().await;
    assert_eq!(report.claimed, 1);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.occurrence_count, 2);
    assert_eq!(handler.calls(), 2);

    h.clock.advance(Duration::days(30));
    assert_eq!(runner.tick().await, TickReport::default());
}

#[tokio::test]
async fn retry_crossing_end_date_still_runs() {
    let h = Harness::new();
    let job = h
        .schedule("sync", Recurrence::daily().ending_at(t0() + Duration::seconds(5)))
        .await;

    h.runner()
        .with_handler(TestHandler::new("sync", Behavior::Fail))
        .tick()
        .await;
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.next_run_at > stored.recurrence.ends_at().unwrap());

    h.clock.advance(Duration::seconds(10));
    let handler = TestHandler::new("sync", Behavior::Succeed);
    let report = h.runner().with_handler(handler.clone()).tick().await;
    assert_eq!((report.retried, report.claimed, report.succeeded), (1, 1, 1));
    assert_eq!(handler.calls(), 1);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.occurrence_count, 1);
}

#[tokio::test]
async fn ended_recurrence_is_retired_without_running() {
    let h = Harness::new();
    let handler = TestHandler::new("report", Behavior::Succeed);
    let runner = h.runner().with_handler(handler.clone());
    let job = h.schedule("report", Recurrence::daily()).await;
    runner.tick().await;

    // the pending occurrence now lies past the end date
    h.handle
        .replace_recurrence(&job.id, Recurrence::daily().ending_at(t0() + Duration::hours(1)))
        .await
        .unwrap();
    h.clock.advance(Duration::days(2));

    let report = runner.tick().await;
    assert_eq!((report.retired, report.claimed, report.skipped), (1, 0, 0));
    assert_eq!(handler.calls(), 1);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.occurrence_count, 1);
}

#[tokio::test]
async fn ended_jobs_do_not_starve_the_batch() {
    let h = Harness::new();
    let handler = TestHandler::new("report", Behavior::Succeed);
    let runner = SchedulerRunner::new(
        h.repo.clone(),
        h.clock.clone(),
        RunnerConfig {
            batch_size: 2,
            ..config()
        },
    )
    .with_handler(handler.clone());

    let mut stale = Vec::new();
    for _ in 0..2 {
        let job = h.schedule("report", Recurrence::daily()).await;
        h.handle
            .replace_recurrence(&job.id, Recurrence::daily().ending_at(t0() - Duration::hours(1)))
            .await
            .unwrap();
        stale.push(job.id);
    }
    h.clock.advance(Duration::minutes(1));
    let fresh = h
        .handle
        .schedule(NewJob::new("report", "acct-9", Recurrence::once()))
        .await
        .unwrap();

    let report = runner.tick().await;
    assert_eq!((report.retired, report.claimed), (2, 1));
    assert_eq!(h.load(&fresh.id).await.status, JobStatus::Completed);
    for id in &stale {
        assert_eq!(h.load(id).await.status, JobStatus::Completed);
    }
    assert_eq!(handler.calls(), 1);
    assert_eq!(h.repo.count(Some(JobStatus::Pending)).await.unwrap(), 0);
}

#[tokio::test]
async fn running_handler_is_not_recovered_before_its_timeout() {
    let h = Harness::new();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let handler = TestHandler::new(
        "export",
        Behavior::Block {
            started: started.clone(),
            release: release.clone(),
        },
    );
    // configured lease shorter than the execution timeout
    let short_lease = RunnerConfig {
        execution_timeout: StdDuration::from_secs(120),
        lease: StdDuration::from_secs(60),
        ..config()
    };
    let a = Arc::new(
        SchedulerRunner::new(h.repo.clone(), h.clock.clone(), short_lease.clone())
            .with_handler(handler.clone()),
    );
    let b = SchedulerRunner::new(h.repo.clone(), h.clock.clone(), short_lease)
        .with_handler(handler.clone());
    assert!(b.config().lease > b.config().execution_timeout);

    let job = h.schedule("export", Recurrence::daily()).await;
    let first = tokio::spawn({
        let a = a.clone();
        async move { a.tick().await }
    });
    started.notified().await;

    h.clock.advance(Duration::seconds(90));
    let report = b.tick().await;
    assert_eq!(report.recovered, 0);
    assert_eq!(h.load(&job.id).await.status, JobStatus::Running);

    release.notify_one();
    let report = first.await.unwrap();
    assert_eq!((report.succeeded, report.errors), (1, 0));
    assert_eq!(handler.calls(), 1);
    assert_eq!(h.load(&job.id).await.status, JobStatus::Pending);
}

#[tokio::test]
async fn unrepresentable_backoff_is_clamped() {
    let h = Harness::new();
    let job = h.schedule("sync", Recurrence::daily()).await;
    let runner = SchedulerRunner::new(
        h.repo.clone(),
        h.clock.clone(),
        RunnerConfig {
            retry: RetryPolicy::new(3, StdDuration::MAX, StdDuration::MAX),
            ..config()
        },
    )
    .with_handler(TestHandler::new("sync", Behavior::Fail));

    runner.tick().await;
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.next_run_at, cadence_scheduler::types::latest_schedulable());
    h.clock.advance(Duration::days(365 * 100));
    assert_eq!(runner.tick().await.claimed, 0);
}

#[tokio::test]
async fn lost_delivery_is_recovered_after_lease() {
    let h = Harness::new();
    let (queue, rx) = ChannelQueue::new(8);
    let runner = h.runner().with_queue(Arc::new(queue));
    let job = h.schedule("email", Recurrence::daily()).await;

    assert_eq!(runner.tick().await.dispatched, 1);
    // consumer goes away without acknowledging
    drop(rx);
    assert_eq!(h.load(&job.id).await.status, JobStatus::Running);

    h.clock.advance(Duration::minutes(16));
    let report = runner.tick().await;
    assert_eq!(report.recovered, 1);
    let stored = h.load(&job.id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("claim lease expired"));
}

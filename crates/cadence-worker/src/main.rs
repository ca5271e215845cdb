use std::io::Write;
use std::sync::Arc;

use cadence_core::CadenceConfig;
use cadence_scheduler::{
    ChannelQueue, JobResult, RunnerConfig, ScheduledJob, SchedulerRunner, SqliteRepository,
    SystemClock,
};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Polls the job store and hands due jobs to the delivery task.
#[derive(Debug, Parser)]
#[command(name = "cadence-worker", version)]
struct Args {
    /// Config file (defaults to ~/.cadence/cadence.toml).
    #[arg(long)]
    config: Option<String>,

    /// SQLite database path, overrides `database.path`.
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_worker=info,cadence_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = CadenceConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        CadenceConfig::default()
    });
    if let Some(path) = args.database {
        config.database.path = path;
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let repository = Arc::new(SqliteRepository::new(db)?);

    let (queue, delivery_rx) = ChannelQueue::new(config.worker.queue_capacity.max(1));
    let runner = Arc::new(
        SchedulerRunner::new(
            repository,
            Arc::new(SystemClock),
            RunnerConfig::from(&config.scheduler),
        )
        .with_queue(Arc::new(queue)),
    );

    let delivery = tokio::spawn(deliver(Arc::clone(&runner), delivery_rx));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loop_task = tokio::spawn(Arc::clone(&runner).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, stopping");
    let _ = shutdown_tx.send(true);
    loop_task.await?;

    // jobs still queued stay Running and are recovered once their lease lapses
    delivery.abort();
    Ok(())
}

/// Emit each dispatched job as one JSON line on stdout, then acknowledge it.
async fn deliver(runner: Arc<SchedulerRunner>, mut rx: mpsc::Receiver<ScheduledJob>) {
    while let Some(job) = rx.recv().await {
        let result = match emit(&job) {
            Ok(()) => JobResult::success(),
            Err(e) => {
                warn!(job_id = %job.id, "delivery failed: {e}");
                JobResult::failure(format!("delivery failed: {e}"))
            }
        };
        match runner.complete(&job.id, result).await {
            Ok(status) => info!(job_id = %job.id, %status, "job acknowledged"),
            Err(e) => warn!(job_id = %job.id, code = e.code(), "acknowledging job failed: {e}"),
        }
    }
}

fn emit(job: &ScheduledJob) -> anyhow::Result<()> {
    let line = serde_json::to_string(job)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

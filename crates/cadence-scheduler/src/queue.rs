//! Dispatch port: hand a claimed job to an execution backend.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::{
    error::{Result, SchedulerError},
    types::ScheduledJob,
};

/// Fire-and-forget handoff. Completion is reported back out of band via
/// [`crate::runner::SchedulerRunner::complete`].
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// `delay` asks the backend to hold the job before running it.
    async fn dispatch(&self, job: &ScheduledJob, delay: Option<Duration>) -> Result<()>;
}

/// In-process queue over a bounded tokio mpsc channel.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<ScheduledJob>,
}

impl ChannelQueue {
    /// Create a queue and the receiving end the execution side consumes.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ScheduledJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn dispatch(&self, job: &ScheduledJob, delay: Option<Duration>) -> Result<()> {
        match delay {
            None | Some(Duration::ZERO) => {
                // try_send never stalls the tick loop; a full channel is a
                // dispatch failure the runner can release.
                self.tx.try_send(job.clone()).map_err(|e| match e {
                    TrySendError::Full(_) => SchedulerError::Queue("dispatch channel full".into()),
                    TrySendError::Closed(_) => {
                        SchedulerError::Queue("dispatch channel closed".into())
                    }
                })
            }
            Some(delay) => {
                if self.tx.is_closed() {
                    return Err(SchedulerError::Queue("dispatch channel closed".into()));
                }
                let tx = self.tx.clone();
                let job = job.clone();
                // A send lost here leaves the job Running; lease recovery picks it up.
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let id = job.id.clone();
                    if tx.send(job).await.is_err() {
                        warn!(job_id = %id, "delayed dispatch dropped: channel closed");
                    }
                });
                Ok(())
            }
        }
    }
}

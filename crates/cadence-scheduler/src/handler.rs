//! Execution port and the alerting hook for permanent failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::ScheduledJob;

/// What a handler reports back for one occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl JobResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
            metadata: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Runs a job's business action.
///
/// Handlers may see the same occurrence more than once (at-least-once
/// redelivery) and must be idempotent. An `Err` is treated exactly like
/// `JobResult::failure`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn supports(&self, job_type: &str) -> bool;

    async fn handle(&self, job: &ScheduledJob) -> anyhow::Result<JobResult>;
}

/// Receives every job that lands in `FailedPermanent`.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn permanent_failure(&self, job: &ScheduledJob, reason: &str);
}

//! Job handler contract and lifecycle events

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{ExecutorError, SchedulerError};
use crate::persistence::StoreError;
use crate::queue::{ClaimedJob, JobQueue, QueueError};

/// Errors a job handler reports back to the pool
///
/// Every variant fails the job; the queue retries it while attempts remain.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The handler did not finish within the job timeout
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
}

/// Lifecycle event published by the worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Progress {
        job_id: Uuid,
        job_type: String,
        progress: u8,
    },
    Completed {
        job_id: Uuid,
        job_type: String,
        result: Value,
    },
    Failed {
        job_id: Uuid,
        job_type: String,
        error: String,
        attempts_made: u32,
        will_retry: bool,
    },
}

impl WorkerEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Per-job handle passed to the handler
pub struct JobContext {
    job_id: Uuid,
    job_type: &'static str,
    attempt: u32,
    queue: Arc<dyn JobQueue>,
    events: broadcast::Sender<WorkerEvent>,
}

impl JobContext {
    pub fn new(
        job: &ClaimedJob,
        queue: Arc<dyn JobQueue>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job.job_type(),
            attempt: job.attempt,
            queue,
            events,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record progress (0-100) on the job and publish it
    ///
    /// Progress is informational; a failed update never fails the job.
    pub async fn progress(&self, progress: u8) {
        let progress = progress.min(100);
        if let Err(e) = self.queue.update_progress(self.job_id, progress).await {
            debug!(job_id = %self.job_id, error = %e, "progress update not recorded");
        }
        // No subscribers is fine
        let _ = self.events.send(WorkerEvent::Progress {
            job_id: self.job_id,
            job_type: self.job_type.to_string(),
            progress,
        });
    }
}

/// Processes claimed jobs
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Run one job. The returned value is stored as the job result.
    async fn handle(&self, job: &ClaimedJob, ctx: &JobContext) -> Result<Value, JobError>;
}

//! JobQueue trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::job::{
    AutomationJob, ClaimedJob, JobFailureOutcome, JobOptions, JobRecord, JobState, QueueMetrics,
};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// The job is not in a state that allows the operation
    #[error("job {id} is {state:?}, expected {expected:?}")]
    InvalidState {
        id: Uuid,
        state: JobState,
        expected: JobState,
    },

    /// A retry was requested with no attempts left
    #[error("retry budget exhausted for attempt {attempt_number}")]
    RetryBudgetExhausted { attempt_number: u32 },

    /// Backend failure
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Durable, priority- and delay-aware job queue
///
/// Implementations must be thread-safe; a handle is shared by every
/// component that enqueues and by every worker that claims.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Add a job. Returns its id.
    async fn enqueue(&self, job: AutomationJob, options: JobOptions) -> Result<Uuid, QueueError>;

    /// Claim up to `max_jobs` claimable jobs, highest priority first.
    ///
    /// Returns nothing while the queue is paused.
    async fn claim(&self, worker_id: &str, max_jobs: usize) -> Result<Vec<ClaimedJob>, QueueError>;

    /// Report progress (0-100) of an active job
    async fn update_progress(&self, job_id: Uuid, progress: u8) -> Result<(), QueueError>;

    async fn complete(&self, job_id: Uuid, result: Value) -> Result<(), QueueError>;

    /// Fail an active job; it is retried while attempts remain.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<JobFailureOutcome, QueueError>;

    async fn get_job(&self, job_id: Uuid) -> Result<JobRecord, QueueError>;

    async fn metrics(&self) -> Result<QueueMetrics, QueueError>;

    /// Stop handing out jobs until [`JobQueue::resume`]
    async fn pause(&self) -> Result<(), QueueError>;

    async fn resume(&self) -> Result<(), QueueError>;

    /// Remove finished jobs in `state` older than `grace`. Returns the count.
    async fn clean(&self, grace: Duration, state: JobState) -> Result<u64, QueueError>;

    /// Remove waiting jobs, and delayed ones too when asked. Returns the count.
    async fn drain(&self, include_delayed: bool) -> Result<u64, QueueError>;

    /// Return active jobs claimed longer than `threshold` ago to the queue
    async fn reclaim_stalled(&self, threshold: Duration) -> Result<Vec<Uuid>, QueueError>;

    /// Resolve when a job may have become claimable, or after `max_wait`.
    ///
    /// Idle workers park here between claims. The default only sleeps;
    /// backends that observe enqueues should wake early.
    async fn wait_for_jobs(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

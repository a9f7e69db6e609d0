//! Worker pool for job execution
//!
//! Manages concurrent job execution, per-job timeouts and graceful shutdown.
//! An idle pool parks on [`JobQueue::wait_for_jobs`]; a full one parks until
//! a running job frees its slot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::handler::{JobContext, JobError, JobHandler, WorkerEvent};
use crate::queue::{ClaimedJob, JobFailureOutcome, JobQueue};
use crate::reliability::duration_millis;

const EVENT_CAPACITY: usize = 256;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent jobs
    pub max_concurrency: usize,

    /// Longest an idle pool waits before claiming again. Backends that
    /// signal new work wake it sooner; this bounds the latency for delayed
    /// jobs and for backends that cannot.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Budget for one job run; exceeding it fails the attempt
    #[serde(with = "duration_millis")]
    pub job_timeout: Duration,

    /// How often stalled jobs are returned to the queue
    #[serde(with = "duration_millis")]
    pub stall_check_interval: Duration,

    /// Claim age after which an active job counts as stalled
    #[serde(with = "duration_millis")]
    pub stall_threshold: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            stall_check_interval: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Keep the threshold above the job timeout, or running jobs get reclaimed
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Running and accepting jobs
    Running,
    /// Finishing current jobs, not claiming new ones
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Pool of concurrent job runners over a shared queue
///
/// # Example
///
/// ```ignore
/// use dripline_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(queue, handler, WorkerPoolConfig::new().with_max_concurrency(4));
/// let mut events = pool.subscribe();
///
/// pool.start()?;
/// // ...
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerPoolConfig,
    events: broadcast::Sender<WorkerEvent>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_jobs: Arc<Semaphore>,
    slot_freed: Arc<Notify>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    stall_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            queue,
            handler,
            active_jobs: Arc::new(Semaphore::new(config.max_concurrency)),
            slot_freed: Arc::new(Notify::new()),
            config,
            events,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            poll_handle: Mutex::new(None),
            stall_handle: Mutex::new(None),
        }
    }

    /// Receive lifecycle events for jobs run by this pool
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Start polling. Must be called within a tokio runtime.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            job_timeout_ms = self.config.job_timeout.as_millis(),
            "starting worker pool"
        );

        self.start_poll_loop();
        self.start_stall_loop();
        Ok(())
    }

    /// Stop claiming and wait for running jobs to finish
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_jobs.available_permits();
            if available == self.config.max_concurrency {
                debug!("all jobs completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_jobs = self.config.max_concurrency - available,
                    "shutdown timeout reached"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let handles = [self.poll_handle.lock().take(), self.stall_handle.lock().take()];
        for handle in handles.into_iter().flatten() {
            let _ = handle.await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Jobs currently running
    pub fn active_jobs(&self) -> usize {
        self.config.max_concurrency - self.active_jobs.available_permits()
    }

    fn start_poll_loop(&self) {
        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&self.handler);
        let events = self.events.clone();
        let active_jobs = Arc::clone(&self.active_jobs);
        let slot_freed = Arc::clone(&self.slot_freed);
        let worker_id = self.config.worker_id.clone();
        let poll_interval = self.config.poll_interval;
        let job_timeout = self.config.job_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                let free_slots = active_jobs.available_permits();
                let mut claim_failed = false;

                if free_slots > 0 {
                    match queue.claim(&worker_id, free_slots).await {
                        Ok(jobs) if !jobs.is_empty() => {
                            debug!(count = jobs.len(), free_slots, "claimed jobs");
                            for job in jobs {
                                let Ok(permit) = active_jobs.clone().try_acquire_owned() else {
                                    // Claimed but no slot; the stall check returns it
                                    warn!(job_id = %job.id, "no free slot for claimed job");
                                    continue;
                                };

                                let queue = Arc::clone(&queue);
                                let handler = Arc::clone(&handler);
                                let events = events.clone();
                                let slot_freed = Arc::clone(&slot_freed);

                                tokio::spawn(async move {
                                    run_job(queue, handler, events, job, job_timeout).await;
                                    drop(permit);
                                    slot_freed.notify_one();
                                });
                            }
                            continue;
                        }
                        Ok(_) => trace!("nothing claimable"),
                        Err(e) => {
                            error!(error = %e, "failed to claim jobs");
                            claim_failed = true;
                        }
                    }
                }

                tokio::select! {
                    _ = slot_freed.notified(), if free_slots == 0 => {}
                    _ = queue.wait_for_jobs(poll_interval), if free_slots > 0 && !claim_failed => {}
                    _ = tokio::time::sleep(poll_interval), if claim_failed => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    fn start_stall_loop(&self) {
        let queue = Arc::clone(&self.queue);
        let interval = self.config.stall_check_interval;
        let threshold = self.config.stall_threshold;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.reclaim_stalled(threshold).await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                info!(count = reclaimed.len(), "reclaimed stalled jobs");
                            }
                            Ok(_) => {}
                            Err(e) => error!("stalled job reclamation failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("stall loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.stall_handle.lock() = Some(handle);
    }
}

/// Run one claimed job under the timeout and report its outcome
async fn run_job(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    events: broadcast::Sender<WorkerEvent>,
    job: ClaimedJob,
    timeout: Duration,
) {
    let job_type = job.job.job_type();
    let ctx = JobContext::new(&job, Arc::clone(&queue), events.clone());

    let outcome = match tokio::time::timeout(timeout, handler.handle(&job, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(JobError::Timeout(timeout)),
    };

    match outcome {
        Ok(result) => {
            if let Err(e) = queue.complete(job.id, result.clone()).await {
                error!(job_id = %job.id, job_type, "failed to complete job: {}", e);
                return;
            }
            info!(job_id = %job.id, job_type, attempt = job.attempt, "job completed");
            let _ = events.send(WorkerEvent::Completed {
                job_id: job.id,
                job_type: job_type.to_string(),
                result,
            });
        }
        Err(job_error) => {
            let message = job_error.to_string();
            let failure = match queue.fail(job.id, &message).await {
                Ok(failure) => failure,
                Err(e) => {
                    error!(job_id = %job.id, job_type, "failed to fail job: {}", e);
                    return;
                }
            };

            let will_retry = failure.will_retry();
            match &failure {
                JobFailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                } => warn!(
                    job_id = %job.id,
                    job_type,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    next_attempt,
                    retry_in_ms = delay.as_millis(),
                    error = %message,
                    "job failed, will retry"
                ),
                JobFailureOutcome::Exhausted { attempts } => error!(
                    job_id = %job.id,
                    job_type,
                    attempts,
                    error = %message,
                    "job failed, attempts exhausted"
                ),
            }

            let _ = events.send(WorkerEvent::Failed {
                job_id: job.id,
                job_type: job_type.to_string(),
                error: message,
                attempts_made: job.attempt,
                will_retry,
            });
        }
    }
}

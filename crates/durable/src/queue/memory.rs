//! In-memory implementation of JobQueue

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{JobQueue, QueueError};
use super::job::*;

/// Queue-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub completed_retention: RetentionPolicy,
    pub failed_retention: RetentionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            completed_retention: RetentionPolicy::completed_default(),
            failed_retention: RetentionPolicy::failed_default(),
        }
    }
}

impl QueueConfig {
    pub fn with_completed_retention(mut self, policy: RetentionPolicy) -> Self {
        self.completed_retention = policy;
        self
    }

    pub fn with_failed_retention(mut self, policy: RetentionPolicy) -> Self {
        self.failed_retention = policy;
        self
    }
}

struct Entry {
    record: JobRecord,
    /// Insertion order, breaks ties between equal priorities
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, Entry>,
    next_seq: u64,
    paused: bool,
}

/// In-memory job queue
///
/// Jobs are claimed by priority, then by the time they became available,
/// then in insertion order.
///
/// # Example
///
/// ```
/// use dripline_durable::queue::InMemoryJobQueue;
///
/// let queue = InMemoryJobQueue::new();
/// assert_eq!(queue.len(), 0);
/// ```
pub struct InMemoryJobQueue {
    state: RwLock<QueueState>,
    config: QueueConfig,
    /// Signalled whenever a job becomes claimable without waiting
    job_ready: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            config,
            job_ready: Notify::new(),
        }
    }

    /// Number of jobs held, in any state
    pub fn len(&self) -> usize {
        self.state.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records of every job in `state`, in claim order for unfinished jobs
    pub fn jobs_in_state(&self, state: JobState) -> Vec<JobRecord> {
        let guard = self.state.read();
        let mut entries: Vec<&Entry> = guard
            .jobs
            .values()
            .filter(|e| e.record.state == state)
            .collect();
        entries.sort_by(|a, b| claim_order(a, b));
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Time until the earliest unpaused waiting or delayed job becomes
    /// claimable; zero when one already is
    fn next_available_in(&self) -> Option<Duration> {
        let state = self.state.read();
        if state.paused {
            return None;
        }

        let now = Utc::now();
        state
            .jobs
            .values()
            .filter(|e| matches!(e.record.state, JobState::Waiting | JobState::Delayed))
            .map(|e| (e.record.available_at - now).to_std().unwrap_or(Duration::ZERO))
            .min()
    }

    /// Claim as if the current time were `now`. Delayed jobs whose delay has
    /// passed by `now` become claimable.
    pub fn claim_at(&self, worker_id: &str, max_jobs: usize, now: DateTime<Utc>) -> Vec<ClaimedJob> {
        let mut state = self.state.write();
        if state.paused {
            return vec![];
        }

        for entry in state.jobs.values_mut() {
            if entry.record.state == JobState::Delayed && entry.record.available_at <= now {
                entry.record.state = JobState::Waiting;
            }
        }

        let mut waiting: Vec<&Entry> = state
            .jobs
            .values()
            .filter(|e| e.record.state == JobState::Waiting)
            .collect();
        waiting.sort_by(|a, b| claim_order(a, b));
        let ids: Vec<Uuid> = waiting.into_iter().take(max_jobs).map(|e| e.record.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = state.jobs.get_mut(&id) {
                let record = &mut entry.record;
                record.state = JobState::Active;
                record.attempts_made += 1;
                record.progress = 0;
                record.claimed_by = Some(worker_id.to_string());
                record.claimed_at = Some(now);

                claimed.push(ClaimedJob {
                    id: record.id,
                    job: record.job.clone(),
                    priority: record.options.priority,
                    attempt: record.attempts_made,
                    max_attempts: record.options.attempts,
                });
            }
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed jobs");
        }
        claimed
    }

    fn trim(&self, state: &mut QueueState, job_state: JobState, now: DateTime<Utc>) {
        let policy = match job_state {
            JobState::Completed => self.config.completed_retention,
            JobState::Failed => self.config.failed_retention,
            _ => return,
        };
        let cutoff = now - to_chrono(policy.max_age);

        let mut finished: Vec<(DateTime<Utc>, Uuid)> = state
            .jobs
            .values()
            .filter(|e| e.record.state == job_state)
            .map(|e| (e.record.finished_at.unwrap_or(e.record.created_at), e.record.id))
            .collect();
        finished.sort();

        let expired = finished.iter().take_while(|(at, _)| *at < cutoff).count();
        let over_count = finished.len().saturating_sub(expired).saturating_sub(policy.max_count);
        let removed = expired + over_count;

        for (_, id) in finished.into_iter().take(removed) {
            state.jobs.remove(&id);
        }
        if removed > 0 {
            trace!(?job_state, removed, "trimmed finished jobs");
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn claim_order(a: &Entry, b: &Entry) -> std::cmp::Ordering {
    b.record
        .options
        .priority
        .cmp(&a.record.options.priority)
        .then(a.record.available_at.cmp(&b.record.available_at))
        .then(a.seq.cmp(&b.seq))
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: AutomationJob, options: JobOptions) -> Result<Uuid, QueueError> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let job_state = if options.delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };

        debug!(
            job_id = %id,
            job_type = job.job_type(),
            priority = ?options.priority,
            delay_ms = options.delay.as_millis() as u64,
            "enqueued job"
        );

        let record = JobRecord {
            id,
            job,
            available_at: now + to_chrono(options.delay),
            options,
            state: job_state,
            attempts_made: 0,
            progress: 0,
            claimed_by: None,
            claimed_at: None,
            result: None,
            failed_reason: None,
            error_history: vec![],
            created_at: now,
            finished_at: None,
        };

        {
            let mut state = self.state.write();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.jobs.insert(id, Entry { record, seq });
        }
        if job_state == JobState::Waiting {
            self.job_ready.notify_waiters();
        }
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, max_jobs: usize) -> Result<Vec<ClaimedJob>, QueueError> {
        Ok(self.claim_at(worker_id, max_jobs, Utc::now()))
    }

    async fn update_progress(&self, job_id: Uuid, progress: u8) -> Result<(), QueueError> {
        let mut state = self.state.write();
        let entry = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        entry.record.progress = progress.min(100);
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, result: Value) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.state.write();
        let entry = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        if entry.record.state != JobState::Active {
            return Err(QueueError::InvalidState {
                id: job_id,
                state: entry.record.state,
                expected: JobState::Active,
            });
        }

        entry.record.state = JobState::Completed;
        entry.record.progress = 100;
        entry.record.result = Some(result);
        entry.record.finished_at = Some(now);

        self.trim(&mut state, JobState::Completed, now);
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<JobFailureOutcome, QueueError> {
        let now = Utc::now();
        let mut state = self.state.write();
        let entry = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        let record = &mut entry.record;

        if record.state != JobState::Active {
            return Err(QueueError::InvalidState {
                id: job_id,
                state: record.state,
                expected: JobState::Active,
            });
        }

        record.error_history.push(error.to_string());
        record.failed_reason = Some(error.to_string());
        record.claimed_by = None;
        record.claimed_at = None;

        if record.attempts_made < record.options.attempts {
            let delay = record.options.backoff.delay_for_retry(record.attempts_made);
            record.available_at = now + to_chrono(delay);
            record.state = if delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            };

            Ok(JobFailureOutcome::WillRetry {
                next_attempt: record.attempts_made + 1,
                delay,
            })
        } else {
            let attempts = record.attempts_made;
            record.state = JobState::Failed;
            record.finished_at = Some(now);

            self.trim(&mut state, JobState::Failed, now);
            Ok(JobFailureOutcome::Exhausted { attempts })
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobRecord, QueueError> {
        self.state
            .read()
            .jobs
            .get(&job_id)
            .map(|e| e.record.clone())
            .ok_or(QueueError::JobNotFound(job_id))
    }

    async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        let now = Utc::now();
        let state = self.state.read();
        let mut metrics = QueueMetrics {
            paused: state.paused,
            ..Default::default()
        };

        for entry in state.jobs.values() {
            match entry.record.state {
                JobState::Waiting => metrics.waiting += 1,
                JobState::Delayed if entry.record.available_at <= now => metrics.waiting += 1,
                JobState::Delayed => metrics.delayed += 1,
                JobState::Active => metrics.active += 1,
                JobState::Completed => metrics.completed += 1,
                JobState::Failed => metrics.failed += 1,
            }
        }

        Ok(metrics)
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.state.write().paused = true;
        debug!("queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.state.write().paused = false;
        self.job_ready.notify_waiters();
        debug!("queue resumed");
        Ok(())
    }

    async fn clean(&self, grace: Duration, job_state: JobState) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - to_chrono(grace);
        let mut state = self.state.write();
        let before = state.jobs.len();

        state.jobs.retain(|_, e| {
            let at = e.record.finished_at.unwrap_or(e.record.created_at);
            !(e.record.state == job_state && at < cutoff)
        });

        Ok((before - state.jobs.len()) as u64)
    }

    async fn drain(&self, include_delayed: bool) -> Result<u64, QueueError> {
        let mut state = self.state.write();
        let before = state.jobs.len();

        state.jobs.retain(|_, e| match e.record.state {
            JobState::Waiting => false,
            JobState::Delayed => !include_delayed,
            _ => true,
        });

        Ok((before - state.jobs.len()) as u64)
    }

    async fn reclaim_stalled(&self, threshold: Duration) -> Result<Vec<Uuid>, QueueError> {
        let cutoff = Utc::now() - to_chrono(threshold);
        let mut state = self.state.write();
        let mut reclaimed = vec![];

        for entry in state.jobs.values_mut() {
            let record = &mut entry.record;
            let stalled = record.state == JobState::Active
                && record.claimed_at.is_some_and(|at| at < cutoff);
            if stalled {
                record.state = JobState::Waiting;
                record.claimed_by = None;
                record.claimed_at = None;
                reclaimed.push(record.id);
            }
        }
        drop(state);

        if !reclaimed.is_empty() {
            self.job_ready.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn wait_for_jobs(&self, max_wait: Duration) {
        let wait = self.next_available_in().map_or(max_wait, |due| due.min(max_wait));
        if wait.is_zero() {
            return;
        }

        tokio::select! {
            _ = self.job_ready.notified() => trace!("woken by claimable job"),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

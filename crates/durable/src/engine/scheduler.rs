//! Scheduler: resumes parked executions
//!
//! A periodic sweep selects due schedules and resumes the execution each
//! one points at. The same sweep releases due time-based triggers.
//! Schedules are claimed atomically before resuming, so a schedule seen by
//! two sweeps (or by a sweep and a `process-scheduled-step` job) runs once.
//! In enqueue mode a due schedule moves to `queued` before its job is added,
//! so it is handed to the queue once.
//! Failed schedules are terminal and never retried automatically.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dripline_core::{Execution, ExecutionStatus, Schedule};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{AutomationStore, StoreError};
use crate::queue::{AutomationQueue, QueueError};
use crate::reliability::duration_millis;

use super::executor::WorkflowExecutor;
use super::triggers::enqueue_trigger;

/// How a sweep hands due schedules off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepDispatch {
    /// Resume each execution inside the sweep
    #[default]
    Inline,
    /// Enqueue a `process-scheduled-step` job per due schedule
    Enqueue,
}

/// Configuration for the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between sweeps
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Maximum schedules (and triggers) handled per sweep
    pub batch_size: usize,

    pub dispatch: SweepDispatch,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            dispatch: SweepDispatch::Inline,
        }
    }
}

impl SchedulerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_dispatch(mut self, dispatch: SweepDispatch) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// Errors from scheduler operations
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result of resuming one schedule
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The execution ran again; it is terminal or parked on a later delay
    Resumed(Execution),

    /// Another resume had already claimed or settled the schedule
    AlreadyClaimed,

    /// The execution was cancelled while parked; the schedule is cancelled too
    Cancelled,

    /// Resuming failed; the schedule is marked failed with this error
    Failed(String),
}

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub resumed: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub failed: usize,
    pub triggers_released: usize,
}

/// Periodic schedule sweeper
pub struct Scheduler {
    store: Arc<dyn AutomationStore>,
    executor: Arc<WorkflowExecutor>,
    queue: AutomationQueue,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        executor: Arc<WorkflowExecutor>,
        queue: AutomationQueue,
    ) -> Self {
        Self {
            store,
            executor,
            queue,
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One sweep at the current time
    pub async fn process_pending_schedules(&self) -> Result<SweepReport, SchedulerError> {
        self.process_due_schedules(Utc::now()).await
    }

    /// One sweep as of `now`: due schedules first, then due scheduled
    /// triggers
    #[instrument(skip(self))]
    pub async fn process_due_schedules(&self, now: DateTime<Utc>) -> Result<SweepReport, SchedulerError> {
        let due = self
            .store
            .list_due_schedules(now, self.config.batch_size)
            .await?;
        let mut report = SweepReport::default();

        if !due.is_empty() {
            info!(count = due.len(), "processing due schedules");
        }

        for schedule in due {
            if self.config.dispatch == SweepDispatch::Enqueue {
                if self.enqueue_schedule(&schedule).await? {
                    report.enqueued += 1;
                } else {
                    report.skipped += 1;
                }
                continue;
            }

            match self.resume_execution(schedule.id).await? {
                ResumeOutcome::Resumed(_) => report.resumed += 1,
                ResumeOutcome::AlreadyClaimed | ResumeOutcome::Cancelled => report.skipped += 1,
                ResumeOutcome::Failed(_) => report.failed += 1,
            }
        }

        report.triggers_released = self.process_due_triggers(now).await?;
        Ok(report)
    }

    /// Move due scheduled triggers to `pending` and enqueue them
    pub async fn process_due_triggers(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let released = self
            .store
            .release_due_triggers(now, self.config.batch_size)
            .await?;

        for trigger in &released {
            enqueue_trigger(self.store.as_ref(), &self.queue, trigger).await?;
        }

        if !released.is_empty() {
            info!(count = released.len(), "released scheduled triggers");
        }
        Ok(released.len())
    }

    /// Resume the execution a schedule points at
    ///
    /// Store failures on the schedule itself are returned as errors. Anything
    /// that goes wrong while resuming is recorded on the schedule and
    /// reported as [`ResumeOutcome::Failed`].
    #[instrument(skip(self))]
    pub async fn resume_execution(&self, schedule_id: Uuid) -> Result<ResumeOutcome, SchedulerError> {
        let Some(mut schedule) = self.store.claim_schedule(schedule_id).await? else {
            debug!("schedule already claimed");
            return Ok(ResumeOutcome::AlreadyClaimed);
        };

        let execution = match self.store.get_execution(schedule.execution_id).await {
            Ok(execution) => execution,
            Err(e) => return self.fail_schedule(schedule, e.to_string()).await,
        };

        match execution.status {
            ExecutionStatus::Pending => {}
            ExecutionStatus::Cancelled => {
                schedule.cancel();
                self.store.save_schedule(&schedule).await?;
                info!(execution_id = %execution.id, "execution cancelled while parked");
                return Ok(ResumeOutcome::Cancelled);
            }
            status => {
                let reason = format!("Execution {} is {}, expected pending", execution.id, status);
                return self.fail_schedule(schedule, reason).await;
            }
        }

        match self.executor.process_execution(execution.id).await {
            Ok(execution) => {
                schedule.mark_completed();
                self.store.save_schedule(&schedule).await?;
                debug!(execution_id = %execution.id, status = %execution.status, "schedule resumed");
                Ok(ResumeOutcome::Resumed(execution))
            }
            Err(e) => self.fail_schedule(schedule, e.to_string()).await,
        }
    }

    /// Sweep every `interval` until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_ms = self.config.interval.as_millis() as u64, "scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.process_pending_schedules().await {
                        Ok(report) => debug!(?report, "sweep finished"),
                        Err(e) => error!(error = %e, "schedule sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Hand a due schedule to the job queue once
    ///
    /// The schedule moves to `queued` first so later sweeps skip it. If the
    /// enqueue fails it goes back to `pending` for the next sweep.
    async fn enqueue_schedule(&self, schedule: &Schedule) -> Result<bool, SchedulerError> {
        let Some(queued) = self.store.queue_schedule(schedule.id).await? else {
            debug!(schedule_id = %schedule.id, "schedule already queued");
            return Ok(false);
        };

        if let Err(e) = self
            .queue
            .add_process_scheduled_step(&queued, Duration::ZERO)
            .await
        {
            self.store.save_schedule(schedule).await?;
            return Err(e.into());
        }
        Ok(true)
    }

    async fn fail_schedule(
        &self,
        mut schedule: Schedule,
        error: String,
    ) -> Result<ResumeOutcome, SchedulerError> {
        warn!(schedule_id = %schedule.id, %error, "failed to resume execution from schedule");
        schedule.mark_failed(error.clone());
        self.store.save_schedule(&schedule).await?;
        Ok(ResumeOutcome::Failed(error))
    }
}

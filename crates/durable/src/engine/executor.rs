//! Workflow executor: the step state machine
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting executions of an automation for one subscriber
//! - Walking the step graph until exit, failure or a delay suspension
//! - Persisting a step result after every step
//! - Re-running a failed step on request
//!
//! A delay never blocks. It persists a [`Schedule`] and parks the execution;
//! the scheduler resumes it later, possibly in another process.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dripline_core::{
    Automation, AutomationStats, Branch, ConditionError, Execution, ExecutionStatus, Schedule,
    Step, StepCondition, StepKind, StepResult, Subscriber,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{AutomationStore, ExecutionFilter, Pagination, StoreError};

use super::collaborators::{
    LoggingMessageSender, MessageSender, OutgoingMessage, RandomSource, SendError, ThreadRandom,
};

/// Executed-step bound per execution; the only guard against cyclic graphs
pub const MAX_STEPS_PER_EXECUTION: u32 = 100;

/// Longest delay a step may request (ten years)
const MAX_DELAY_MINUTES: f64 = 10.0 * 365.0 * 24.0 * 60.0;

/// Configuration for the workflow executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum steps executed per run segment (for safety)
    pub max_steps: u32,
    /// Wall-clock limit for one pass of the step loop; unbounded when `None`
    #[serde(default)]
    pub run_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: MAX_STEPS_PER_EXECUTION,
            run_timeout: None,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = Some(run_timeout);
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("automation {0} has been deleted")]
    AutomationDeleted(Uuid),

    #[error("step {step_id} not found in automation {automation_id}")]
    StepNotFound { automation_id: Uuid, step_id: String },

    /// Only failed executions can have a step re-run
    #[error("execution {id} is {status}, only failed executions can be retried")]
    NotRetryable { id: Uuid, status: ExecutionStatus },

    /// The step loop overran `run_timeout`; the execution is stored as failed
    #[error("execution {id} timed out after {limit:?}")]
    TimedOut { id: Uuid, limit: Duration },
}

/// Failure inside a single step. Recorded on the step result, never raised.
#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("Invalid delay duration")]
    InvalidDelay,

    #[error("Delay of {0} minutes exceeds the maximum")]
    DelayTooLong(f64),

    #[error("Condition not specified")]
    MissingCondition,

    #[error("Invalid condition: {0}")]
    Condition(#[from] ConditionError),

    #[error("Split percentages not configured")]
    SplitNotConfigured,

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where the step loop goes after a step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Follow the edge selected by this branch
    Continue(Branch),
    /// Park the execution until the schedule is due
    Suspend(Schedule),
    /// Stop the loop
    Exit,
}

/// Index of the split path selected by `draw` (in `[0, 100)`)
///
/// Walks cumulative percentages and picks the first bucket whose upper
/// bound is at least the draw. Draws beyond the total select path 0.
pub fn select_split_path(percentages: &[f64], draw: f64) -> usize {
    let mut cumulative = 0.0;
    for (index, percentage) in percentages.iter().enumerate() {
        cumulative += percentage;
        if draw <= cumulative {
            return index;
        }
    }
    0
}

/// Workflow executor
///
/// # Example
///
/// ```ignore
/// use dripline_durable::prelude::*;
///
/// let store = Arc::new(InMemoryAutomationStore::new());
/// let executor = WorkflowExecutor::new(store.clone())
///     .with_sender(Arc::new(MySender::default()));
///
/// let execution = executor
///     .execute_workflow(automation_id, subscriber_id, None)
///     .await?;
/// ```
pub struct WorkflowExecutor {
    store: Arc<dyn AutomationStore>,
    sender: Arc<dyn MessageSender>,
    random: Arc<dyn RandomSource>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Create an executor that logs messages instead of sending them
    pub fn new(store: Arc<dyn AutomationStore>) -> Self {
        Self {
            store,
            sender: Arc::new(LoggingMessageSender),
            random: Arc::new(ThreadRandom),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn AutomationStore> {
        &self.store
    }

    /// Start a new execution and drive it
    ///
    /// Fails fast when the automation or subscriber does not exist. Returns
    /// once the execution is terminal or parked on a delay.
    #[instrument(skip(self))]
    pub async fn execute_workflow(
        &self,
        automation_id: Uuid,
        subscriber_id: Uuid,
        trigger_id: Option<Uuid>,
    ) -> Result<Execution, ExecutorError> {
        let automation = self.store.get_automation(automation_id).await?;
        if automation.is_deleted() {
            return Err(ExecutorError::AutomationDeleted(automation_id));
        }
        self.store.get_subscriber(subscriber_id).await?;

        let execution = Execution::new(automation_id, subscriber_id, trigger_id);
        self.store.insert_execution(&execution).await?;

        info!(execution_id = %execution.id, "starting workflow execution");

        self.process_execution(execution.id).await
    }

    /// Drive an execution from its current step
    ///
    /// Starts at the first step for a fresh execution, or at the step a
    /// schedule or retry left in `current_step_id`. With a `run_timeout`
    /// configured, an overrunning loop is abandoned and the execution is
    /// stored as failed before [`ExecutorError::TimedOut`] is returned.
    #[instrument(skip(self))]
    pub async fn process_execution(&self, execution_id: Uuid) -> Result<Execution, ExecutorError> {
        let Some(limit) = self.config.run_timeout else {
            return self.drive(execution_id).await;
        };

        match tokio::time::timeout(limit, self.drive(execution_id)).await {
            Ok(result) => result,
            Err(_) => {
                self.fail_timed_out(execution_id, limit).await?;
                Err(ExecutorError::TimedOut {
                    id: execution_id,
                    limit,
                })
            }
        }
    }

    async fn drive(&self, execution_id: Uuid) -> Result<Execution, ExecutorError> {
        let mut execution = self.store.get_execution(execution_id).await?;

        if execution.is_terminal() {
            debug!(status = %execution.status, "execution already in terminal state");
            return Ok(execution);
        }

        let (automation, subscriber) = match self.load_context(&execution).await {
            Ok(context) => context,
            Err(e) => {
                execution.fail(e.to_string());
                self.store.save_execution(&execution).await?;
                return Err(e);
            }
        };

        execution.start();
        self.store.save_execution(&execution).await?;

        let mut current = match execution.current_step_id.as_deref() {
            Some(step_id) => match automation.step_by_id(step_id) {
                Some(step) => Some(step),
                None => {
                    execution.fail(format!("Step {} not found", step_id));
                    None
                }
            },
            // A parked execution with no resume step has run its last step
            None if execution.step_results.is_empty() => automation.first_step(),
            None => None,
        };

        while let Some(step) = current {
            if self.is_cancelled(execution.id).await? {
                return self.stop_cancelled(execution.id, None, None).await;
            }

            if execution.steps_in_segment() >= self.config.max_steps {
                execution.fail(format!(
                    "Maximum step limit reached ({} steps)",
                    self.config.max_steps
                ));
                break;
            }

            debug!(step_id = %step.id, step_type = %step.step_type(), "executing step");
            let (result, outcome) = self
                .execute_step(step, &automation, &subscriber, &execution)
                .await;

            if self.is_cancelled(execution.id).await? {
                let schedule = match outcome {
                    StepOutcome::Suspend(schedule) => Some(schedule),
                    _ => None,
                };
                return self.stop_cancelled(execution.id, Some(result), schedule).await;
            }

            let step_error = result.error.clone().filter(|_| result.is_failed());
            execution.add_step_result(result);

            if let Some(error) = step_error {
                execution.fail(error);
                break;
            }

            match outcome {
                StepOutcome::Exit => break,
                StepOutcome::Suspend(schedule) => {
                    execution.park(schedule.resume_step_id.clone());
                    self.store.save_execution(&execution).await?;
                    info!(
                        schedule_id = %schedule.id,
                        scheduled_for = %schedule.scheduled_for,
                        "execution parked until schedule is due"
                    );
                    return Ok(execution);
                }
                StepOutcome::Continue(branch) => {
                    current = automation.next_step(&step.id, branch);
                    execution.current_step_id = current.map(|s| s.id.clone());
                    self.store.save_execution(&execution).await?;
                }
            }
        }

        if execution.status == ExecutionStatus::Running {
            execution.complete();
            info!(steps = execution.step_results.len(), "execution completed");
        } else {
            warn!(error = execution.error.as_deref(), "execution failed");
        }
        self.store.save_execution(&execution).await?;
        self.refresh_statistics(execution.automation_id).await;

        Ok(execution)
    }

    /// Run one step and capture its result
    ///
    /// Errors inside the step become a failed result; they never propagate.
    pub async fn execute_step(
        &self,
        step: &Step,
        automation: &Automation,
        subscriber: &Subscriber,
        execution: &Execution,
    ) -> (StepResult, StepOutcome) {
        let started_at = Utc::now();

        match self.run_step(step, automation, subscriber, execution).await {
            Ok((data, outcome)) => (
                StepResult::completed(&step.id, step.step_type(), started_at, data),
                outcome,
            ),
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "step failed");
                (
                    StepResult::failed(&step.id, step.step_type(), started_at, e.to_string()),
                    StepOutcome::Exit,
                )
            }
        }
    }

    /// Re-run `step_id` of a failed execution
    ///
    /// The execution is reopened at that step and driven again. Earlier
    /// step results are kept; the retried step appends a new one and the
    /// retried segment gets a fresh step budget. Executions that are not
    /// failed are left alone, so a redelivered retry is a no-op.
    #[instrument(skip(self))]
    pub async fn retry_failed_step(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Execution, ExecutorError> {
        let mut execution = self.store.get_execution(execution_id).await?;

        match execution.status {
            ExecutionStatus::Failed => {}
            ExecutionStatus::Completed | ExecutionStatus::Cancelled => {
                return Err(ExecutorError::NotRetryable {
                    id: execution_id,
                    status: execution.status,
                });
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                debug!(status = %execution.status, "execution still in progress, skipping retry");
                return Ok(execution);
            }
        }

        let automation = self.store.get_automation(execution.automation_id).await?;
        if automation.step_by_id(step_id).is_none() {
            return Err(ExecutorError::StepNotFound {
                automation_id: automation.id,
                step_id: step_id.to_string(),
            });
        }

        info!("retrying failed step");
        execution.rewind_to(step_id);
        self.store.save_execution(&execution).await?;

        self.process_execution(execution_id).await
    }

    async fn run_step(
        &self,
        step: &Step,
        automation: &Automation,
        subscriber: &Subscriber,
        execution: &Execution,
    ) -> Result<(Value, StepOutcome), StepError> {
        match &step.kind {
            StepKind::SendMessage(config) => {
                let message = OutgoingMessage {
                    automation_id: automation.id,
                    execution_id: execution.id,
                    step_id: step.id.clone(),
                    template_id: config.template_id.clone(),
                    subject: config.subject.clone(),
                    content: config.content.clone(),
                    from_name: config.from_name.clone(),
                };
                let sent = self.sender.send(subscriber, &message).await?;

                Ok((
                    json!({
                        "messageId": sent.message_id,
                        "recipient": subscriber.email,
                        "subject": config.subject,
                        "templateId": config.template_id,
                        "sentAt": sent.sent_at,
                    }),
                    StepOutcome::Continue(Branch::Default),
                ))
            }

            StepKind::Delay(config) => {
                let minutes = config.minutes().ok_or(StepError::InvalidDelay)?;
                if minutes > MAX_DELAY_MINUTES {
                    return Err(StepError::DelayTooLong(minutes));
                }

                let delay = chrono::Duration::milliseconds((minutes * 60_000.0).round() as i64);
                let scheduled_for = Utc::now() + delay;
                let resume_step_id = automation
                    .next_step(&step.id, Branch::Default)
                    .map(|s| s.id.clone());

                let schedule = Schedule::new(
                    automation.id,
                    subscriber.id,
                    execution.id,
                    execution.current_step_index,
                    resume_step_id,
                    scheduled_for,
                );
                self.store.insert_schedule(&schedule).await?;

                debug!(schedule_id = %schedule.id, %scheduled_for, "scheduled next step");
                Ok((
                    json!({
                        "scheduleId": schedule.id,
                        "scheduledFor": scheduled_for,
                        "delayMinutes": minutes,
                    }),
                    StepOutcome::Suspend(schedule),
                ))
            }

            StepKind::Condition(config) => {
                let expression = config
                    .condition
                    .as_deref()
                    .ok_or(StepError::MissingCondition)?;
                let result = StepCondition::parse(expression)?.evaluate(subscriber);

                debug!(condition = expression, result, "condition evaluated");
                Ok((
                    json!({ "condition": expression, "conditionResult": result }),
                    StepOutcome::Continue(Branch::Condition(result)),
                ))
            }

            StepKind::Split(config) => {
                if config.split_percentages.is_empty() {
                    return Err(StepError::SplitNotConfigured);
                }
                let draw = self.random.percent();
                let selected = select_split_path(&config.split_percentages, draw);

                debug!(selected_path = selected, draw, "split path selected");
                Ok((
                    json!({
                        "selectedPath": selected,
                        "splitPercentages": config.split_percentages,
                        "random": draw,
                    }),
                    StepOutcome::Continue(Branch::Split(selected)),
                ))
            }

            StepKind::Exit => Ok((json!({ "message": "Workflow exit" }), StepOutcome::Exit)),
        }
    }

    async fn load_context(
        &self,
        execution: &Execution,
    ) -> Result<(Automation, Subscriber), ExecutorError> {
        let automation = self.store.get_automation(execution.automation_id).await?;
        let subscriber = self.store.get_subscriber(execution.subscriber_id).await?;
        Ok((automation, subscriber))
    }

    /// Cancellation checkpoint
    async fn is_cancelled(&self, execution_id: Uuid) -> Result<bool, ExecutorError> {
        let status = self.store.get_execution_status(execution_id).await?;
        Ok(status == ExecutionStatus::Cancelled)
    }

    /// Stop on a cancelled execution, keeping the result of a step that was
    /// already running when the cancel landed
    async fn stop_cancelled(
        &self,
        execution_id: Uuid,
        finished: Option<StepResult>,
        orphan: Option<Schedule>,
    ) -> Result<Execution, ExecutorError> {
        if let Some(mut schedule) = orphan {
            schedule.cancel();
            self.store.save_schedule(&schedule).await?;
        }

        let mut execution = self.store.get_execution(execution_id).await?;
        if let Some(result) = finished {
            execution.add_step_result(result);
            self.store.save_execution(&execution).await?;
        }
        info!("execution cancelled, stopping");
        Ok(execution)
    }

    /// Record an abandoned run as failed unless it already settled
    async fn fail_timed_out(&self, execution_id: Uuid, limit: Duration) -> Result<(), ExecutorError> {
        let mut execution = self.store.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(());
        }

        warn!(%execution_id, limit_ms = limit.as_millis() as u64, "execution timed out");
        execution.fail(format!("Execution timed out after {}ms", limit.as_millis()));
        self.store.save_execution(&execution).await?;
        self.refresh_statistics(execution.automation_id).await;
        Ok(())
    }

    /// Recompute automation statistics; a failure here never fails the run
    async fn refresh_statistics(&self, automation_id: Uuid) {
        let result: Result<(), StoreError> = async {
            let filter = ExecutionFilter::for_automation(automation_id).with_statuses([
                ExecutionStatus::Completed,
                ExecutionStatus::Failed,
                ExecutionStatus::Cancelled,
            ]);
            let executions = self.store.list_executions(&filter, Pagination::all()).await?;
            let stats = AutomationStats::from_executions(&executions);
            self.store.update_automation_stats(automation_id, stats).await
        }
        .await;

        if let Err(e) = result {
            warn!(%automation_id, error = %e, "failed to update automation statistics");
        }
    }
}

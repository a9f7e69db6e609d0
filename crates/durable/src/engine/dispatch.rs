//! Routes queue jobs to the engine

use std::sync::Arc;

use async_trait::async_trait;
use dripline_core::{Execution, TriggerStatus};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::persistence::AutomationStore;
use crate::queue::{AutomationJob, ClaimedJob, ProcessTriggerJob};
use crate::worker::{JobContext, JobError, JobHandler};

use super::executor::{ExecutorError, WorkflowExecutor};
use super::scheduler::{ResumeOutcome, Scheduler};

/// [`JobHandler`] for the four automation job kinds
///
/// No job waits on a running workflow; each drives the execution until it
/// finishes or parks on a delay, then returns.
pub struct AutomationJobHandler {
    store: Arc<dyn AutomationStore>,
    executor: Arc<WorkflowExecutor>,
    scheduler: Arc<Scheduler>,
}

impl AutomationJobHandler {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        executor: Arc<WorkflowExecutor>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            store,
            executor,
            scheduler,
        }
    }

    async fn process_trigger(
        &self,
        job: &ProcessTriggerJob,
        ctx: &JobContext,
    ) -> Result<Value, JobError> {
        let mut trigger = self.store.get_trigger(job.trigger_id).await?;

        if trigger.status != TriggerStatus::Pending {
            info!(trigger_id = %trigger.id, status = %trigger.status, "trigger already handled");
            return Ok(json!({ "triggerId": trigger.id, "skipped": true, "status": trigger.status }));
        }

        let automation = self.store.get_automation(trigger.automation_id).await?;
        if !automation.is_active || automation.is_deleted() {
            trigger.mark_skipped("automation is not active");
            self.store.save_trigger(&trigger).await?;
            info!(trigger_id = %trigger.id, "automation inactive, trigger skipped");
            return Ok(json!({ "triggerId": trigger.id, "skipped": true, "status": trigger.status }));
        }

        ctx.progress(50).await;

        match self
            .executor
            .execute_workflow(trigger.automation_id, trigger.subscriber_id, Some(trigger.id))
            .await
        {
            Ok(execution) => {
                trigger.mark_fired();
                self.store.save_trigger(&trigger).await?;
                let mut result = execution_summary(&execution);
                result["triggerId"] = json!(trigger.id);
                Ok(result)
            }
            Err(e) if is_transient(&e) => Err(e.into()),
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "workflow could not be started");
                trigger.mark_failed(e.to_string());
                self.store.save_trigger(&trigger).await?;
                Ok(json!({ "triggerId": trigger.id, "status": trigger.status, "error": e.to_string() }))
            }
        }
    }

    /// A timed-out run is already stored as failed; report it rather than
    /// retrying the job into a second execution
    async fn settled(&self, run: Result<Execution, ExecutorError>) -> Result<Execution, JobError> {
        match run {
            Err(ExecutorError::TimedOut { id, .. }) => Ok(self.store.get_execution(id).await?),
            other => Ok(other?),
        }
    }
}

#[async_trait]
impl JobHandler for AutomationJobHandler {
    #[instrument(skip_all, fields(job_id = %job.id, job_type = job.job.job_type(), attempt = job.attempt))]
    async fn handle(&self, job: &ClaimedJob, ctx: &JobContext) -> Result<Value, JobError> {
        ctx.progress(10).await;

        let result = match &job.job {
            AutomationJob::ExecuteAutomation(payload) => {
                ctx.progress(50).await;
                let run = self
                    .executor
                    .execute_workflow(payload.automation_id, payload.subscriber_id, payload.trigger_id)
                    .await;
                execution_summary(&self.settled(run).await?)
            }
            AutomationJob::ProcessScheduledStep(payload) => {
                ctx.progress(50).await;
                let outcome = self.scheduler.resume_execution(payload.schedule_id).await?;
                resume_summary(payload.schedule_id, &outcome)
            }
            AutomationJob::RetryFailedStep(payload) => {
                ctx.progress(50).await;
                let run = self
                    .executor
                    .retry_failed_step(payload.execution_id, &payload.step_id)
                    .await;
                execution_summary(&self.settled(run).await?)
            }
            AutomationJob::ProcessTrigger(payload) => self.process_trigger(payload, ctx).await?,
        };

        ctx.progress(100).await;
        Ok(result)
    }
}

/// Store failures other than a missing record are worth another attempt
fn is_transient(error: &ExecutorError) -> bool {
    matches!(error, ExecutorError::Store(e) if !e.is_not_found())
}

fn execution_summary(execution: &Execution) -> Value {
    json!({
        "executionId": execution.id,
        "status": execution.status,
        "steps": execution.step_results.len(),
    })
}

fn resume_summary(schedule_id: Uuid, outcome: &ResumeOutcome) -> Value {
    match outcome {
        ResumeOutcome::Resumed(execution) => {
            let mut summary = execution_summary(execution);
            summary["scheduleId"] = json!(schedule_id);
            summary
        }
        ResumeOutcome::AlreadyClaimed => json!({ "scheduleId": schedule_id, "skipped": true }),
        ResumeOutcome::Cancelled => json!({ "scheduleId": schedule_id, "cancelled": true }),
        ResumeOutcome::Failed(error) => json!({ "scheduleId": schedule_id, "error": error }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryAutomationStore;
    use crate::queue::{AutomationQueue, InMemoryJobQueue, JobQueue, JobState};
    use crate::worker::WorkerEvent;
    use chrono::Utc;
    use dripline_core::{
        Automation, ExecutionStatus, NewAutomation, Step, Subscriber, Trigger, TriggerType,
    };
    use serde_json::Map;
    use tokio::sync::broadcast;

    struct Fixture {
        store: Arc<InMemoryAutomationStore>,
        jobs: Arc<InMemoryJobQueue>,
        queue: AutomationQueue,
        handler: AutomationJobHandler,
        automation: Automation,
        subscriber: Subscriber,
    }

    async fn fixture(steps: Vec<Step>) -> Fixture {
        let store = Arc::new(InMemoryAutomationStore::new());
        let jobs = Arc::new(InMemoryJobQueue::new());
        let queue = AutomationQueue::new(jobs.clone());
        let executor = Arc::new(WorkflowExecutor::new(store.clone()));
        let scheduler = Arc::new(Scheduler::new(store.clone(), executor.clone(), queue.clone()));
        let handler = AutomationJobHandler::new(store.clone(), executor, scheduler);

        let mut automation = Automation::from_definition(
            NewAutomation::new("drip", TriggerType::Event, json!({ "events": ["x"] }))
                .with_steps(steps),
        );
        automation.activate();
        store.insert_automation(&automation).await.unwrap();
        let subscriber = Subscriber::new("a@example.com");
        store.save_subscriber(&subscriber).await.unwrap();

        Fixture {
            store,
            jobs,
            queue,
            handler,
            automation,
            subscriber,
        }
    }

    impl Fixture {
        async fn run_next(&self) -> (Result<Value, JobError>, Vec<u8>) {
            let job = self.jobs.claim("w1", 1).await.unwrap().remove(0);
            let (tx, mut rx) = broadcast::channel(16);
            let ctx = JobContext::new(&job, self.jobs.clone(), tx);
            let result = self.handler.handle(&job, &ctx).await;

            let mut progress = Vec::new();
            while let Ok(WorkerEvent::Progress { progress: p, .. }) = rx.try_recv() {
                progress.push(p);
            }
            (result, progress)
        }

        async fn pending_trigger(&self) -> Trigger {
            let trigger = Trigger::pending(
                self.automation.id,
                self.subscriber.id,
                TriggerType::Event,
                Map::new(),
            );
            self.store.insert_trigger(&trigger).await.unwrap();
            self.queue.add_process_trigger(&trigger).await.unwrap();
            trigger
        }
    }

    fn linear() -> Vec<Step> {
        vec![Step::send_message("s1", "Hi").then("s2"), Step::exit("s2")]
    }

    #[tokio::test]
    async fn test_execute_automation_reports_progress() {
        let f = fixture(linear()).await;
        f.queue
            .add_execute_automation(f.automation.id, f.subscriber.id, None, Default::default())
            .await
            .unwrap();

        let (result, progress) = f.run_next().await;
        let result = result.unwrap();
        assert_eq!(result["status"], "completed");
        assert_eq!(result["steps"], 2);
        assert_eq!(progress, vec![10, 50, 100]);
    }

    #[tokio::test]
    async fn test_process_trigger_fires() {
        let f = fixture(linear()).await;
        let trigger = f.pending_trigger().await;

        let (result, _) = f.run_next().await;
        assert_eq!(result.unwrap()["status"], "completed");

        let stored = f.store.get_trigger(trigger.id).await.unwrap();
        assert_eq!(stored.status, TriggerStatus::Fired);
        assert!(stored.fired_at.is_some());
    }

    #[tokio::test]
    async fn test_redelivered_trigger_is_skipped() {
        let f = fixture(linear()).await;
        let trigger = f.pending_trigger().await;
        f.queue.add_process_trigger(&trigger).await.unwrap();

        f.run_next().await.0.unwrap();
        let (result, _) = f.run_next().await;
        assert_eq!(result.unwrap()["skipped"], true);
        assert_eq!(f.store.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_for_paused_automation_is_skipped() {
        let f = fixture(linear()).await;
        let trigger = f.pending_trigger().await;

        let mut paused = f.automation.clone();
        paused.pause();
        f.store.save_automation(&paused).await.unwrap();

        f.run_next().await.0.unwrap();
        assert_eq!(
            f.store.get_trigger(trigger.id).await.unwrap().status,
            TriggerStatus::Skipped
        );
        assert_eq!(f.store.execution_count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_for_missing_subscriber_fails() {
        let f = fixture(linear()).await;
        let trigger = Trigger::pending(f.automation.id, Uuid::now_v7(), TriggerType::Event, Map::new());
        f.store.insert_trigger(&trigger).await.unwrap();
        f.queue.add_process_trigger(&trigger).await.unwrap();

        let (result, _) = f.run_next().await;
        assert_eq!(result.unwrap()["status"], "failed");
        assert_eq!(
            f.store.get_trigger(trigger.id).await.unwrap().status,
            TriggerStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_scheduled_step_resumes_execution() {
        let f = fixture(vec![
            Step::delay("s1", 1.0).then("s2"),
            Step::exit("s2"),
        ])
        .await;
        let execution = f
            .handler
            .executor
            .execute_workflow(f.automation.id, f.subscriber.id, None)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);

        let schedule = f.store.list_due_schedules(Utc::now() + chrono::Duration::minutes(2), 10)
            .await
            .unwrap()
            .remove(0);
        f.queue
            .add_process_scheduled_step(&schedule, std::time::Duration::ZERO)
            .await
            .unwrap();

        let (result, _) = f.run_next().await;
        let result = result.unwrap();
        assert_eq!(result["status"], "completed");
        assert_eq!(result["scheduleId"], json!(schedule.id));

        // A second delivery finds the schedule claimed
        f.queue
            .add_process_scheduled_step(&schedule, std::time::Duration::ZERO)
            .await
            .unwrap();
        let (result, _) = f.run_next().await;
        assert_eq!(result.unwrap()["skipped"], true);
    }

    #[tokio::test]
    async fn test_retry_of_missing_execution_is_an_error() {
        let f = fixture(linear()).await;
        let execution = Execution::new(f.automation.id, f.subscriber.id, None);
        f.queue
            .add_retry_failed_step(&execution, "s1", 1)
            .await
            .unwrap();

        let (result, _) = f.run_next().await;
        assert!(matches!(result, Err(JobError::Executor(ExecutorError::Store(_)))));
        assert_eq!(f.jobs.jobs_in_state(JobState::Active).len(), 1);
    }
}

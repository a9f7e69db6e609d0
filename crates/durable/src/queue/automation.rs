//! Typed helpers for enqueueing automation jobs

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dripline_core::{Execution, Schedule, Trigger};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use super::backend::{JobQueue, QueueError};
use super::job::*;

/// Attempts granted to the first retry of a failed step
const RETRY_ATTEMPTS: u32 = 3;

/// Front door to the automation queue
///
/// Wraps a shared [`JobQueue`] and picks options per job kind so callers
/// never hand-build [`JobOptions`].
#[derive(Clone)]
pub struct AutomationQueue {
    queue: Arc<dyn JobQueue>,
}

impl AutomationQueue {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Underlying queue handle
    pub fn inner(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Enqueue a workflow run for `subscriber_id`
    pub async fn add_execute_automation(
        &self,
        automation_id: Uuid,
        subscriber_id: Uuid,
        trigger_id: Option<Uuid>,
        options: JobOptions,
    ) -> Result<Uuid, QueueError> {
        let job = AutomationJob::ExecuteAutomation(ExecuteAutomationJob {
            automation_id,
            subscriber_id,
            trigger_id,
        });
        self.queue.enqueue(job, options).await
    }

    /// Enqueue the resume of `schedule` after `delay`
    ///
    /// Use [`delay_until`] to hold the job until the schedule is due.
    pub async fn add_process_scheduled_step(
        &self,
        schedule: &Schedule,
        delay: Duration,
    ) -> Result<Uuid, QueueError> {
        let job = AutomationJob::ProcessScheduledStep(ProcessScheduledStepJob {
            schedule_id: schedule.id,
            execution_id: schedule.execution_id,
            automation_id: schedule.automation_id,
            subscriber_id: schedule.subscriber_id,
            step_index: schedule.step_index,
        });
        self.queue.enqueue(job, JobOptions::new().with_delay(delay)).await
    }

    /// Enqueue a retry of a failed step
    ///
    /// Each later attempt gets one attempt fewer than the last; once none
    /// remain the retry is refused.
    pub async fn add_retry_failed_step(
        &self,
        execution: &Execution,
        step_id: &str,
        attempt_number: u32,
    ) -> Result<Uuid, QueueError> {
        let attempts = retry_budget(attempt_number)
            .ok_or(QueueError::RetryBudgetExhausted { attempt_number })?;

        info!(
            execution_id = %execution.id,
            step_id,
            attempt_number,
            attempts,
            "scheduling step retry"
        );

        let job = AutomationJob::RetryFailedStep(RetryFailedStepJob {
            execution_id: execution.id,
            step_id: step_id.to_string(),
            attempt_number,
        });
        let options = JobOptions::new()
            .with_priority(JobPriority::High)
            .with_attempts(attempts);
        self.queue.enqueue(job, options).await
    }

    /// Enqueue processing of a recorded trigger
    pub async fn add_process_trigger(&self, trigger: &Trigger) -> Result<Uuid, QueueError> {
        let job = AutomationJob::ProcessTrigger(ProcessTriggerJob {
            trigger_id: trigger.id,
            automation_id: trigger.automation_id,
            subscriber_id: trigger.subscriber_id,
            trigger_type: trigger.trigger_type,
            trigger_data: trigger.trigger_data.clone(),
        });
        self.queue.enqueue(job, JobOptions::new()).await
    }

    pub async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        self.queue.metrics().await
    }

    pub async fn pause(&self) -> Result<(), QueueError> {
        self.queue.pause().await
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.queue.resume().await
    }

    /// Remove completed and failed jobs older than `grace`
    pub async fn clean(&self, grace: Duration) -> Result<u64, QueueError> {
        let completed = self.queue.clean(grace, JobState::Completed).await?;
        let failed = self.queue.clean(grace, JobState::Failed).await?;
        Ok(completed + failed)
    }

    /// Remove every job that has not started yet
    pub async fn drain(&self) -> Result<u64, QueueError> {
        self.queue.drain(true).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<JobRecord, QueueError> {
        self.queue.get_job(job_id).await
    }
}

/// Time from now until `at`, zero when `at` has passed
pub fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Attempts for retry number `attempt_number` (1-based), `None` when spent
fn retry_budget(attempt_number: u32) -> Option<u32> {
    let used = attempt_number.saturating_sub(1);
    RETRY_ATTEMPTS.checked_sub(used).filter(|n| *n > 0)
}

/// Trigger data with the trigger id attached, for job payloads and logs
pub fn trigger_context(trigger: &Trigger) -> Map<String, Value> {
    let mut data = trigger.trigger_data.clone();
    data.insert("triggerId".into(), Value::String(trigger.id.to_string()));
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use dripline_core::TriggerType;

    fn setup() -> (Arc<InMemoryJobQueue>, AutomationQueue) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let automation_queue = AutomationQueue::new(queue.clone());
        (queue, automation_queue)
    }

    #[test]
    fn test_retry_budget() {
        assert_eq!(retry_budget(1), Some(3));
        assert_eq!(retry_budget(2), Some(2));
        assert_eq!(retry_budget(3), Some(1));
        assert_eq!(retry_budget(4), None);
    }

    #[tokio::test]
    async fn test_retry_job_is_high_priority() {
        let (queue, automation_queue) = setup();
        let execution = Execution::new(Uuid::now_v7(), Uuid::now_v7(), None);

        let id = automation_queue
            .add_retry_failed_step(&execution, "s2", 2)
            .await
            .unwrap();
        let record = queue.get_job(id).await.unwrap();
        assert_eq!(record.options.priority, JobPriority::High);
        assert_eq!(record.options.attempts, 2);

        let err = automation_queue
            .add_retry_failed_step(&execution, "s2", 4)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::RetryBudgetExhausted { attempt_number: 4 }
        ));
    }

    #[tokio::test]
    async fn test_scheduled_step_is_delayed_until_due() {
        let (queue, automation_queue) = setup();
        let schedule = Schedule::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            1,
            Some("s2".into()),
            Utc::now() + chrono::Duration::minutes(5),
        );

        let id = automation_queue
            .add_process_scheduled_step(&schedule, delay_until(schedule.scheduled_for))
            .await
            .unwrap();
        let record = queue.get_job(id).await.unwrap();
        assert_eq!(record.state, JobState::Delayed);
        assert!(record.options.delay > Duration::from_secs(290));
    }

    #[tokio::test]
    async fn test_past_schedule_is_immediately_claimable() {
        let (queue, automation_queue) = setup();
        let schedule = Schedule::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            0,
            None,
            Utc::now() - chrono::Duration::minutes(5),
        );

        automation_queue
            .add_process_scheduled_step(&schedule, delay_until(schedule.scheduled_for))
            .await
            .unwrap();
        assert_eq!(queue.claim("w1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_context_includes_id() {
        let trigger = Trigger::pending(
            Uuid::now_v7(),
            Uuid::now_v7(),
            TriggerType::Event,
            Map::new(),
        );
        let context = trigger_context(&trigger);
        assert_eq!(context["triggerId"], trigger.id.to_string());
    }
}

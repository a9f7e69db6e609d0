//! Job payloads, priorities and options

use std::time::Duration;

use chrono::{DateTime, Utc};
use dripline_core::TriggerType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::reliability::{duration_millis, Backoff};

/// Start a workflow run for one subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteAutomationJob {
    pub automation_id: Uuid,
    pub subscriber_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<Uuid>,
}

/// Resume a parked execution from its schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessScheduledStepJob {
    pub schedule_id: Uuid,
    pub execution_id: Uuid,
    pub automation_id: Uuid,
    pub subscriber_id: Uuid,
    pub step_index: u32,
}

/// Re-run a failed step of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryFailedStepJob {
    pub execution_id: Uuid,
    pub step_id: String,
    /// 1-based attempt this retry represents
    pub attempt_number: u32,
}

/// Start a workflow from a recorded trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTriggerJob {
    pub trigger_id: Uuid,
    pub automation_id: Uuid,
    pub subscriber_id: Uuid,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_data: Map<String, Value>,
}

/// Job kinds carried by the automation queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum AutomationJob {
    ExecuteAutomation(ExecuteAutomationJob),
    ProcessScheduledStep(ProcessScheduledStepJob),
    RetryFailedStep(RetryFailedStepJob),
    ProcessTrigger(ProcessTriggerJob),
}

impl AutomationJob {
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::ExecuteAutomation(_) => "execute-automation",
            Self::ProcessScheduledStep(_) => "process-scheduled-step",
            Self::RetryFailedStep(_) => "retry-failed-step",
            Self::ProcessTrigger(_) => "process-trigger",
        }
    }
}

/// Job priority. Higher priorities are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    fn rank(&self) -> u8 {
        match self {
            Self::Critical => 3,
            Self::High => 2,
            Self::Normal => 1,
            Self::Low => 0,
        }
    }
}

impl Ord for JobPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for JobPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-job enqueue options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: JobPriority,

    /// Delay before the job becomes claimable
    #[serde(with = "duration_millis")]
    pub delay: Duration,

    /// Total attempts, including the first
    pub attempts: u32,

    pub backoff: Backoff,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            delay: Duration::ZERO,
            attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// How long finished jobs are kept
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(with = "duration_millis")]
    pub max_age: Duration,
    pub max_count: usize,
}

impl RetentionPolicy {
    pub fn new(max_age: Duration, max_count: usize) -> Self {
        Self { max_age, max_count }
    }

    /// 24 hours / 1000 jobs
    pub fn completed_default() -> Self {
        Self::new(Duration::from_secs(24 * 3600), 1000)
    }

    /// 7 days / 5000 jobs
    pub fn failed_default() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 3600), 5000)
    }
}

/// Lifecycle of a job inside the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A job handed to a worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub job: AutomationJob,
    pub priority: JobPriority,
    /// 1-based attempt number of this run
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Full job record, as stored by the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub job: AutomationJob,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    /// 0-100
    pub progress: u8,
    pub available_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub error_history: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of failing a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailureOutcome {
    /// Job goes back to the queue after `delay`
    WillRetry { next_attempt: u32, delay: Duration },

    /// No attempts left; the job is kept as failed
    Exhausted { attempts: u32 },
}

impl JobFailureOutcome {
    pub fn will_retry(&self) -> bool {
        matches!(self, Self::WillRetry { .. })
    }
}

/// Job counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn test_default_options() {
        let options = JobOptions::default();
        assert_eq!(options.attempts, 3);
        assert_eq!(options.priority, JobPriority::Normal);
        assert_eq!(options.backoff.delay, Duration::from_secs(2));
        assert_eq!(options.delay, Duration::ZERO);
    }

    #[test]
    fn test_job_wire_format() {
        let job = AutomationJob::RetryFailedStep(RetryFailedStepJob {
            execution_id: Uuid::nil(),
            step_id: "s2".into(),
            attempt_number: 2,
        });

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "retry-failed-step");
        assert_eq!(value["data"]["stepId"], "s2");
        assert_eq!(value["data"]["attemptNumber"], 2);
        assert_eq!(job.job_type(), "retry-failed-step");

        let parsed: AutomationJob = serde_json::from_value(json!({
            "type": "execute-automation",
            "data": { "automationId": Uuid::nil(), "subscriberId": Uuid::nil() }
        }))
        .unwrap();
        assert_eq!(parsed.job_type(), "execute-automation");
    }

    #[test]
    fn test_retention_defaults() {
        assert_eq!(RetentionPolicy::completed_default().max_count, 1000);
        assert_eq!(
            RetentionPolicy::failed_default().max_age,
            Duration::from_secs(604_800)
        );
    }
}

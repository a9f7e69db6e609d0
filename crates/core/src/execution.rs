// Execution and StepResult
//
// An Execution is one run of an automation for one subscriber. It can span
// several worker activations: a delay step parks it as `pending` and the
// scheduler picks it up again later. `current_step_id` is the cursor the
// step loop continues from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::step::StepType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// Outcome of executing one step. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Milliseconds
    pub execution_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn completed(
        step_id: impl Into<String>,
        step_type: StepType,
        started_at: DateTime<Utc>,
        data: Value,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            step_id: step_id.into(),
            step_type,
            status: StepStatus::Completed,
            started_at,
            completed_at,
            execution_time: (completed_at - started_at).num_milliseconds(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        step_type: StepType,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            step_id: step_id.into(),
            step_type,
            status: StepStatus::Failed,
            started_at,
            completed_at,
            execution_time: (completed_at - started_at).num_milliseconds(),
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub subscriber_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<Uuid>,
    pub status: ExecutionStatus,
    /// Number of steps executed so far
    pub current_step_index: u32,
    /// Value of `current_step_index` when the last retry reopened the run
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_step_index: u32,
    /// Step the loop runs next; `None` before the first step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds between start and completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(automation_id: Uuid, subscriber_id: Uuid, trigger_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            automation_id,
            subscriber_id,
            trigger_id,
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            retry_step_index: 0,
            current_step_id: None,
            step_results: vec![],
            error: None,
            started_at: None,
            completed_at: None,
            execution_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Enter `running`. The start time is kept across resumes.
    pub fn start(&mut self) {
        let now = Utc::now();
        self.status = ExecutionStatus::Running;
        self.started_at.get_or_insert(now);
        self.updated_at = now;
    }

    /// Park until a schedule resumes it at `next_step_id`.
    pub fn park(&mut self, next_step_id: Option<String>) {
        self.status = ExecutionStatus::Pending;
        self.current_step_id = next_step_id;
        self.updated_at = Utc::now();
    }

    /// Append a step result and advance the step counter.
    pub fn add_step_result(&mut self, result: StepResult) {
        self.step_results.push(result);
        self.current_step_index += 1;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self) {
        self.finish(ExecutionStatus::Completed);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.finish(ExecutionStatus::Failed);
    }

    pub fn cancel(&mut self) {
        self.finish(ExecutionStatus::Cancelled);
    }

    /// Reopen a failed execution so the loop re-runs `step_id`. Step results
    /// stay append-only; the retried step appends a new result. The retried
    /// segment gets a fresh step budget.
    pub fn rewind_to(&mut self, step_id: impl Into<String>) {
        let now = Utc::now();
        self.status = ExecutionStatus::Running;
        self.retry_step_index = self.current_step_index;
        self.current_step_id = Some(step_id.into());
        self.error = None;
        self.completed_at = None;
        self.execution_time = None;
        self.updated_at = now;
    }

    /// Steps executed since the run started or was last retried
    pub fn steps_in_segment(&self) -> u32 {
        self.current_step_index.saturating_sub(self.retry_step_index)
    }

    pub fn last_step_result(&self) -> Option<&StepResult> {
        self.step_results.last()
    }

    /// Most recent result recorded for `step_id`.
    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().rev().find(|r| r.step_id == step_id)
    }

    pub fn successful_steps(&self) -> usize {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Completed)
            .count()
    }

    pub fn failed_steps(&self) -> usize {
        self.step_results.iter().filter(|r| r.is_failed()).count()
    }

    /// Stored execution time, or elapsed time so far for unfinished runs.
    pub fn duration_ms(&self) -> i64 {
        if let Some(ms) = self.execution_time {
            return ms;
        }
        match self.started_at {
            Some(started) => (self.completed_at.unwrap_or_else(Utc::now) - started).num_milliseconds(),
            None => 0,
        }
    }

    fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.execution_time = self.started_at.map(|s| (now - s).num_milliseconds());
        self.updated_at = now;
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_step_result_is_append_only() {
        let mut execution = Execution::new(Uuid::now_v7(), Uuid::now_v7(), None);
        execution.start();

        for i in 0..3 {
            execution.add_step_result(StepResult::completed(
                format!("s{}", i),
                StepType::SendMessage,
                Utc::now(),
                json!({}),
            ));
        }

        assert_eq!(execution.step_results.len(), 3);
        assert_eq!(execution.current_step_index, 3);
        assert_eq!(execution.last_step_result().unwrap().step_id, "s2");
    }

    #[test]
    fn test_terminal_states() {
        let mut execution = Execution::new(Uuid::now_v7(), Uuid::now_v7(), None);
        assert!(!execution.is_terminal());

        execution.start();
        execution.fail("boom");
        assert!(execution.is_terminal());
        assert_eq!(execution.error.as_deref(), Some("boom"));
        assert!(execution.execution_time.is_some());
    }

    #[test]
    fn test_start_keeps_original_start_time() {
        let mut execution = Execution::new(Uuid::now_v7(), Uuid::now_v7(), None);
        execution.start();
        let first = execution.started_at;

        execution.park(Some("s3".into()));
        assert_eq!(execution.status, ExecutionStatus::Pending);
        execution.start();
        assert_eq!(execution.started_at, first);
        assert_eq!(execution.current_step_id.as_deref(), Some("s3"));
    }

    #[test]
    fn test_rewind_reopens_failed_execution() {
        let mut execution = Execution::new(Uuid::now_v7(), Uuid::now_v7(), None);
        execution.start();
        execution.add_step_result(StepResult::failed(
            "s1",
            StepType::SendMessage,
            Utc::now(),
            "smtp down",
        ));
        execution.fail("smtp down");

        execution.rewind_to("s1");
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert!(execution.error.is_none());
        assert_eq!(execution.step_results.len(), 1);
        assert_eq!(execution.failed_steps(), 1);
        assert_eq!(execution.current_step_index, 1);
        assert_eq!(execution.steps_in_segment(), 0);
    }

    #[test]
    fn test_serializes_camel_case() {
        let execution = Execution::new(Uuid::now_v7(), Uuid::now_v7(), None);
        let value = serde_json::to_value(&execution).unwrap();
        assert_eq!(value["currentStepIndex"], 0);
        assert_eq!(value["status"], "pending");
    }
}

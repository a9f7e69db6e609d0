// Schedule: a persisted continuation of a parked execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    /// Handed to the job queue; waiting for a worker to claim it
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// When and where a delayed execution continues.
///
/// The schedule points at its execution directly, so resuming never has to
/// guess between several parked executions of the same (automation,
/// subscriber) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub subscriber_id: Uuid,
    pub execution_id: Uuid,
    /// `current_step_index` of the execution when it parked
    pub step_index: u32,
    /// Step the execution continues with; `None` completes it on resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_step_id: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub status: ScheduleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        automation_id: Uuid,
        subscriber_id: Uuid,
        execution_id: Uuid,
        step_index: u32,
        resume_step_id: Option<String>,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            automation_id,
            subscriber_id,
            execution_id,
            step_index,
            resume_step_id,
            scheduled_for,
            status: ScheduleStatus::Pending,
            executed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Pending && self.scheduled_for <= now
    }

    /// Not yet claimed by a resume, whether or not a job carries it
    pub fn is_awaiting(&self) -> bool {
        matches!(self.status, ScheduleStatus::Pending | ScheduleStatus::Queued)
    }

    pub fn mark_queued(&mut self) {
        self.status = ScheduleStatus::Queued;
        self.updated_at = Utc::now();
    }

    pub fn mark_processing(&mut self) {
        self.status = ScheduleStatus::Processing;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = ScheduleStatus::Completed;
        self.executed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.status = ScheduleStatus::Failed;
        self.executed_at = Some(now);
        self.error = Some(error.into());
        self.updated_at = now;
    }

    pub fn cancel(&mut self) {
        self.status = ScheduleStatus::Cancelled;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut schedule = Schedule::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            2,
            Some("s3".into()),
            now + Duration::minutes(60),
        );

        assert!(!schedule.is_due(now));
        assert!(schedule.is_due(now + Duration::minutes(60)));

        schedule.mark_queued();
        assert!(!schedule.is_due(now + Duration::hours(2)));
        assert!(schedule.is_awaiting());

        schedule.mark_processing();
        assert!(!schedule.is_due(now + Duration::hours(2)));
        assert!(!schedule.is_awaiting());
    }

    #[test]
    fn test_failed_records_error() {
        let mut schedule = Schedule::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            0,
            None,
            Utc::now(),
        );
        schedule.mark_failed("execution not found");
        assert_eq!(schedule.status, ScheduleStatus::Failed);
        assert_eq!(schedule.error.as_deref(), Some("execution not found"));
        assert!(schedule.executed_at.is_some());
    }
}

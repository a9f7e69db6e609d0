//! AutomationStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dripline_core::{
    Automation, AutomationStats, AutomationStatus, Execution, ExecutionStatus, Schedule,
    ScheduleStatus, Subscriber, SubscriberStatus, Trigger, TriggerStatus, TriggerType,
};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("automation not found: {0}")]
    AutomationNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    #[error("trigger not found: {0}")]
    TriggerNotFound(Uuid),

    #[error("subscriber not found: {0}")]
    SubscriberNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AutomationNotFound(_)
                | Self::ExecutionNotFound(_)
                | Self::ScheduleNotFound(_)
                | Self::TriggerNotFound(_)
                | Self::SubscriberNotFound(_)
        )
    }
}

/// Filter for listing automations
#[derive(Debug, Clone, Default)]
pub struct AutomationFilter {
    pub status: Option<AutomationStatus>,
    pub trigger_type: Option<TriggerType>,
    /// Only automations with `is_active` set
    pub active_only: bool,
    pub include_deleted: bool,
}

impl AutomationFilter {
    /// Active, non-deleted automations of one trigger type
    pub fn active(trigger_type: TriggerType) -> Self {
        Self {
            status: Some(AutomationStatus::Active),
            trigger_type: Some(trigger_type),
            active_only: true,
            include_deleted: false,
        }
    }

    pub fn matches(&self, automation: &Automation) -> bool {
        (self.include_deleted || !automation.is_deleted())
            && self.status.map_or(true, |s| automation.status == s)
            && self.trigger_type.map_or(true, |t| automation.trigger_type == t)
            && (!self.active_only || automation.is_active)
    }
}

/// Filter for listing executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub automation_id: Option<Uuid>,
    pub subscriber_id: Option<Uuid>,
    /// Any of these statuses; empty matches all
    pub statuses: Vec<ExecutionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ExecutionFilter {
    pub fn for_automation(automation_id: Uuid) -> Self {
        Self {
            automation_id: Some(automation_id),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ExecutionStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        self.automation_id.map_or(true, |id| execution.automation_id == id)
            && self.subscriber_id.map_or(true, |id| execution.subscriber_id == id)
            && (self.statuses.is_empty() || self.statuses.contains(&execution.status))
            && self.created_after.map_or(true, |t| execution.created_at >= t)
            && self.created_before.map_or(true, |t| execution.created_at <= t)
    }
}

/// Filter for listing schedules
#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub automation_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub status: Option<ScheduleStatus>,
}

impl ScheduleFilter {
    pub fn matches(&self, schedule: &Schedule) -> bool {
        self.automation_id.map_or(true, |id| schedule.automation_id == id)
            && self.execution_id.map_or(true, |id| schedule.execution_id == id)
            && self.status.map_or(true, |s| schedule.status == s)
    }
}

/// Filter for listing triggers
#[derive(Debug, Clone, Default)]
pub struct TriggerFilter {
    pub automation_id: Option<Uuid>,
    pub subscriber_id: Option<Uuid>,
    pub status: Option<TriggerStatus>,
}

impl TriggerFilter {
    pub fn matches(&self, trigger: &Trigger) -> bool {
        self.automation_id.map_or(true, |id| trigger.automation_id == id)
            && self.subscriber_id.map_or(true, |id| trigger.subscriber_id == id)
            && self.status.map_or(true, |s| trigger.status == s)
    }
}

/// Filter for listing subscribers
#[derive(Debug, Clone, Default)]
pub struct SubscriberFilter {
    pub status: Option<SubscriberStatus>,
    pub segment_id: Option<String>,
}

impl SubscriberFilter {
    /// Active subscribers, optionally restricted to one segment
    pub fn active_in(segment_id: Option<&str>) -> Self {
        Self {
            status: Some(SubscriberStatus::Active),
            segment_id: segment_id.map(str::to_string),
        }
    }

    pub fn matches(&self, subscriber: &Subscriber) -> bool {
        self.status.map_or(true, |s| subscriber.status == s)
            && self
                .segment_id
                .as_deref()
                .map_or(true, |seg| subscriber.in_segment(seg))
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Pagination {
    /// 1-based page of `limit` items
    pub fn page(page: u32, limit: u32) -> Self {
        let page = page.max(1);
        let limit = limit.max(1);
        Self {
            offset: (page - 1) * limit,
            limit,
        }
    }

    /// Every matching row
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: u32::MAX,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Repository for every record the engine reads or writes
///
/// Each operation is individually atomic. Nothing spans entities, and no
/// transaction spans the delay-then-resume boundary. Implementations must be
/// thread-safe; several workers share one store.
#[async_trait]
pub trait AutomationStore: Send + Sync + 'static {
    // =========================================================================
    // Automations
    // =========================================================================

    async fn insert_automation(&self, automation: &Automation) -> Result<(), StoreError>;

    /// Get an automation, soft-deleted ones included
    async fn get_automation(&self, id: Uuid) -> Result<Automation, StoreError>;

    async fn save_automation(&self, automation: &Automation) -> Result<(), StoreError>;

    /// Replace only the rolling statistics, leaving status and definition
    /// untouched
    async fn update_automation_stats(
        &self,
        id: Uuid,
        stats: AutomationStats,
    ) -> Result<(), StoreError>;

    /// List automations, oldest first
    async fn list_automations(
        &self,
        filter: &AutomationFilter,
    ) -> Result<Vec<Automation>, StoreError>;

    // =========================================================================
    // Executions
    // =========================================================================

    async fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError>;

    /// Read only the status, used as the cancellation checkpoint
    async fn get_execution_status(&self, id: Uuid) -> Result<ExecutionStatus, StoreError>;

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    /// List executions, newest first
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        pagination: Pagination,
    ) -> Result<Vec<Execution>, StoreError>;

    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<u64, StoreError>;

    /// Set `status` on every matching execution. Terminal target statuses
    /// also stamp `completed_at`. Returns the ids that changed.
    async fn update_execution_status(
        &self,
        filter: &ExecutionFilter,
        status: ExecutionStatus,
    ) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Schedules
    // =========================================================================

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule, StoreError>;

    async fn save_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>, StoreError>;

    /// Pending schedules due at `now`, earliest first
    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Schedule>, StoreError>;

    /// Atomically move a pending schedule to `queued`.
    ///
    /// Returns `None` when the schedule is no longer pending, so a due
    /// schedule is handed to the job queue once no matter how many sweeps
    /// see it.
    async fn queue_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError>;

    /// Atomically move a pending or queued schedule to `processing`.
    ///
    /// Returns `None` when the schedule was already claimed or settled, so a
    /// schedule is resumed at most once even if two workers pick it up.
    async fn claim_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError>;

    /// Cancel every pending or queued schedule matching the filter. Returns
    /// the count.
    async fn cancel_schedules(&self, filter: &ScheduleFilter) -> Result<u64, StoreError>;

    // =========================================================================
    // Triggers
    // =========================================================================

    async fn insert_trigger(&self, trigger: &Trigger) -> Result<(), StoreError>;

    /// Insert a pending trigger unless the same (automation, subscriber)
    /// pair already has one pending. Returns `None` when deduplicated.
    async fn insert_pending_trigger(&self, trigger: &Trigger)
        -> Result<Option<Trigger>, StoreError>;

    /// Insert a scheduled trigger unless one already exists for the same
    /// (automation, subscriber, scheduled_for). Returns `None` when
    /// deduplicated.
    async fn insert_scheduled_trigger(
        &self,
        trigger: &Trigger,
    ) -> Result<Option<Trigger>, StoreError>;

    async fn get_trigger(&self, id: Uuid) -> Result<Trigger, StoreError>;

    async fn save_trigger(&self, trigger: &Trigger) -> Result<(), StoreError>;

    async fn list_triggers(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>, StoreError>;

    /// Atomically move due scheduled triggers to `pending` and return them
    async fn release_due_triggers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError>;

    // =========================================================================
    // Subscribers (owned elsewhere, read by the engine)
    // =========================================================================

    async fn get_subscriber(&self, id: Uuid) -> Result<Subscriber, StoreError>;

    async fn list_subscribers(
        &self,
        filter: &SubscriberFilter,
    ) -> Result<Vec<Subscriber>, StoreError>;

    /// Upsert a subscriber
    async fn save_subscriber(&self, subscriber: &Subscriber) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dripline_core::Subscriber;

    #[test]
    fn test_pagination_page() {
        let p = Pagination::page(3, 20);
        assert_eq!(p.offset, 40);
        assert_eq!(p.limit, 20);

        let first = Pagination::page(0, 0);
        assert_eq!(first.offset, 0);
        assert_eq!(first.limit, 1);
    }

    #[test]
    fn test_subscriber_filter() {
        let vip = Subscriber::new("a@example.com").with_segment("vip");
        let other = Subscriber::new("b@example.com");
        let filter = SubscriberFilter::active_in(Some("vip"));

        assert!(filter.matches(&vip));
        assert!(!filter.matches(&other));
        assert!(SubscriberFilter::active_in(None).matches(&other));
    }

    #[test]
    fn test_execution_filter_statuses() {
        let mut execution = Execution::new(Uuid::now_v7(), Uuid::now_v7(), None);
        let filter = ExecutionFilter::for_automation(execution.automation_id)
            .with_statuses([ExecutionStatus::Pending, ExecutionStatus::Running]);

        assert!(filter.matches(&execution));
        execution.status = ExecutionStatus::Completed;
        assert!(!filter.matches(&execution));
    }
}

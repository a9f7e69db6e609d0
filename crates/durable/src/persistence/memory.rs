//! In-memory implementation of AutomationStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dripline_core::{
    Automation, AutomationStats, Execution, ExecutionStatus, Schedule, ScheduleStatus,
    Subscriber, Trigger, TriggerStatus,
};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// In-memory implementation of AutomationStore
///
/// Every method takes a single lock for its whole read-modify-write, which
/// gives the per-operation atomicity the engine relies on. No lock is held
/// across an `.await`.
///
/// # Example
///
/// ```
/// use dripline_durable::InMemoryAutomationStore;
///
/// let store = InMemoryAutomationStore::new();
/// assert_eq!(store.execution_count(), 0);
/// ```
pub struct InMemoryAutomationStore {
    automations: RwLock<HashMap<Uuid, Automation>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    triggers: RwLock<HashMap<Uuid, Trigger>>,
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
}

impl InMemoryAutomationStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            automations: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
            triggers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.read().len()
    }

    pub fn schedule_count(&self) -> usize {
        self.schedules.read().len()
    }

    /// Hard-remove an automation, bypassing soft delete (for testing)
    pub fn remove_automation(&self, id: Uuid) -> Option<Automation> {
        self.automations.write().remove(&id)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.automations.write().clear();
        self.executions.write().clear();
        self.schedules.write().clear();
        self.triggers.write().clear();
        self.subscribers.write().clear();
    }
}

impl Default for InMemoryAutomationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AutomationStore for InMemoryAutomationStore {
    async fn insert_automation(&self, automation: &Automation) -> Result<(), StoreError> {
        self.automations
            .write()
            .insert(automation.id, automation.clone());
        Ok(())
    }

    async fn get_automation(&self, id: Uuid) -> Result<Automation, StoreError> {
        self.automations
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::AutomationNotFound(id))
    }

    async fn save_automation(&self, automation: &Automation) -> Result<(), StoreError> {
        let mut automations = self.automations.write();
        let slot = automations
            .get_mut(&automation.id)
            .ok_or(StoreError::AutomationNotFound(automation.id))?;
        *slot = automation.clone();
        Ok(())
    }

    async fn update_automation_stats(
        &self,
        id: Uuid,
        stats: AutomationStats,
    ) -> Result<(), StoreError> {
        let mut automations = self.automations.write();
        let automation = automations
            .get_mut(&id)
            .ok_or(StoreError::AutomationNotFound(id))?;
        automation.stats = stats;
        automation.updated_at = Utc::now();
        Ok(())
    }

    async fn list_automations(
        &self,
        filter: &AutomationFilter,
    ) -> Result<Vec<Automation>, StoreError> {
        let mut result: Vec<Automation> = self
            .automations
            .read()
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        result.sort_by_key(|a| (a.created_at, a.id));
        Ok(result)
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        self.executions
            .write()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.executions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn get_execution_status(&self, id: Uuid) -> Result<ExecutionStatus, StoreError> {
        self.executions
            .read()
            .get(&id)
            .map(|e| e.status)
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let slot = executions
            .get_mut(&execution.id)
            .ok_or(StoreError::ExecutionNotFound(execution.id))?;
        *slot = execution.clone();
        Ok(())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        pagination: Pagination,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut result: Vec<Execution> = self
            .executions
            .read()
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(result
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<u64, StoreError> {
        Ok(self
            .executions
            .read()
            .values()
            .filter(|e| filter.matches(e))
            .count() as u64)
    }

    async fn update_execution_status(
        &self,
        filter: &ExecutionFilter,
        status: ExecutionStatus,
    ) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let mut changed = vec![];

        for execution in self.executions.write().values_mut() {
            if !filter.matches(execution) {
                continue;
            }
            execution.status = status;
            execution.updated_at = now;
            if status.is_terminal() {
                execution.completed_at = Some(now);
            }
            changed.push(execution.id);
        }

        Ok(changed)
    }

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.schedules.write().insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule, StoreError> {
        self.schedules
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ScheduleNotFound(id))
    }

    async fn save_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        let slot = schedules
            .get_mut(&schedule.id)
            .ok_or(StoreError::ScheduleNotFound(schedule.id))?;
        *slot = schedule.clone();
        Ok(())
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>, StoreError> {
        let mut result: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        result.sort_by_key(|s| (s.scheduled_for, s.id));
        Ok(result)
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Schedule>, StoreError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.scheduled_for, s.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn queue_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(&id)
            .ok_or(StoreError::ScheduleNotFound(id))?;

        if schedule.status != ScheduleStatus::Pending {
            return Ok(None);
        }
        schedule.mark_queued();
        Ok(Some(schedule.clone()))
    }

    async fn claim_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(&id)
            .ok_or(StoreError::ScheduleNotFound(id))?;

        if !schedule.is_awaiting() {
            return Ok(None);
        }
        schedule.mark_processing();
        Ok(Some(schedule.clone()))
    }

    async fn cancel_schedules(&self, filter: &ScheduleFilter) -> Result<u64, StoreError> {
        let mut count = 0;
        for schedule in self.schedules.write().values_mut() {
            if schedule.is_awaiting() && filter.matches(schedule) {
                schedule.cancel();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
        self.triggers.write().insert(trigger.id, trigger.clone());
        Ok(())
    }

    async fn insert_pending_trigger(
        &self,
        trigger: &Trigger,
    ) -> Result<Option<Trigger>, StoreError> {
        let mut triggers = self.triggers.write();
        let duplicate = triggers.values().any(|t| {
            t.automation_id == trigger.automation_id
                && t.subscriber_id == trigger.subscriber_id
                && t.status == TriggerStatus::Pending
        });
        if duplicate {
            return Ok(None);
        }

        triggers.insert(trigger.id, trigger.clone());
        Ok(Some(trigger.clone()))
    }

    async fn insert_scheduled_trigger(
        &self,
        trigger: &Trigger,
    ) -> Result<Option<Trigger>, StoreError> {
        let mut triggers = self.triggers.write();
        let duplicate = triggers.values().any(|t| {
            t.automation_id == trigger.automation_id
                && t.subscriber_id == trigger.subscriber_id
                && t.status == TriggerStatus::Scheduled
                && t.scheduled_for == trigger.scheduled_for
        });
        if duplicate {
            return Ok(None);
        }

        triggers.insert(trigger.id, trigger.clone());
        Ok(Some(trigger.clone()))
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Trigger, StoreError> {
        self.triggers
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::TriggerNotFound(id))
    }

    async fn save_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
        let mut triggers = self.triggers.write();
        let slot = triggers
            .get_mut(&trigger.id)
            .ok_or(StoreError::TriggerNotFound(trigger.id))?;
        *slot = trigger.clone();
        Ok(())
    }

    async fn list_triggers(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>, StoreError> {
        let mut result: Vec<Trigger> = self
            .triggers
            .read()
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        result.sort_by_key(|t| (t.created_at, t.id));
        Ok(result)
    }

    async fn release_due_triggers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError> {
        let mut triggers = self.triggers.write();

        let mut due: Vec<(DateTime<Utc>, Uuid)> = triggers
            .values()
            .filter(|t| t.status == TriggerStatus::Scheduled)
            .filter_map(|t| t.scheduled_for.filter(|at| *at <= now).map(|at| (at, t.id)))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut released = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(trigger) = triggers.get_mut(&id) {
                trigger.release();
                released.push(trigger.clone());
            }
        }
        Ok(released)
    }

    async fn get_subscriber(&self, id: Uuid) -> Result<Subscriber, StoreError> {
        self.subscribers
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::SubscriberNotFound(id))
    }

    async fn list_subscribers(
        &self,
        filter: &SubscriberFilter,
    ) -> Result<Vec<Subscriber>, StoreError> {
        let mut result: Vec<Subscriber> = self
            .subscribers
            .read()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        result.sort_by_key(|s| (s.created_at, s.id));
        Ok(result)
    }

    async fn save_subscriber(&self, subscriber: &Subscriber) -> Result<(), StoreError> {
        self.subscribers
            .write()
            .insert(subscriber.id, subscriber.clone());
        Ok(())
    }
}

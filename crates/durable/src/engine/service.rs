//! Automation administration
//!
//! Lifecycle operations consumed by the API layer: create, update,
//! activate, pause, archive and delete, plus execution listings, analytics,
//! test runs and queue introspection.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use dripline_core::{
    Automation, AutomationStatus, AutomationUpdate, Execution, ExecutionStatus, NewAutomation,
    StepType, ValidationError,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::persistence::{
    AutomationFilter, AutomationStore, ExecutionFilter, Pagination, ScheduleFilter, StoreError,
};
use crate::queue::{AutomationQueue, QueueError, QueueMetrics};

use super::executor::{ExecutorError, WorkflowExecutor};
use super::triggers::{TriggerError, TriggerEvaluator};

const DEFAULT_PAGE: u32 = 1;
const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The definition failed validation and was not persisted
    #[error("invalid automation: {0}")]
    Validation(#[from] ValidationError),

    /// Missing or soft-deleted automation
    #[error("automation not found: {0}")]
    NotFound(Uuid),

    /// Steps cannot change, and the automation cannot be deleted, while active
    #[error("automation {0} is active; pause it first")]
    ActiveAutomationLocked(Uuid),

    #[error("cannot {action} automation {id} in status {status}")]
    InvalidTransition {
        id: Uuid,
        status: AutomationStatus,
        action: &'static str,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Execution listing query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionQuery {
    #[serde(default)]
    pub automation_id: Option<Uuid>,
    #[serde(default)]
    pub subscriber_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    /// 1-based
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    DEFAULT_PAGE
}

fn default_page_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            automation_id: None,
            subscriber_id: None,
            status: None,
            page: DEFAULT_PAGE,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl ExecutionQuery {
    pub fn for_automation(automation_id: Uuid) -> Self {
        Self {
            automation_id: Some(automation_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_page(mut self, page: u32, limit: u32) -> Self {
        self.page = page;
        self.limit = limit;
        self
    }

    fn filter(&self) -> ExecutionFilter {
        ExecutionFilter {
            automation_id: self.automation_id,
            subscriber_id: self.subscriber_id,
            statuses: self.status.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// One page of executions, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPage {
    pub items: Vec<Execution>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

/// Inclusive creation-time window for analytics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPerformance {
    pub step_id: String,
    pub step_type: StepType,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Milliseconds, rounded
    pub average_execution_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub date: NaiveDate,
    pub executions: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationAnalytics {
    pub automation_id: Uuid,
    pub total_executions: u64,
    pub completed_executions: u64,
    pub failed_executions: u64,
    /// Percent, two decimals
    pub success_rate: f64,
    /// Milliseconds, rounded
    pub average_execution_time: i64,
    pub step_performance: Vec<StepPerformance>,
    pub timeline: Vec<TimelineEntry>,
    /// Subscribers with a pending or running execution
    pub active_subscribers: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedStep {
    pub step_id: String,
    pub step_type: StepType,
    pub status: String,
}

/// Result of [`AutomationService::test`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TestRun {
    /// Nothing ran; each step is listed as it would be visited
    DryRun {
        automation_id: Uuid,
        subscriber_id: Uuid,
        steps: Vec<SimulatedStep>,
    },
    Executed {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Administrative front for automations
pub struct AutomationService {
    store: Arc<dyn AutomationStore>,
    executor: Arc<WorkflowExecutor>,
    triggers: Arc<TriggerEvaluator>,
    queue: AutomationQueue,
}

impl AutomationService {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        executor: Arc<WorkflowExecutor>,
        triggers: Arc<TriggerEvaluator>,
        queue: AutomationQueue,
    ) -> Self {
        Self {
            store,
            executor,
            triggers,
            queue,
        }
    }

    /// Validate and persist a new draft automation
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    pub async fn create(&self, definition: NewAutomation) -> Result<Automation, ServiceError> {
        definition.validate()?;

        let automation = Automation::from_definition(definition);
        self.store.insert_automation(&automation).await?;

        info!(automation_id = %automation.id, "created automation");
        Ok(automation)
    }

    pub async fn get(&self, id: Uuid) -> Result<Automation, ServiceError> {
        match self.store.get_automation(id).await {
            Ok(automation) if !automation.is_deleted() => Ok(automation),
            Ok(_) => Err(ServiceError::NotFound(id)),
            Err(e) if e.is_not_found() => Err(ServiceError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Deleted automations are never listed
    pub async fn list(&self, filter: AutomationFilter) -> Result<Vec<Automation>, ServiceError> {
        let filter = AutomationFilter {
            include_deleted: false,
            ..filter
        };
        Ok(self.store.list_automations(&filter).await?)
    }

    #[instrument(skip(self, update))]
    pub async fn update(
        &self,
        id: Uuid,
        update: AutomationUpdate,
    ) -> Result<Automation, ServiceError> {
        let mut automation = self.get(id).await?;

        if update.steps.is_some() && automation.is_active {
            return Err(ServiceError::ActiveAutomationLocked(id));
        }

        if let Some(name) = update.name {
            automation.name = name;
        }
        if let Some(description) = update.description {
            automation.description = Some(description);
        }
        if let Some(trigger_config) = update.trigger_config {
            automation.trigger_config = trigger_config;
        }
        if let Some(steps) = update.steps {
            automation.steps = steps;
        }
        if let Some(segment_id) = update.segment_id {
            automation.segment_id = Some(segment_id);
        }

        dripline_core::validate_steps(&automation.steps)?;
        automation.trigger()?;

        automation.updated_at = Utc::now();
        self.store.save_automation(&automation).await?;

        info!("updated automation");
        Ok(automation)
    }

    /// Soft delete. Active automations must be paused first.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: Uuid) -> Result<(), ServiceError> {
        let mut automation = self.get(id).await?;
        if automation.is_active {
            return Err(ServiceError::ActiveAutomationLocked(id));
        }

        automation.soft_delete();
        self.store.save_automation(&automation).await?;

        info!("deleted automation");
        Ok(())
    }

    /// Activate a draft or paused automation
    ///
    /// With `register_existing`, subscribers already in the audience get a
    /// trigger as if they had just matched.
    #[instrument(skip(self))]
    pub async fn activate(
        &self,
        id: Uuid,
        register_existing: bool,
    ) -> Result<Automation, ServiceError> {
        let mut automation = self.get(id).await?;
        automation.trigger()?;

        if !automation.activate() {
            return Err(ServiceError::InvalidTransition {
                id,
                status: automation.status,
                action: "activate",
            });
        }
        self.store.save_automation(&automation).await?;
        info!("activated automation");

        if register_existing {
            self.triggers
                .register_existing_subscribers(&automation)
                .await?;
        }

        Ok(automation)
    }

    /// Pause an active automation
    ///
    /// With `cancel_pending`, its pending and running executions are
    /// cancelled along with their pending schedules. A step already running
    /// finishes; the executor stops at its next status check.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: Uuid, cancel_pending: bool) -> Result<Automation, ServiceError> {
        let mut automation = self.get(id).await?;

        if !automation.pause() {
            return Err(ServiceError::InvalidTransition {
                id,
                status: automation.status,
                action: "pause",
            });
        }
        self.store.save_automation(&automation).await?;

        if cancel_pending {
            let filter = ExecutionFilter::for_automation(id)
                .with_statuses([ExecutionStatus::Pending, ExecutionStatus::Running]);
            let cancelled = self
                .store
                .update_execution_status(&filter, ExecutionStatus::Cancelled)
                .await?;
            let schedules = self
                .store
                .cancel_schedules(&ScheduleFilter {
                    automation_id: Some(id),
                    ..Default::default()
                })
                .await?;

            info!(
                executions = cancelled.len(),
                schedules, "cancelled pending work"
            );
        }

        info!("paused automation");
        Ok(automation)
    }

    #[instrument(skip(self))]
    pub async fn archive(&self, id: Uuid) -> Result<Automation, ServiceError> {
        let mut automation = self.get(id).await?;
        automation.archive();
        self.store.save_automation(&automation).await?;

        info!("archived automation");
        Ok(automation)
    }

    pub async fn get_executions(&self, query: ExecutionQuery) -> Result<ExecutionPage, ServiceError> {
        let filter = query.filter();
        let pagination = Pagination::page(query.page, query.limit);
        let page = query.page.max(1);
        let limit = pagination.limit;

        let total = self.store.count_executions(&filter).await?;
        let items = self.store.list_executions(&filter, pagination).await?;

        Ok(ExecutionPage {
            items,
            total,
            page,
            limit,
            total_pages: total.div_ceil(u64::from(limit)),
        })
    }

    /// Aggregate the automation's executions created within `range`
    #[instrument(skip(self))]
    pub async fn get_analytics(
        &self,
        id: Uuid,
        range: DateRange,
    ) -> Result<AutomationAnalytics, ServiceError> {
        self.get(id).await?;

        let filter = ExecutionFilter {
            automation_id: Some(id),
            created_after: range.start,
            created_before: range.end,
            ..Default::default()
        };
        let executions = self
            .store
            .list_executions(&filter, Pagination::all())
            .await?;

        let live = ExecutionFilter::for_automation(id)
            .with_statuses([ExecutionStatus::Pending, ExecutionStatus::Running]);
        let active_subscribers = self
            .store
            .list_executions(&live, Pagination::all())
            .await?
            .iter()
            .map(|e| e.subscriber_id)
            .collect::<HashSet<_>>()
            .len() as u64;

        Ok(analyze(id, &executions, active_subscribers))
    }

    /// Try an automation against one subscriber
    ///
    /// A dry run touches nothing and lists the steps. Otherwise the workflow
    /// runs for real, including message sends.
    #[instrument(skip(self))]
    pub async fn test(
        &self,
        id: Uuid,
        subscriber_id: Uuid,
        dry_run: bool,
    ) -> Result<TestRun, ServiceError> {
        let automation = self.get(id).await?;
        self.store.get_subscriber(subscriber_id).await?;

        if dry_run {
            let steps = automation
                .steps
                .iter()
                .map(|step| SimulatedStep {
                    step_id: step.id.clone(),
                    step_type: step.step_type(),
                    status: "simulated".to_string(),
                })
                .collect();
            return Ok(TestRun::DryRun {
                automation_id: id,
                subscriber_id,
                steps,
            });
        }

        let execution = self
            .executor
            .execute_workflow(id, subscriber_id, None)
            .await?;
        Ok(TestRun::Executed {
            execution_id: execution.id,
            status: execution.status,
        })
    }

    pub async fn get_queue_metrics(&self) -> Result<QueueMetrics, ServiceError> {
        Ok(self.queue.metrics().await?)
    }

    /// Enqueue a retry of `step_id`. Returns the job id.
    #[instrument(skip(self))]
    pub async fn retry_step(
        &self,
        execution_id: Uuid,
        step_id: &str,
        attempt_number: u32,
    ) -> Result<Uuid, ServiceError> {
        let execution = self.store.get_execution(execution_id).await?;
        Ok(self
            .queue
            .add_retry_failed_step(&execution, step_id, attempt_number)
            .await?)
    }
}

fn analyze(automation_id: Uuid, executions: &[Execution], active_subscribers: u64) -> AutomationAnalytics {
    let total = executions.len() as u64;
    let completed = count_status(executions, ExecutionStatus::Completed);
    let failed = count_status(executions, ExecutionStatus::Failed);

    let success_rate = if total > 0 {
        round2(completed as f64 / total as f64 * 100.0)
    } else {
        0.0
    };

    let timed: Vec<i64> = executions.iter().filter_map(|e| e.execution_time).collect();
    let average_execution_time = mean_ms(timed.iter().copied());

    AutomationAnalytics {
        automation_id,
        total_executions: total,
        completed_executions: completed,
        failed_executions: failed,
        success_rate,
        average_execution_time,
        step_performance: step_performance(executions),
        timeline: timeline(executions),
        active_subscribers,
    }
}

fn count_status(executions: &[Execution], status: ExecutionStatus) -> u64 {
    executions.iter().filter(|e| e.status == status).count() as u64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn mean_ms(values: impl Iterator<Item = i64>) -> i64 {
    let (sum, count) = values.fold((0i64, 0i64), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0
    } else {
        (sum as f64 / count as f64).round() as i64
    }
}

/// Per-step aggregates, in order of first appearance
fn step_performance(executions: &[Execution]) -> Vec<StepPerformance> {
    struct Acc {
        step_type: StepType,
        total: u64,
        ok: u64,
        failed: u64,
        time: i64,
    }

    let mut order: Vec<String> = Vec::new();
    let mut acc: std::collections::HashMap<String, Acc> = std::collections::HashMap::new();

    // Oldest first so the first execution fixes the ordering
    for execution in executions.iter().rev() {
        for result in &execution.step_results {
            let entry = acc.entry(result.step_id.clone()).or_insert_with(|| {
                order.push(result.step_id.clone());
                Acc {
                    step_type: result.step_type,
                    total: 0,
                    ok: 0,
                    failed: 0,
                    time: 0,
                }
            });
            entry.total += 1;
            if result.is_failed() {
                entry.failed += 1;
            } else {
                entry.ok += 1;
            }
            entry.time += result.execution_time;
        }
    }

    order
        .into_iter()
        .filter_map(|step_id| {
            let a = acc.remove(&step_id)?;
            Some(StepPerformance {
                step_id,
                step_type: a.step_type,
                total_executions: a.total,
                successful_executions: a.ok,
                failed_executions: a.failed,
                average_execution_time: (a.time as f64 / a.total as f64).round() as i64,
            })
        })
        .collect()
}

fn timeline(executions: &[Execution]) -> Vec<TimelineEntry> {
    let mut days: BTreeMap<NaiveDate, TimelineEntry> = BTreeMap::new();

    for execution in executions {
        let date = execution.created_at.date_naive();
        let entry = days.entry(date).or_insert(TimelineEntry {
            date,
            executions: 0,
            completed: 0,
            failed: 0,
        });
        entry.executions += 1;
        match execution.status {
            ExecutionStatus::Completed => entry.completed += 1,
            ExecutionStatus::Failed => entry.failed += 1,
            _ => {}
        }
    }

    days.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryAutomationStore;
    use crate::queue::{InMemoryJobQueue, JobPriority, JobQueue, JobState};
    use dripline_core::{
        Schedule, ScheduleStatus, Step, StepResult, Subscriber, SubscriberStatus, TriggerType,
    };
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryAutomationStore>,
        jobs: Arc<InMemoryJobQueue>,
        service: AutomationService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryAutomationStore::new());
        let jobs = Arc::new(InMemoryJobQueue::new());
        let queue = AutomationQueue::new(jobs.clone());
        let executor = Arc::new(WorkflowExecutor::new(store.clone()));
        let triggers = Arc::new(TriggerEvaluator::new(store.clone(), queue.clone()));
        let service = AutomationService::new(store.clone(), executor, triggers, queue);
        Fixture {
            store,
            jobs,
            service,
        }
    }

    fn welcome() -> NewAutomation {
        NewAutomation::new(
            "Welcome",
            TriggerType::Event,
            json!({ "events": ["subscriber.created"] }),
        )
        .with_steps(vec![Step::send_message("s1", "Hi").then("s2"), Step::exit("s2")])
    }

    async fn subscriber(store: &InMemoryAutomationStore) -> Subscriber {
        let subscriber = Subscriber::new("ada@example.com");
        store.save_subscriber(&subscriber).await.unwrap();
        subscriber
    }

    #[tokio::test]
    async fn test_create_validates_and_persists_draft() {
        let f = fixture();

        let duplicate = NewAutomation::new("Broken", TriggerType::Event, json!({ "events": [] }))
            .with_steps(vec![Step::exit("s1"), Step::exit("s1")]);
        let err = f.service.create(duplicate).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(f.service.list(AutomationFilter::default()).await.unwrap().is_empty());

        let automation = f.service.create(welcome()).await.unwrap();
        assert_eq!(automation.status, AutomationStatus::Draft);
        assert!(!automation.is_active);
    }

    #[tokio::test]
    async fn test_steps_locked_while_active() {
        let f = fixture();
        let automation = f.service.create(welcome()).await.unwrap();
        f.service.activate(automation.id, false).await.unwrap();

        let err = f
            .service
            .update(
                automation.id,
                AutomationUpdate {
                    steps: Some(vec![Step::exit("only")]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ActiveAutomationLocked(_)));

        let renamed = f
            .service
            .update(
                automation.id,
                AutomationUpdate {
                    name: Some("Hello".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Hello");
    }

    #[tokio::test]
    async fn test_update_revalidates_steps() {
        let f = fixture();
        let automation = f.service.create(welcome()).await.unwrap();

        let err = f
            .service
            .update(
                automation.id,
                AutomationUpdate {
                    steps: Some(vec![Step::send_message("s1", "Hi").then("missing")]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(f.service.get(automation.id).await.unwrap().steps.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_hides_automation() {
        let f = fixture();
        let automation = f.service.create(welcome()).await.unwrap();
        f.service.activate(automation.id, false).await.unwrap();

        assert!(matches!(
            f.service.remove(automation.id).await.unwrap_err(),
            ServiceError::ActiveAutomationLocked(_)
        ));

        f.service.pause(automation.id, false).await.unwrap();
        f.service.remove(automation.id).await.unwrap();
        assert!(matches!(
            f.service.get(automation.id).await.unwrap_err(),
            ServiceError::NotFound(_)
        ));
        assert!(f.service.list(AutomationFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activate_registers_existing_subscribers() {
        let f = fixture();
        subscriber(&f.store).await;
        let inactive = Subscriber::new("gone@example.com").with_status(SubscriberStatus::Unsubscribed);
        f.store.save_subscriber(&inactive).await.unwrap();

        let automation = f.service.create(welcome()).await.unwrap();
        let active = f.service.activate(automation.id, true).await.unwrap();
        assert_eq!(active.status, AutomationStatus::Active);
        assert_eq!(f.store.trigger_count(), 1);
        assert_eq!(f.jobs.jobs_in_state(JobState::Waiting).len(), 1);

        // Already active
        assert!(matches!(
            f.service.activate(automation.id, true).await.unwrap_err(),
            ServiceError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_pause_cancels_pending_work() {
        let f = fixture();
        let sub = subscriber(&f.store).await;
        let automation = f.service.create(welcome()).await.unwrap();
        f.service.activate(automation.id, false).await.unwrap();

        let mut parked = Execution::new(automation.id, sub.id, None);
        parked.park(Some("s2".into()));
        f.store.insert_execution(&parked).await.unwrap();
        let schedule = Schedule::new(automation.id, sub.id, parked.id, 1, Some("s2".into()), Utc::now());
        f.store.insert_schedule(&schedule).await.unwrap();

        let paused = f.service.pause(automation.id, true).await.unwrap();
        assert!(!paused.is_active);
        assert_eq!(
            f.store.get_execution_status(parked.id).await.unwrap(),
            ExecutionStatus::Cancelled
        );
        assert_eq!(
            f.store.get_schedule(schedule.id).await.unwrap().status,
            ScheduleStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_get_executions_paginates() {
        let f = fixture();
        let sub = subscriber(&f.store).await;
        let automation = f.service.create(welcome()).await.unwrap();
        for _ in 0..25 {
            let execution = Execution::new(automation.id, sub.id, None);
            f.store.insert_execution(&execution).await.unwrap();
        }

        let page = f
            .service
            .get_executions(ExecutionQuery::for_automation(automation.id))
            .await
            .unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.items.len(), 20);
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, 20);
        assert_eq!(page.total_pages, 2);

        let second = f
            .service
            .get_executions(ExecutionQuery::for_automation(automation.id).with_page(2, 20))
            .await
            .unwrap();
        assert_eq!(second.items.len(), 5);
    }

    #[tokio::test]
    async fn test_analytics() {
        let f = fixture();
        let sub = subscriber(&f.store).await;
        let automation = f.service.create(welcome()).await.unwrap();

        for ok in [true, true, false] {
            let mut execution = Execution::new(automation.id, sub.id, None);
            execution.start();
            let started = Utc::now();
            if ok {
                execution.add_step_result(StepResult::completed("s1", StepType::SendMessage, started, json!({})));
                execution.complete();
            } else {
                execution.add_step_result(StepResult::failed("s1", StepType::SendMessage, started, "boom"));
                execution.fail("boom");
            }
            f.store.insert_execution(&execution).await.unwrap();
        }
        let waiting = Execution::new(automation.id, sub.id, None);
        f.store.insert_execution(&waiting).await.unwrap();

        let analytics = f
            .service
            .get_analytics(automation.id, DateRange::default())
            .await
            .unwrap();
        assert_eq!(analytics.total_executions, 4);
        assert_eq!(analytics.completed_executions, 2);
        assert_eq!(analytics.failed_executions, 1);
        assert_eq!(analytics.success_rate, 50.0);
        assert_eq!(analytics.active_subscribers, 1);
        assert_eq!(analytics.step_performance.len(), 1);
        assert_eq!(analytics.step_performance[0].total_executions, 3);
        assert_eq!(analytics.step_performance[0].failed_executions, 1);
        assert_eq!(analytics.timeline.len(), 1);
        assert_eq!(analytics.timeline[0].executions, 4);
    }

    #[test]
    fn test_success_rate_rounding() {
        assert_eq!(round2(2.0 / 3.0 * 100.0), 66.67);
        assert_eq!(mean_ms([1, 2].into_iter()), 2);
        assert_eq!(mean_ms(std::iter::empty()), 0);
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let f = fixture();
        let sub = subscriber(&f.store).await;
        let automation = f.service.create(welcome()).await.unwrap();

        let run = f.service.test(automation.id, sub.id, true).await.unwrap();
        match run {
            TestRun::DryRun { steps, .. } => {
                assert_eq!(steps.len(), 2);
                assert!(steps.iter().all(|s| s.status == "simulated"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.store.execution_count(), 0);

        let run = f.service.test(automation.id, sub.id, false).await.unwrap();
        assert!(matches!(
            run,
            TestRun::Executed {
                status: ExecutionStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_retry_step_enqueues_high_priority() {
        let f = fixture();
        let sub = subscriber(&f.store).await;
        let automation = f.service.create(welcome()).await.unwrap();
        let execution = Execution::new(automation.id, sub.id, None);
        f.store.insert_execution(&execution).await.unwrap();

        let job_id = f.service.retry_step(execution.id, "s1", 1).await.unwrap();
        let record = f.jobs.get_job(job_id).await.unwrap();
        assert_eq!(record.options.priority, JobPriority::High);
        assert_eq!(record.options.attempts, 3);

        let metrics = f.service.get_queue_metrics().await.unwrap();
        assert_eq!(metrics.waiting, 1);
    }
}

//! Trigger evaluation
//!
//! Turns external signals into [`Trigger`] records for (automation,
//! subscriber) pairs and enqueues a `process-trigger` job for each. Event,
//! behavior and attribute triggers are created `pending` and deduplicated per
//! pair. Time-based triggers are created `scheduled` and released by the
//! scheduler once due.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use dripline_core::{
    all_match, Automation, BehaviorTriggerConfig, Subscriber, TimeBasedTriggerConfig,
    TimeSchedule, Trigger, TriggerConfig, TriggerType,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{
    AutomationFilter, AutomationStore, StoreError, SubscriberFilter, TriggerFilter,
};
use crate::queue::{AutomationQueue, QueueError};

use super::collaborators::{SegmentResolver, SubscriberSegments};

const MINUTES_PER_DAY: u64 = 24 * 60;

/// Behavior windows are capped at a century
const MAX_WINDOW_MINUTES: u64 = 100 * 365 * MINUTES_PER_DAY;

/// Errors from trigger evaluation
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Enqueue the `process-trigger` job for a stored pending trigger
///
/// A trigger whose job cannot be queued is marked failed before the error is
/// returned, so it does not hold the pair's pending slot with nothing to
/// process it.
pub(crate) async fn enqueue_trigger(
    store: &dyn AutomationStore,
    queue: &AutomationQueue,
    trigger: &Trigger,
) -> Result<(), QueueError> {
    let Err(e) = queue.add_process_trigger(trigger).await else {
        return Ok(());
    };

    let mut failed = trigger.clone();
    failed.mark_failed(format!("Failed to enqueue trigger: {e}"));
    if let Err(store_err) = store.save_trigger(&failed).await {
        warn!(trigger_id = %trigger.id, error = %store_err, "could not mark unqueued trigger failed");
    }
    Err(e)
}

/// Evaluates trigger signals against active automations
pub struct TriggerEvaluator {
    store: Arc<dyn AutomationStore>,
    queue: AutomationQueue,
    segments: Arc<dyn SegmentResolver>,
}

impl TriggerEvaluator {
    pub fn new(store: Arc<dyn AutomationStore>, queue: AutomationQueue) -> Self {
        Self {
            store,
            queue,
            segments: Arc::new(SubscriberSegments),
        }
    }

    pub fn with_segments(mut self, segments: Arc<dyn SegmentResolver>) -> Self {
        self.segments = segments;
        self
    }

    /// Match an event for one subscriber against every active event automation
    ///
    /// Returns the triggers created. Pairs that already have a pending
    /// trigger are skipped.
    #[instrument(skip(self, event_data))]
    pub async fn evaluate_event_trigger(
        &self,
        event: &str,
        subscriber_id: Uuid,
        event_data: Map<String, Value>,
    ) -> Result<Vec<Trigger>, TriggerError> {
        let subscriber = self.store.get_subscriber(subscriber_id).await?;
        let mut created = vec![];

        for automation in self.active_automations(TriggerType::Event).await? {
            let Some(TriggerConfig::Event(config)) = typed_config(&automation) else {
                continue;
            };

            if !config.matches_event(event) {
                continue;
            }
            if !self.targets(&automation, &subscriber).await {
                continue;
            }
            if !all_match(&config.conditions, &event_data, &subscriber) {
                debug!(automation_id = %automation.id, "event conditions not met");
                continue;
            }

            let mut data = event_data.clone();
            data.insert("event".into(), Value::String(event.to_string()));

            if let Some(trigger) = self
                .create_trigger(&automation, subscriber.id, TriggerType::Event, data)
                .await?
            {
                created.push(trigger);
            }
        }

        Ok(created)
    }

    /// Attribute change on one subscriber
    #[instrument(skip(self, old_value, new_value))]
    pub async fn evaluate_attribute_trigger(
        &self,
        subscriber_id: Uuid,
        attribute: &str,
        old_value: &Value,
        new_value: &Value,
    ) -> Result<Vec<Trigger>, TriggerError> {
        let subscriber = self.store.get_subscriber(subscriber_id).await?;
        let mut created = vec![];

        for automation in self.active_automations(TriggerType::Attribute).await? {
            let Some(TriggerConfig::Attribute(config)) = typed_config(&automation) else {
                continue;
            };

            if !config.matches(attribute, old_value, new_value) {
                continue;
            }
            if !self.targets(&automation, &subscriber).await {
                continue;
            }

            let data = json_map(json!({
                "attribute": attribute,
                "oldValue": old_value,
                "newValue": new_value,
            }));

            if let Some(trigger) = self
                .create_trigger(&automation, subscriber.id, TriggerType::Attribute, data)
                .await?
            {
                created.push(trigger);
            }
        }

        Ok(created)
    }

    /// Periodic behavior sweep
    pub async fn evaluate_behavior_triggers(&self) -> Result<usize, TriggerError> {
        self.evaluate_behavior_triggers_at(Utc::now()).await
    }

    /// Behavior sweep as of `now`. Returns the number of triggers created.
    #[instrument(skip(self))]
    pub async fn evaluate_behavior_triggers_at(&self, now: DateTime<Utc>) -> Result<usize, TriggerError> {
        let mut created = 0;

        for automation in self.active_automations(TriggerType::Behavior).await? {
            let Some(TriggerConfig::Behavior(config)) = typed_config(&automation) else {
                continue;
            };

            for subscriber in self.target_subscribers(&automation).await? {
                if !behavior_matches(&config, &subscriber, now) {
                    continue;
                }

                let data = json_map(json!({
                    "behaviorType": config.behavior_type.as_str(),
                    "inactiveDays": config.time_window / MINUTES_PER_DAY,
                }));

                if self
                    .create_trigger(&automation, subscriber.id, TriggerType::Behavior, data)
                    .await?
                    .is_some()
                {
                    created += 1;
                }
            }
        }

        info!(created, "behavior sweep finished");
        Ok(created)
    }

    /// Daily time-based sweep
    pub async fn evaluate_time_based_triggers(&self) -> Result<usize, TriggerError> {
        self.evaluate_time_based_triggers_at(Utc::now()).await
    }

    /// Time-based sweep as of `now`. Returns the number of scheduled
    /// triggers created.
    #[instrument(skip(self))]
    pub async fn evaluate_time_based_triggers_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, TriggerError> {
        let today = now.date_naive();
        let mut created = 0;

        for automation in self.active_automations(TriggerType::TimeBased).await? {
            let Some(TriggerConfig::TimeBased(config)) = typed_config(&automation) else {
                continue;
            };
            let Ok(time) = config.time_of_day() else {
                continue;
            };
            if !runs_today(&config, today) {
                continue;
            }

            let scheduled_for = Utc.from_utc_datetime(&today.and_time(time));

            for subscriber in self.target_subscribers(&automation).await? {
                if !date_matches(&config, &subscriber, today) {
                    continue;
                }

                let trigger = Trigger::scheduled(automation.id, subscriber.id, scheduled_for);
                if self.store.insert_scheduled_trigger(&trigger).await?.is_some() {
                    created += 1;
                }
            }
        }

        info!(created, "time-based sweep finished");
        Ok(created)
    }

    /// Create a pending trigger for every targeted subscriber that has never
    /// had one for this automation
    #[instrument(skip(self, automation), fields(automation_id = %automation.id))]
    pub async fn register_existing_subscribers(
        &self,
        automation: &Automation,
    ) -> Result<usize, TriggerError> {
        let mut registered = 0;

        for subscriber in self.target_subscribers(automation).await? {
            let existing = self
                .store
                .list_triggers(&TriggerFilter {
                    automation_id: Some(automation.id),
                    subscriber_id: Some(subscriber.id),
                    status: None,
                })
                .await?;
            if !existing.is_empty() {
                continue;
            }

            let trigger = Trigger::pending(
                automation.id,
                subscriber.id,
                automation.trigger_type,
                json_map(json!({ "source": "existing_subscribers" })),
            );
            self.store.insert_trigger(&trigger).await?;
            enqueue_trigger(self.store.as_ref(), &self.queue, &trigger).await?;
            registered += 1;
        }

        info!(registered, "registered existing subscribers");
        Ok(registered)
    }

    /// Persist a pending trigger and enqueue its processing job
    ///
    /// Returns `None` when the pair already has a pending trigger.
    pub async fn create_trigger(
        &self,
        automation: &Automation,
        subscriber_id: Uuid,
        trigger_type: TriggerType,
        trigger_data: Map<String, Value>,
    ) -> Result<Option<Trigger>, TriggerError> {
        let trigger = Trigger::pending(automation.id, subscriber_id, trigger_type, trigger_data);

        let Some(trigger) = self.store.insert_pending_trigger(&trigger).await? else {
            debug!(automation_id = %automation.id, %subscriber_id, "trigger already pending");
            return Ok(None);
        };

        enqueue_trigger(self.store.as_ref(), &self.queue, &trigger).await?;
        info!(
            trigger_id = %trigger.id,
            automation_id = %automation.id,
            %subscriber_id,
            %trigger_type,
            "created trigger"
        );
        Ok(Some(trigger))
    }

    async fn active_automations(&self, trigger_type: TriggerType) -> Result<Vec<Automation>, StoreError> {
        self.store
            .list_automations(&AutomationFilter::active(trigger_type))
            .await
    }

    async fn targets(&self, automation: &Automation, subscriber: &Subscriber) -> bool {
        match automation.segment_id.as_deref() {
            Some(segment_id) => self.segments.is_member(subscriber, segment_id).await,
            None => true,
        }
    }

    /// Active subscribers, restricted to the automation's segment
    async fn target_subscribers(&self, automation: &Automation) -> Result<Vec<Subscriber>, StoreError> {
        let candidates = self
            .store
            .list_subscribers(&SubscriberFilter::active_in(None))
            .await?;

        let mut targeted = Vec::with_capacity(candidates.len());
        for subscriber in candidates {
            if self.targets(automation, &subscriber).await {
                targeted.push(subscriber);
            }
        }
        Ok(targeted)
    }
}

fn typed_config(automation: &Automation) -> Option<TriggerConfig> {
    match automation.trigger() {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(automation_id = %automation.id, error = %e, "skipping automation with invalid trigger config");
            None
        }
    }
}

fn json_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Whether the subscriber's activity timestamp is older than the window
fn behavior_matches(config: &BehaviorTriggerConfig, subscriber: &Subscriber, now: DateTime<Utc>) -> bool {
    let window = config.time_window.min(MAX_WINDOW_MINUTES) as i64;
    let cutoff = now - chrono::Duration::minutes(window);

    match subscriber.date_attribute(config.activity_field()) {
        Some(at) => at < cutoff,
        None => config.behavior_type.matches_missing_activity(),
    }
}

/// Weekly and monthly schedules only run on their configured day
fn runs_today(config: &TimeBasedTriggerConfig, today: NaiveDate) -> bool {
    match config.schedule {
        TimeSchedule::Weekly => config
            .day_of_week
            .map_or(true, |d| today.weekday().num_days_from_sunday() == d),
        TimeSchedule::Monthly => config.day_of_month.map_or(true, |d| today.day() == d),
        TimeSchedule::Daily | TimeSchedule::Birthday | TimeSchedule::Anniversary => true,
    }
}

/// Birthday and anniversary schedules match on the month and day of a
/// subscriber date, shifted by the offset
fn date_matches(config: &TimeBasedTriggerConfig, subscriber: &Subscriber, today: NaiveDate) -> bool {
    if !matches!(config.schedule, TimeSchedule::Birthday | TimeSchedule::Anniversary) {
        return true;
    }

    let offset = chrono::Duration::days(config.offset_days.unwrap_or(0).clamp(-366, 366));
    let Some(target) = today.checked_add_signed(offset) else {
        return false;
    };

    subscriber
        .date_attribute(config.date_field())
        .is_some_and(|date| date.month() == target.month() && date.day() == target.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryAutomationStore;
    use crate::queue::{
        AutomationJob, ClaimedJob, InMemoryJobQueue, JobFailureOutcome, JobOptions, JobQueue,
        JobRecord, JobState, QueueMetrics,
    };
    use async_trait::async_trait;
    use dripline_core::{NewAutomation, Step, TriggerStatus};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Rejects enqueues while `down` is set
    #[derive(Default)]
    struct FlakyQueue {
        inner: InMemoryJobQueue,
        down: Mutex<bool>,
    }

    #[async_trait]
    impl JobQueue for FlakyQueue {
        async fn enqueue(&self, job: AutomationJob, options: JobOptions) -> Result<Uuid, QueueError> {
            if *self.down.lock() {
                return Err(QueueError::Backend("connection refused".into()));
            }
            self.inner.enqueue(job, options).await
        }

        async fn claim(&self, worker_id: &str, max_jobs: usize) -> Result<Vec<ClaimedJob>, QueueError> {
            self.inner.claim(worker_id, max_jobs).await
        }

        async fn update_progress(&self, job_id: Uuid, progress: u8) -> Result<(), QueueError> {
            self.inner.update_progress(job_id, progress).await
        }

        async fn complete(&self, job_id: Uuid, result: Value) -> Result<(), QueueError> {
            self.inner.complete(job_id, result).await
        }

        async fn fail(&self, job_id: Uuid, error: &str) -> Result<JobFailureOutcome, QueueError> {
            self.inner.fail(job_id, error).await
        }

        async fn get_job(&self, job_id: Uuid) -> Result<JobRecord, QueueError> {
            self.inner.get_job(job_id).await
        }

        async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
            self.inner.metrics().await
        }

        async fn pause(&self) -> Result<(), QueueError> {
            self.inner.pause().await
        }

        async fn resume(&self) -> Result<(), QueueError> {
            self.inner.resume().await
        }

        async fn clean(&self, grace: Duration, state: JobState) -> Result<u64, QueueError> {
            self.inner.clean(grace, state).await
        }

        async fn drain(&self, include_delayed: bool) -> Result<u64, QueueError> {
            self.inner.drain(include_delayed).await
        }

        async fn reclaim_stalled(&self, threshold: Duration) -> Result<Vec<Uuid>, QueueError> {
            self.inner.reclaim_stalled(threshold).await
        }
    }

    struct Fixture {
        store: Arc<InMemoryAutomationStore>,
        queue: Arc<InMemoryJobQueue>,
        evaluator: TriggerEvaluator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryAutomationStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let evaluator = TriggerEvaluator::new(store.clone(), AutomationQueue::new(queue.clone()));
        Fixture {
            store,
            queue,
            evaluator,
        }
    }

    async fn active_automation(
        store: &InMemoryAutomationStore,
        trigger_type: TriggerType,
        config: Value,
    ) -> Automation {
        let mut automation = Automation::from_definition(
            NewAutomation::new("auto", trigger_type, config)
                .with_steps(vec![Step::exit("s1")]),
        );
        assert!(automation.activate());
        store.insert_automation(&automation).await.unwrap();
        automation
    }

    #[tokio::test]
    async fn test_event_trigger_dedupes_pending() {
        let f = fixture();
        let automation = active_automation(
            &f.store,
            TriggerType::Event,
            json!({ "events": ["purchase.made"] }),
        )
        .await;
        let subscriber = Subscriber::new("a@example.com");
        f.store.save_subscriber(&subscriber).await.unwrap();

        let first = f
            .evaluator
            .evaluate_event_trigger("purchase.made", subscriber.id, Map::new())
            .await
            .unwrap();
        let second = f
            .evaluator
            .evaluate_event_trigger("purchase.made", subscriber.id, Map::new())
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(f.store.trigger_count(), 1);
        assert_eq!(first[0].automation_id, automation.id);
        assert_eq!(first[0].trigger_data["event"], "purchase.made");
        assert_eq!(f.queue.metrics().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_event_trigger_filters() {
        let f = fixture();
        active_automation(
            &f.store,
            TriggerType::Event,
            json!({
                "events": ["purchase.made"],
                "conditions": [{ "field": "amount", "operator": "greater_than", "value": 100 }]
            }),
        )
        .await;
        let subscriber = Subscriber::new("a@example.com");
        f.store.save_subscriber(&subscriber).await.unwrap();

        let other_event = f
            .evaluator
            .evaluate_event_trigger("email.opened", subscriber.id, Map::new())
            .await
            .unwrap();
        assert!(other_event.is_empty());

        let small = f
            .evaluator
            .evaluate_event_trigger("purchase.made", subscriber.id, json_map(json!({ "amount": 50 })))
            .await
            .unwrap();
        assert!(small.is_empty());

        let large = f
            .evaluator
            .evaluate_event_trigger("purchase.made", subscriber.id, json_map(json!({ "amount": 150 })))
            .await
            .unwrap();
        assert_eq!(large.len(), 1);
    }

    #[tokio::test]
    async fn test_event_trigger_respects_segment() {
        let f = fixture();
        let mut automation = Automation::from_definition(
            NewAutomation::new("vip", TriggerType::Event, json!({ "events": ["x"] }))
                .with_steps(vec![Step::exit("s1")])
                .with_segment("vip"),
        );
        automation.activate();
        f.store.insert_automation(&automation).await.unwrap();

        let outsider = Subscriber::new("a@example.com");
        let member = Subscriber::new("b@example.com").with_segment("vip");
        f.store.save_subscriber(&outsider).await.unwrap();
        f.store.save_subscriber(&member).await.unwrap();

        assert!(f
            .evaluator
            .evaluate_event_trigger("x", outsider.id, Map::new())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            f.evaluator
                .evaluate_event_trigger("x", member.id, Map::new())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_attribute_trigger_increased() {
        let f = fixture();
        active_automation(
            &f.store,
            TriggerType::Attribute,
            json!({ "attribute": "score", "changeType": "increased" }),
        )
        .await;
        let subscriber = Subscriber::new("a@example.com");
        f.store.save_subscriber(&subscriber).await.unwrap();

        let down = f
            .evaluator
            .evaluate_attribute_trigger(subscriber.id, "score", &json!(10), &json!(5))
            .await
            .unwrap();
        assert!(down.is_empty());

        let up = f
            .evaluator
            .evaluate_attribute_trigger(subscriber.id, "score", &json!(5), &json!(10))
            .await
            .unwrap();
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].trigger_data["newValue"], 10);
    }

    #[tokio::test]
    async fn test_behavior_sweep_inactive_subscribers() {
        let f = fixture();
        active_automation(
            &f.store,
            TriggerType::Behavior,
            json!({ "behaviorType": "inactive_subscriber", "timeWindow": 2880 }),
        )
        .await;

        let now = Utc::now();
        let stale = Subscriber::new("stale@example.com")
            .with_field("lastActivityAt", (now - chrono::Duration::days(5)).to_rfc3339());
        let fresh = Subscriber::new("fresh@example.com")
            .with_field("lastActivityAt", (now - chrono::Duration::hours(1)).to_rfc3339());
        let never = Subscriber::new("never@example.com");
        for s in [&stale, &fresh, &never] {
            f.store.save_subscriber(s).await.unwrap();
        }

        let created = f.evaluator.evaluate_behavior_triggers_at(now).await.unwrap();
        assert_eq!(created, 2);

        let triggers = f.store.list_triggers(&TriggerFilter::default()).await.unwrap();
        assert!(triggers.iter().all(|t| t.subscriber_id != fresh.id));
        assert!(triggers.iter().all(|t| t.trigger_data["inactiveDays"] == 2));
    }

    #[tokio::test]
    async fn test_cart_abandonment_ignores_missing_timestamp() {
        let f = fixture();
        active_automation(
            &f.store,
            TriggerType::Behavior,
            json!({ "behaviorType": "cart_abandonment", "timeWindow": 60 }),
        )
        .await;
        f.store
            .save_subscriber(&Subscriber::new("a@example.com"))
            .await
            .unwrap();

        assert_eq!(f.evaluator.evaluate_behavior_triggers().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_time_sweep_creates_scheduled_triggers_once() {
        let f = fixture();
        active_automation(
            &f.store,
            TriggerType::TimeBased,
            json!({ "schedule": "daily", "time": "10:30" }),
        )
        .await;
        f.store
            .save_subscriber(&Subscriber::new("a@example.com"))
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        assert_eq!(f.evaluator.evaluate_time_based_triggers_at(now).await.unwrap(), 1);
        assert_eq!(f.evaluator.evaluate_time_based_triggers_at(now).await.unwrap(), 0);

        let triggers = f.store.list_triggers(&TriggerFilter::default()).await.unwrap();
        assert_eq!(triggers[0].status, TriggerStatus::Scheduled);
        assert_eq!(
            triggers[0].scheduled_for,
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 10, 30, 0).unwrap())
        );
        assert_eq!(f.queue.metrics().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_weekly_and_birthday_schedules() {
        let f = fixture();
        // 2024-03-05 is a Tuesday
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        active_automation(
            &f.store,
            TriggerType::TimeBased,
            json!({ "schedule": "weekly", "dayOfWeek": 1 }),
        )
        .await;
        active_automation(
            &f.store,
            TriggerType::TimeBased,
            json!({ "schedule": "birthday", "offsetDays": 2 }),
        )
        .await;

        let birthday = Subscriber::new("a@example.com").with_field("birthday", "1990-03-07");
        let other = Subscriber::new("b@example.com").with_field("birthday", "1990-03-05");
        f.store.save_subscriber(&birthday).await.unwrap();
        f.store.save_subscriber(&other).await.unwrap();

        assert_eq!(f.evaluator.evaluate_time_based_triggers_at(now).await.unwrap(), 1);
        let triggers = f.store.list_triggers(&TriggerFilter::default()).await.unwrap();
        assert_eq!(triggers[0].subscriber_id, birthday.id);
    }

    #[tokio::test]
    async fn test_register_existing_subscribers() {
        let f = fixture();
        let automation = active_automation(
            &f.store,
            TriggerType::Event,
            json!({ "events": ["x"] }),
        )
        .await;
        let a = Subscriber::new("a@example.com");
        let b = Subscriber::new("b@example.com");
        let gone = Subscriber::new("c@example.com")
            .with_status(dripline_core::SubscriberStatus::Unsubscribed);
        for s in [&a, &b, &gone] {
            f.store.save_subscriber(s).await.unwrap();
        }
        f.evaluator
            .evaluate_event_trigger("x", a.id, Map::new())
            .await
            .unwrap();

        let registered = f
            .evaluator
            .register_existing_subscribers(&automation)
            .await
            .unwrap();
        assert_eq!(registered, 1);

        let triggers = f
            .store
            .list_triggers(&TriggerFilter {
                subscriber_id: Some(b.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(triggers[0].trigger_data["source"], "existing_subscribers");
    }

    #[tokio::test]
    async fn test_unqueued_trigger_is_failed_not_left_pending() {
        let store = Arc::new(InMemoryAutomationStore::new());
        let jobs = Arc::new(FlakyQueue::default());
        let evaluator = TriggerEvaluator::new(store.clone(), AutomationQueue::new(jobs.clone()));
        let automation = active_automation(&store, TriggerType::Event, json!({ "events": ["x"] })).await;
        let subscriber = Subscriber::new("a@example.com");
        store.save_subscriber(&subscriber).await.unwrap();

        *jobs.down.lock() = true;
        let err = evaluator
            .evaluate_event_trigger("x", subscriber.id, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::Queue(QueueError::Backend(_))));

        let filter = TriggerFilter {
            automation_id: Some(automation.id),
            subscriber_id: Some(subscriber.id),
            status: None,
        };
        let triggers = store.list_triggers(&filter).await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].status, TriggerStatus::Failed);
        assert!(triggers[0].error.as_deref().unwrap().contains("connection refused"));

        // The pair is not blocked once the queue is back
        *jobs.down.lock() = false;
        let created = evaluator
            .evaluate_event_trigger("x", subscriber.id, Map::new())
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(jobs.inner.metrics().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_register_existing_subscribers_fails_unqueued_trigger() {
        let store = Arc::new(InMemoryAutomationStore::new());
        let jobs = Arc::new(FlakyQueue::default());
        let evaluator = TriggerEvaluator::new(store.clone(), AutomationQueue::new(jobs.clone()));
        let automation = active_automation(&store, TriggerType::Event, json!({ "events": ["x"] })).await;
        let subscriber = Subscriber::new("a@example.com");
        store.save_subscriber(&subscriber).await.unwrap();

        *jobs.down.lock() = true;
        assert!(evaluator.register_existing_subscribers(&automation).await.is_err());

        let triggers = store.list_triggers(&TriggerFilter::default()).await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].status, TriggerStatus::Failed);
    }
}

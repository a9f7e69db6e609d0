// Trigger records and typed trigger configuration

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::condition::TriggerCondition;
use crate::validation::ValidationError;

/// Kind of signal that starts an automation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Event,
    Behavior,
    TimeBased,
    Attribute,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Behavior => "behavior",
            Self::TimeBased => "time_based",
            Self::Attribute => "attribute",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Waiting for a worker to start the workflow
    Pending,
    /// Waiting for `scheduled_for` to pass
    Scheduled,
    Fired,
    Skipped,
    Failed,
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Fired => write!(f, "fired"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A signal that matched an automation for one subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub subscriber_id: Uuid,
    pub trigger_type: TriggerType,
    pub status: TriggerStatus,
    #[serde(default)]
    pub trigger_data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    /// A trigger ready to be processed immediately.
    pub fn pending(
        automation_id: Uuid,
        subscriber_id: Uuid,
        trigger_type: TriggerType,
        trigger_data: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            automation_id,
            subscriber_id,
            trigger_type,
            status: TriggerStatus::Pending,
            trigger_data,
            scheduled_for: None,
            fired_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A time-based trigger that becomes pending at `scheduled_for`.
    pub fn scheduled(automation_id: Uuid, subscriber_id: Uuid, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            status: TriggerStatus::Scheduled,
            scheduled_for: Some(scheduled_for),
            ..Self::pending(automation_id, subscriber_id, TriggerType::TimeBased, Map::new())
        }
    }

    pub fn mark_fired(&mut self) {
        let now = Utc::now();
        self.status = TriggerStatus::Fired;
        self.fired_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = TriggerStatus::Skipped;
        self.error = Some(reason.into());
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TriggerStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Scheduled to pending, once due.
    pub fn release(&mut self) {
        self.status = TriggerStatus::Pending;
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Typed trigger configuration
// ============================================================================

/// `triggerConfig` of an `event` automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTriggerConfig {
    /// Event names such as `subscriber.created` or `purchase.made`
    pub events: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,
}

impl EventTriggerConfig {
    pub fn matches_event(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }
}

/// Behavior predicates evaluated by the periodic sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorType {
    InactiveSubscriber,
    CartAbandonment,
    BrowsingPattern,
}

impl BehaviorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InactiveSubscriber => "inactive_subscriber",
            Self::CartAbandonment => "cart_abandonment",
            Self::BrowsingPattern => "browsing_pattern",
        }
    }

    /// Subscriber attribute holding the timestamp this predicate inspects
    pub fn default_activity_field(&self) -> &'static str {
        match self {
            Self::InactiveSubscriber => "lastActivityAt",
            Self::CartAbandonment => "cartUpdatedAt",
            Self::BrowsingPattern => "lastViewedAt",
        }
    }

    /// Whether a subscriber with no recorded timestamp counts as a match
    pub fn matches_missing_activity(&self) -> bool {
        matches!(self, Self::InactiveSubscriber)
    }
}

/// `triggerConfig` of a `behavior` automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorTriggerConfig {
    pub behavior_type: BehaviorType,
    /// Minutes
    pub time_window: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_field: Option<String>,
}

impl BehaviorTriggerConfig {
    pub fn activity_field(&self) -> &str {
        self.activity_field
            .as_deref()
            .unwrap_or_else(|| self.behavior_type.default_activity_field())
    }
}

/// Cadence of a time-based automation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSchedule {
    Daily,
    Weekly,
    Monthly,
    Birthday,
    Anniversary,
}

pub const DEFAULT_TRIGGER_TIME: &str = "09:00";

/// `triggerConfig` of a `time_based` automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBasedTriggerConfig {
    pub schedule: TimeSchedule,
    /// `HH:MM`, UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// 0 = Sunday
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_days: Option<i64>,
}

impl TimeBasedTriggerConfig {
    /// Configured time of day, defaulting to 09:00.
    pub fn time_of_day(&self) -> Result<NaiveTime, ValidationError> {
        let raw = self.time.as_deref().unwrap_or(DEFAULT_TRIGGER_TIME);
        NaiveTime::parse_from_str(raw, "%H:%M").map_err(|_| ValidationError::InvalidTriggerConfig {
            trigger_type: TriggerType::TimeBased.to_string(),
            reason: format!("time must be HH:MM, got '{}'", raw),
        })
    }

    /// Subscriber date attribute compared by the birthday/anniversary schedules.
    pub fn date_field(&self) -> &str {
        match (&self.date_field, self.schedule) {
            (Some(field), _) => field,
            (None, TimeSchedule::Birthday) => "birthday",
            (None, _) => "createdAt",
        }
    }
}

/// How an attribute change is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Any,
    Specific,
    Increased,
    Decreased,
}

/// `triggerConfig` of an `attribute` automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeTriggerConfig {
    pub attribute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub change_type: ChangeType,
}

impl AttributeTriggerConfig {
    /// Whether a change of `attribute` from `old` to `new` fires this trigger.
    pub fn matches(&self, attribute: &str, old: &Value, new: &Value) -> bool {
        if self.attribute != attribute {
            return false;
        }

        match self.change_type {
            ChangeType::Any => old != new,
            ChangeType::Specific => {
                let expected_old = self.old_value.as_ref().unwrap_or(&Value::Null);
                let expected_new = self.new_value.as_ref().unwrap_or(&Value::Null);
                old == expected_old && new == expected_new
            }
            ChangeType::Increased => matches!((old.as_f64(), new.as_f64()), (Some(o), Some(n)) if n > o),
            ChangeType::Decreased => matches!((old.as_f64(), new.as_f64()), (Some(o), Some(n)) if n < o),
        }
    }
}

/// Parsed `triggerConfig` of an automation
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerConfig {
    Event(EventTriggerConfig),
    Behavior(BehaviorTriggerConfig),
    TimeBased(TimeBasedTriggerConfig),
    Attribute(AttributeTriggerConfig),
}

impl TriggerConfig {
    /// Parse the opaque config map for the given trigger type.
    pub fn parse(trigger_type: TriggerType, config: &Value) -> Result<Self, ValidationError> {
        let invalid = |e: serde_json::Error| ValidationError::InvalidTriggerConfig {
            trigger_type: trigger_type.to_string(),
            reason: e.to_string(),
        };

        let parsed = match trigger_type {
            TriggerType::Event => Self::Event(serde_json::from_value(config.clone()).map_err(invalid)?),
            TriggerType::Behavior => {
                Self::Behavior(serde_json::from_value(config.clone()).map_err(invalid)?)
            }
            TriggerType::TimeBased => {
                let typed: TimeBasedTriggerConfig =
                    serde_json::from_value(config.clone()).map_err(invalid)?;
                typed.time_of_day()?;
                Self::TimeBased(typed)
            }
            TriggerType::Attribute => {
                Self::Attribute(serde_json::from_value(config.clone()).map_err(invalid)?)
            }
        };

        Ok(parsed)
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Event(_) => TriggerType::Event,
            Self::Behavior(_) => TriggerType::Behavior,
            Self::TimeBased(_) => TriggerType::TimeBased,
            Self::Attribute(_) => TriggerType::Attribute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_event_config() {
        let config = TriggerConfig::parse(
            TriggerType::Event,
            &json!({
                "events": ["purchase.made"],
                "conditions": [{ "field": "total", "operator": "greater_than", "value": 50 }]
            }),
        )
        .unwrap();

        match config {
            TriggerConfig::Event(event) => {
                assert!(event.matches_event("purchase.made"));
                assert!(!event.matches_event("email.opened"));
                assert_eq!(event.conditions.len(), 1);
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        let err = TriggerConfig::parse(TriggerType::Behavior, &json!({ "events": [] })).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTriggerConfig { .. }));
    }

    #[test]
    fn test_time_based_defaults() {
        let config: TimeBasedTriggerConfig =
            serde_json::from_value(json!({ "schedule": "birthday" })).unwrap();
        assert_eq!(config.time_of_day().unwrap(), NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(config.date_field(), "birthday");

        let anniversary: TimeBasedTriggerConfig =
            serde_json::from_value(json!({ "schedule": "anniversary", "time": "18:30" })).unwrap();
        assert_eq!(anniversary.date_field(), "createdAt");
        assert_eq!(
            anniversary.time_of_day().unwrap(),
            NaiveTime::from_hms_opt(18, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_time_based_rejects_bad_time() {
        let err = TriggerConfig::parse(
            TriggerType::TimeBased,
            &json!({ "schedule": "daily", "time": "25:99" }),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTriggerConfig { .. }));
    }

    #[test]
    fn test_behavior_activity_field() {
        let config: BehaviorTriggerConfig = serde_json::from_value(json!({
            "behaviorType": "cart_abandonment",
            "timeWindow": 120
        }))
        .unwrap();
        assert_eq!(config.activity_field(), "cartUpdatedAt");
        assert!(!config.behavior_type.matches_missing_activity());
    }

    #[test]
    fn test_attribute_change_types() {
        let any = AttributeTriggerConfig {
            attribute: "plan".into(),
            old_value: None,
            new_value: None,
            change_type: ChangeType::Any,
        };
        assert!(any.matches("plan", &json!("free"), &json!("pro")));
        assert!(!any.matches("plan", &json!("pro"), &json!("pro")));
        assert!(!any.matches("tier", &json!("free"), &json!("pro")));

        let specific = AttributeTriggerConfig {
            old_value: Some(json!("free")),
            new_value: Some(json!("pro")),
            change_type: ChangeType::Specific,
            ..any.clone()
        };
        assert!(specific.matches("plan", &json!("free"), &json!("pro")));
        assert!(!specific.matches("plan", &json!("trial"), &json!("pro")));

        let increased = AttributeTriggerConfig {
            attribute: "score".into(),
            change_type: ChangeType::Increased,
            ..any.clone()
        };
        assert!(increased.matches("score", &json!(10), &json!(20)));
        assert!(!increased.matches("score", &json!("10"), &json!(20)));

        let decreased = AttributeTriggerConfig {
            change_type: ChangeType::Decreased,
            ..increased
        };
        assert!(decreased.matches("score", &json!(20), &json!(10)));
    }

    #[test]
    fn test_trigger_transitions() {
        let mut trigger = Trigger::scheduled(Uuid::now_v7(), Uuid::now_v7(), Utc::now());
        assert_eq!(trigger.status, TriggerStatus::Scheduled);
        assert_eq!(trigger.trigger_type, TriggerType::TimeBased);

        trigger.release();
        assert_eq!(trigger.status, TriggerStatus::Pending);

        trigger.mark_fired();
        assert_eq!(trigger.status, TriggerStatus::Fired);
        assert!(trigger.fired_at.is_some());
    }
}

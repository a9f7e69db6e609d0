// Automation definition
//
// An automation owns its workflow steps (embedded arena, addressed by id),
// its trigger configuration and rolling run statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::{Execution, ExecutionStatus};
use crate::step::{self, Branch, Step};
use crate::trigger::{TriggerConfig, TriggerType};
use crate::validation::{validate_steps, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Archived,
}

impl std::fmt::Display for AutomationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

/// Rolling statistics, recomputed whenever an execution terminates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationStats {
    pub execution_count: u64,
    /// Percent of terminal executions that completed
    pub success_rate: f64,
    /// Milliseconds
    pub avg_execution_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl AutomationStats {
    /// Statistics over the terminal executions in `executions`, stamped now
    pub fn from_executions(executions: &[Execution]) -> Self {
        let terminal: Vec<&Execution> = executions.iter().filter(|e| e.is_terminal()).collect();
        let count = terminal.len();
        let completed = terminal
            .iter()
            .filter(|e| e.status == ExecutionStatus::Completed)
            .count();
        let total_time: i64 = terminal.iter().map(|e| e.execution_time.unwrap_or(0)).sum();

        let (success_rate, avg_execution_time) = if count > 0 {
            (
                completed as f64 / count as f64 * 100.0,
                (total_time as f64 / count as f64).round() as i64,
            )
        } else {
            (0.0, 0)
        };

        Self {
            execution_count: count as u64,
            success_rate,
            avg_execution_time,
            last_executed_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Automation {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: AutomationStatus,
    pub trigger_type: TriggerType,
    /// Opaque map; see [`TriggerConfig`] for the typed view
    #[serde(default)]
    pub trigger_config: Value,
    pub steps: Vec<Step>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub stats: AutomationStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Definition submitted to create an automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAutomation {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Value,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub segment_id: Option<String>,
}

impl NewAutomation {
    pub fn new(name: impl Into<String>, trigger_type: TriggerType, trigger_config: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            trigger_type,
            trigger_config,
            steps: vec![],
            segment_id: None,
        }
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_segment(mut self, segment_id: impl Into<String>) -> Self {
        self.segment_id = Some(segment_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validate steps and trigger configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_steps(&self.steps)?;
        TriggerConfig::parse(self.trigger_type, &self.trigger_config)?;
        Ok(())
    }
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger_config: Option<Value>,
    #[serde(default)]
    pub steps: Option<Vec<Step>>,
    #[serde(default)]
    pub segment_id: Option<String>,
}

impl Automation {
    /// Build a draft automation from a definition. Does not validate.
    pub fn from_definition(def: NewAutomation) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: def.name,
            description: def.description,
            status: AutomationStatus::Draft,
            trigger_type: def.trigger_type,
            trigger_config: def.trigger_config,
            steps: def.steps,
            is_active: false,
            segment_id: def.segment_id,
            stats: AutomationStats::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn can_be_activated(&self) -> bool {
        matches!(self.status, AutomationStatus::Draft | AutomationStatus::Paused)
            && !self.steps.is_empty()
    }

    /// Returns false when the automation cannot be activated from its
    /// current state.
    pub fn activate(&mut self) -> bool {
        if !self.can_be_activated() {
            return false;
        }
        self.status = AutomationStatus::Active;
        self.is_active = true;
        self.updated_at = Utc::now();
        true
    }

    /// Only active automations can be paused.
    pub fn pause(&mut self) -> bool {
        if self.status != AutomationStatus::Active {
            return false;
        }
        self.status = AutomationStatus::Paused;
        self.is_active = false;
        self.updated_at = Utc::now();
        true
    }

    pub fn archive(&mut self) {
        self.status = AutomationStatus::Archived;
        self.is_active = false;
        self.updated_at = Utc::now();
    }

    pub fn soft_delete(&mut self) {
        let now = Utc::now();
        self.deleted_at = Some(now);
        self.updated_at = now;
    }

    /// Typed view of `trigger_config`.
    pub fn trigger(&self) -> Result<TriggerConfig, ValidationError> {
        TriggerConfig::parse(self.trigger_type, &self.trigger_config)
    }

    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }

    pub fn step_by_id(&self, id: &str) -> Option<&Step> {
        step::find_step(&self.steps, id)
    }

    pub fn next_step(&self, current_step_id: &str, branch: Branch) -> Option<&Step> {
        step::next_step(&self.steps, current_step_id, branch)
    }

    /// Recompute rolling statistics from the automation's executions.
    /// Executions that have not terminated are ignored.
    pub fn update_statistics(&mut self, executions: &[Execution]) {
        self.stats = AutomationStats::from_executions(executions);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn automation() -> Automation {
        Automation::from_definition(
            NewAutomation::new(
                "Welcome series",
                TriggerType::Event,
                json!({ "events": ["subscriber.created"] }),
            )
            .with_steps(vec![
                Step::send_message("s1", "Welcome").then("s2"),
                Step::exit("s2"),
            ]),
        )
    }

    #[test]
    fn test_lifecycle() {
        let mut auto = automation();
        assert_eq!(auto.status, AutomationStatus::Draft);
        assert!(!auto.is_active);

        assert!(auto.activate());
        assert_eq!(auto.status, AutomationStatus::Active);
        assert!(auto.is_active);
        assert!(!auto.activate());

        assert!(auto.pause());
        assert_eq!(auto.status, AutomationStatus::Paused);
        assert!(!auto.is_active);
        assert!(!auto.pause());

        assert!(auto.activate());
        auto.archive();
        assert_eq!(auto.status, AutomationStatus::Archived);
        assert!(!auto.is_active);
        assert!(!auto.can_be_activated());
    }

    #[test]
    fn test_cannot_activate_without_steps() {
        let mut auto = automation();
        auto.steps.clear();
        assert!(!auto.activate());
    }

    #[test]
    fn test_step_navigation() {
        let auto = automation();
        assert_eq!(auto.first_step().unwrap().id, "s1");
        assert_eq!(auto.next_step("s1", Branch::Default).unwrap().id, "s2");
        assert!(auto.next_step("s2", Branch::Default).is_none());
        assert!(auto.step_by_id("nope").is_none());
    }

    #[test]
    fn test_update_statistics() {
        let mut auto = automation();
        let mut ok = Execution::new(auto.id, Uuid::now_v7(), None);
        ok.status = ExecutionStatus::Completed;
        ok.execution_time = Some(100);
        let mut bad = Execution::new(auto.id, Uuid::now_v7(), None);
        bad.status = ExecutionStatus::Failed;
        bad.execution_time = Some(301);
        let running = Execution::new(auto.id, Uuid::now_v7(), None);

        auto.update_statistics(&[ok, bad, running]);

        assert_eq!(auto.stats.execution_count, 2);
        assert_eq!(auto.stats.success_rate, 50.0);
        assert_eq!(auto.stats.avg_execution_time, 201);
        assert!(auto.stats.last_executed_at.is_some());
    }

    #[test]
    fn test_definition_validation() {
        let def = NewAutomation::new("Bad", TriggerType::Event, json!({ "events": [] }));
        assert_eq!(def.validate(), Err(ValidationError::EmptyWorkflow));

        let bad_trigger = NewAutomation::new("Bad", TriggerType::Attribute, json!({}))
            .with_steps(vec![Step::exit("end")]);
        assert!(matches!(
            bad_trigger.validate(),
            Err(ValidationError::InvalidTriggerConfig { .. })
        ));
    }
}

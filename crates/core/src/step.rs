// Workflow step types
//
// Steps are stored as a flat arena inside an Automation and address each other
// by string id. Nothing here holds references between steps, so cyclic graphs
// are representable and persistence is a plain JSON array.

use serde::{Deserialize, Serialize};

/// Discriminant of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SendMessage,
    Delay,
    Condition,
    Split,
    Exit,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::SendMessage => "send_message",
            StepType::Delay => "delay",
            StepType::Condition => "condition",
            StepType::Split => "split",
            StepType::Exit => "exit",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of a `send_message` step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
}

/// Configuration of a `delay` step. Duration is in minutes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl DelayConfig {
    /// Positive duration in minutes, if configured.
    pub fn minutes(&self) -> Option<f64> {
        self.duration.filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// Configuration of a `condition` step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Expression of the form `<field> <operator> <value>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Configuration of a `split` step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitConfig {
    #[serde(default)]
    pub split_percentages: Vec<f64>,
}

/// Type-specific step behaviour.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    SendMessage(SendMessageConfig),
    Delay(DelayConfig),
    Condition(ConditionConfig),
    Split(SplitConfig),
    Exit,
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::SendMessage(_) => StepType::SendMessage,
            StepKind::Delay(_) => StepType::Delay,
            StepKind::Condition(_) => StepType::Condition,
            StepKind::Split(_) => StepType::Split,
            StepKind::Exit => StepType::Exit,
        }
    }
}

/// One outgoing edge of a branching step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalPath {
    /// `"true"`/`"false"` for condition steps; a free label for split paths.
    pub condition: String,
    pub next_step_id: String,
}

/// Outcome of a step that decides which edge the workflow follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Follow `next_step_id`.
    Default,
    /// Follow the conditional path labelled `"true"` or `"false"`.
    Condition(bool),
    /// Follow the conditional path at this index.
    Split(usize),
}

/// A node in an automation's workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    pub next_step_id: Option<String>,
    pub conditional_paths: Vec<ConditionalPath>,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            next_step_id: None,
            conditional_paths: vec![],
        }
    }

    /// A `send_message` step with an inline subject.
    pub fn send_message(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::SendMessage(SendMessageConfig {
                subject: Some(subject.into()),
                ..Default::default()
            }),
        )
    }

    /// A `send_message` step rendering a stored template.
    pub fn send_template(id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::SendMessage(SendMessageConfig {
                template_id: Some(template_id.into()),
                ..Default::default()
            }),
        )
    }

    pub fn delay(id: impl Into<String>, minutes: f64) -> Self {
        Self::new(
            id,
            StepKind::Delay(DelayConfig {
                duration: Some(minutes),
            }),
        )
    }

    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Condition(ConditionConfig {
                condition: Some(expression.into()),
            }),
        )
    }

    pub fn split(id: impl Into<String>, split_percentages: Vec<f64>) -> Self {
        Self::new(id, StepKind::Split(SplitConfig { split_percentages }))
    }

    pub fn exit(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Exit)
    }

    /// Set the default successor.
    pub fn then(mut self, next_step_id: impl Into<String>) -> Self {
        self.next_step_id = Some(next_step_id.into());
        self
    }

    /// Append a conditional path.
    pub fn with_path(
        mut self,
        condition: impl Into<String>,
        next_step_id: impl Into<String>,
    ) -> Self {
        self.conditional_paths.push(ConditionalPath {
            condition: condition.into(),
            next_step_id: next_step_id.into(),
        });
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, StepKind::Exit)
    }

    /// Every step id this step can transition to.
    pub fn successors(&self) -> impl Iterator<Item = &str> {
        self.next_step_id
            .as_deref()
            .into_iter()
            .chain(self.conditional_paths.iter().map(|p| p.next_step_id.as_str()))
    }
}

/// Find a step by id.
pub fn find_step<'a>(steps: &'a [Step], id: &str) -> Option<&'a Step> {
    steps.iter().find(|s| s.id == id)
}

/// Resolve the step that follows `current_id` given the branch it took.
///
/// Condition steps follow the path whose label matches the boolean result;
/// split steps follow the selected path index and fall back to `next_step_id`
/// when the index has no path. Every other step follows `next_step_id`.
pub fn next_step<'a>(steps: &'a [Step], current_id: &str, branch: Branch) -> Option<&'a Step> {
    let current = find_step(steps, current_id)?;

    let target = match (&current.kind, branch) {
        (StepKind::Condition(_), Branch::Condition(result)) => {
            let label = if result { "true" } else { "false" };
            current
                .conditional_paths
                .iter()
                .find(|p| p.condition == label)
                .map(|p| p.next_step_id.as_str())
        }
        (StepKind::Split(_), Branch::Split(index)) => current
            .conditional_paths
            .get(index)
            .map(|p| p.next_step_id.as_str())
            .or(current.next_step_id.as_deref()),
        _ => current.next_step_id.as_deref(),
    }?;

    find_step(steps, target)
}

/// Wire representation: `{ id, type, config, nextStepId?, conditionalPaths? }`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    id: String,
    #[serde(rename = "type")]
    step_type: StepType,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    conditional_paths: Vec<ConditionalPath>,
}

impl TryFrom<RawStep> for Step {
    type Error = serde_json::Error;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let config = match raw.config {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };

        let kind = match raw.step_type {
            StepType::SendMessage => StepKind::SendMessage(serde_json::from_value(config)?),
            StepType::Delay => StepKind::Delay(serde_json::from_value(config)?),
            StepType::Condition => StepKind::Condition(serde_json::from_value(config)?),
            StepType::Split => StepKind::Split(serde_json::from_value(config)?),
            StepType::Exit => StepKind::Exit,
        };

        Ok(Step {
            id: raw.id,
            kind,
            next_step_id: raw.next_step_id,
            conditional_paths: raw.conditional_paths,
        })
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        let step_type = step.step_type();
        let config = match step.kind {
            StepKind::SendMessage(c) => serde_json::to_value(c),
            StepKind::Delay(c) => serde_json::to_value(c),
            StepKind::Condition(c) => serde_json::to_value(c),
            StepKind::Split(c) => serde_json::to_value(c),
            StepKind::Exit => Ok(serde_json::Value::Object(Default::default())),
        }
        .unwrap_or_default();

        RawStep {
            id: step.id,
            step_type,
            config,
            next_step_id: step.next_step_id,
            conditional_paths: step.conditional_paths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn branching_steps() -> Vec<Step> {
        vec![
            Step::condition("check", "status equals active")
                .with_path("true", "sA")
                .with_path("false", "sB"),
            Step::send_message("sA", "Welcome back").then("done"),
            Step::send_message("sB", "We miss you").then("done"),
            Step::exit("done"),
        ]
    }

    #[test]
    fn test_deserialize_wire_format() {
        let step: Step = serde_json::from_value(json!({
            "id": "wait",
            "type": "delay",
            "config": { "duration": 60 },
            "nextStepId": "s3"
        }))
        .unwrap();

        assert_eq!(step.step_type(), StepType::Delay);
        assert_eq!(step.next_step_id.as_deref(), Some("s3"));
        match step.kind {
            StepKind::Delay(config) => assert_eq!(config.minutes(), Some(60.0)),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let result: Result<Step, _> = serde_json::from_value(json!({
            "id": "s1",
            "type": "send_sms",
            "config": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_exit_without_config() {
        let step: Step = serde_json::from_value(json!({ "id": "end", "type": "exit" })).unwrap();
        assert!(step.is_exit());
    }

    #[test]
    fn test_serialize_uses_type_and_config() {
        let value = serde_json::to_value(Step::split("ab", vec![30.0, 70.0])).unwrap();
        assert_eq!(value["type"], "split");
        assert_eq!(value["config"]["splitPercentages"], json!([30.0, 70.0]));
        assert!(value.get("nextStepId").is_none());
    }

    #[test]
    fn test_next_step_condition_paths() {
        let steps = branching_steps();

        let yes = next_step(&steps, "check", Branch::Condition(true)).unwrap();
        assert_eq!(yes.id, "sA");

        let no = next_step(&steps, "check", Branch::Condition(false)).unwrap();
        assert_eq!(no.id, "sB");
    }

    #[test]
    fn test_next_step_follows_default_edge() {
        let steps = branching_steps();
        let next = next_step(&steps, "sA", Branch::Default).unwrap();
        assert_eq!(next.id, "done");
        assert!(next_step(&steps, "done", Branch::Default).is_none());
    }

    #[test]
    fn test_next_step_split_index() {
        let steps = vec![
            Step::split("ab", vec![50.0, 50.0])
                .with_path("a", "left")
                .with_path("b", "right"),
            Step::exit("left"),
            Step::exit("right"),
        ];

        assert_eq!(next_step(&steps, "ab", Branch::Split(1)).unwrap().id, "right");
        assert!(next_step(&steps, "ab", Branch::Split(5)).is_none());
    }

    #[test]
    fn test_successors() {
        let step = Step::condition("c", "x equals y")
            .then("fallback")
            .with_path("true", "a")
            .with_path("false", "b");
        let ids: Vec<_> = step.successors().collect();
        assert_eq!(ids, vec!["fallback", "a", "b"]);
    }
}

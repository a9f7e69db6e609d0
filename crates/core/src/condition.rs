// Condition evaluation
//
// Two flavours share one operator set:
// - StepCondition: the `<field> <operator> <value>` string carried by
//   condition steps, compared against subscriber attributes as text/numbers.
// - TriggerCondition: structured `{field, operator, value}` entries in event
//   trigger configs, compared against event data first, then the subscriber.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::subscriber::Subscriber;

/// Error raised when a condition expression cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("invalid condition format: expected '<field> <operator> <value>', got '{0}'")]
    InvalidFormat(String),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
        }
    }
}

impl FromStr for ConditionOperator {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(Self::Equals),
            "not_equals" => Ok(Self::NotEquals),
            "contains" => Ok(Self::Contains),
            "greater_than" => Ok(Self::GreaterThan),
            "less_than" => Ok(Self::LessThan),
            other => Err(ConditionError::UnknownOperator(other.to_string())),
        }
    }
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `<field> <operator> <value>` expression of a condition step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: String,
}

impl StepCondition {
    /// Parse an expression. Exactly three space-separated tokens are required.
    pub fn parse(expression: &str) -> Result<Self, ConditionError> {
        let parts: Vec<&str> = expression.split(' ').collect();
        let [field, operator, value] = parts.as_slice() else {
            return Err(ConditionError::InvalidFormat(expression.to_string()));
        };
        if field.is_empty() || value.is_empty() {
            return Err(ConditionError::InvalidFormat(expression.to_string()));
        }

        Ok(Self {
            field: field.to_string(),
            operator: operator.parse()?,
            value: value.to_string(),
        })
    }

    /// Evaluate against a subscriber. A missing attribute only satisfies
    /// `not_equals`.
    pub fn evaluate(&self, subscriber: &Subscriber) -> bool {
        let actual = subscriber.attribute(&self.field).map(|v| value_as_text(&v));

        match self.operator {
            ConditionOperator::Equals => actual.as_deref() == Some(self.value.as_str()),
            ConditionOperator::NotEquals => actual.as_deref() != Some(self.value.as_str()),
            ConditionOperator::Contains => actual.is_some_and(|a| a.contains(&self.value)),
            ConditionOperator::GreaterThan => compare_numbers(actual.as_deref(), &self.value)
                .is_some_and(|(a, b)| a > b),
            ConditionOperator::LessThan => compare_numbers(actual.as_deref(), &self.value)
                .is_some_and(|(a, b)| a < b),
        }
    }
}

impl FromStr for StepCondition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for StepCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// Structured condition from an event trigger config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl TriggerCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Evaluate against event data, falling back to the subscriber when the
    /// event does not carry the field. Ordering operators require numbers on
    /// both sides.
    pub fn evaluate(&self, event_data: &Map<String, Value>, subscriber: &Subscriber) -> bool {
        let actual = event_data
            .get(&self.field)
            .filter(|v| !v.is_null())
            .cloned()
            .or_else(|| subscriber.attribute(&self.field));

        match self.operator {
            ConditionOperator::Equals => actual.as_ref() == Some(&self.value),
            ConditionOperator::NotEquals => actual.as_ref() != Some(&self.value),
            ConditionOperator::Contains => match (actual.as_ref(), &self.value) {
                (Some(Value::String(a)), Value::String(needle)) => a.contains(needle.as_str()),
                _ => false,
            },
            ConditionOperator::GreaterThan => {
                numeric_pair(actual.as_ref(), &self.value).is_some_and(|(a, b)| a > b)
            }
            ConditionOperator::LessThan => {
                numeric_pair(actual.as_ref(), &self.value).is_some_and(|(a, b)| a < b)
            }
        }
    }
}

/// Evaluate every condition; an empty list always matches.
pub fn all_match(
    conditions: &[TriggerCondition],
    event_data: &Map<String, Value>,
    subscriber: &Subscriber,
) -> bool {
    conditions.iter().all(|c| c.evaluate(event_data, subscriber))
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare_numbers(actual: Option<&str>, expected: &str) -> Option<(f64, f64)> {
    let a = actual?.trim().parse::<f64>().ok()?;
    let b = expected.trim().parse::<f64>().ok()?;
    Some((a, b))
}

fn numeric_pair(actual: Option<&Value>, expected: &Value) -> Option<(f64, f64)> {
    Some((actual?.as_f64()?, expected.as_f64()?))
}

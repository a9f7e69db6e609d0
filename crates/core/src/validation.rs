// Workflow definition validation
//
// Runs on create and on update of inactive automations. Nothing that fails
// here is ever persisted.

use std::collections::HashSet;

use crate::condition::{ConditionError, StepCondition};
use crate::step::{Step, StepKind};

/// Definition error raised while validating a workflow
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("workflow must have at least one step")]
    EmptyWorkflow,

    #[error("workflow steps must have unique ids (duplicate: {0})")]
    DuplicateStepId(String),

    #[error("step {step_id}: invalid nextStepId reference: {target}")]
    UnknownNextStep { step_id: String, target: String },

    #[error("step {step_id}: invalid conditional path nextStepId: {target}")]
    UnknownPathTarget { step_id: String, target: String },

    #[error("send_message step {0} requires templateId or subject")]
    MissingMessageContent(String),

    #[error("delay step {0} requires a positive duration in minutes")]
    InvalidDelay(String),

    #[error("condition step {0} requires a condition expression")]
    MissingCondition(String),

    #[error("condition step {step_id}: {source}")]
    InvalidCondition {
        step_id: String,
        #[source]
        source: ConditionError,
    },

    #[error("condition step {0} requires at least one conditional path")]
    MissingConditionalPaths(String),

    #[error("split step {step_id} requires at least 2 conditional paths, got {paths}")]
    InsufficientSplitPaths { step_id: String, paths: usize },

    #[error("split step {0} requires non-negative splitPercentages")]
    InvalidSplitPercentages(String),

    #[error("invalid {trigger_type} trigger configuration: {reason}")]
    InvalidTriggerConfig {
        trigger_type: String,
        reason: String,
    },
}

/// Validate a workflow step list.
pub fn validate_steps(steps: &[Step]) -> Result<(), ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut ids = HashSet::with_capacity(steps.len());
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in steps {
        if let Some(target) = &step.next_step_id {
            if !ids.contains(target.as_str()) {
                return Err(ValidationError::UnknownNextStep {
                    step_id: step.id.clone(),
                    target: target.clone(),
                });
            }
        }

        for path in &step.conditional_paths {
            if !ids.contains(path.next_step_id.as_str()) {
                return Err(ValidationError::UnknownPathTarget {
                    step_id: step.id.clone(),
                    target: path.next_step_id.clone(),
                });
            }
        }

        validate_step_config(step)?;
    }

    Ok(())
}

fn validate_step_config(step: &Step) -> Result<(), ValidationError> {
    match &step.kind {
        StepKind::SendMessage(config) => {
            let has_template = config.template_id.as_deref().is_some_and(|t| !t.is_empty());
            let has_subject = config.subject.as_deref().is_some_and(|s| !s.is_empty());
            if !has_template && !has_subject {
                return Err(ValidationError::MissingMessageContent(step.id.clone()));
            }
        }
        StepKind::Delay(config) => {
            if config.minutes().is_none() {
                return Err(ValidationError::InvalidDelay(step.id.clone()));
            }
        }
        StepKind::Condition(config) => {
            let expression = config
                .condition
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| ValidationError::MissingCondition(step.id.clone()))?;

            StepCondition::parse(expression).map_err(|source| {
                ValidationError::InvalidCondition {
                    step_id: step.id.clone(),
                    source,
                }
            })?;

            if step.conditional_paths.is_empty() {
                return Err(ValidationError::MissingConditionalPaths(step.id.clone()));
            }
        }
        StepKind::Split(config) => {
            if step.conditional_paths.len() < 2 {
                return Err(ValidationError::InsufficientSplitPaths {
                    step_id: step.id.clone(),
                    paths: step.conditional_paths.len(),
                });
            }
            let valid = !config.split_percentages.is_empty()
                && config
                    .split_percentages
                    .iter()
                    .all(|p| p.is_finite() && *p >= 0.0);
            if !valid {
                return Err(ValidationError::InvalidSplitPercentages(step.id.clone()));
            }
        }
        StepKind::Exit => {}
    }

    Ok(())
}

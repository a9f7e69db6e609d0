// Automation Domain Model
//
// This crate defines the I/O-free building blocks of the automation engine:
// workflow definitions, run records and trigger configuration.
//
// Key design decisions:
// - Steps live in a flat arena inside the Automation and reference each other
//   by id, so cyclic graphs are representable and persistence is trivial
// - Step kinds are a closed enum; unknown types fail at deserialization
// - Schedules point at their Execution directly instead of being re-matched
//   by (automation, subscriber)
// - Trigger configuration stays opaque on the Automation and is parsed into
//   typed configs on demand

pub mod automation;
pub mod condition;
pub mod execution;
pub mod schedule;
pub mod step;
pub mod subscriber;
pub mod trigger;
pub mod validation;

// Re-exports for convenience
pub use automation::{Automation, AutomationStats, AutomationStatus, AutomationUpdate, NewAutomation};
pub use condition::{all_match, ConditionError, ConditionOperator, StepCondition, TriggerCondition};
pub use execution::{Execution, ExecutionStatus, StepResult, StepStatus};
pub use schedule::{Schedule, ScheduleStatus};
pub use step::{
    Branch, ConditionConfig, ConditionalPath, DelayConfig, SendMessageConfig, SplitConfig, Step,
    StepKind, StepType,
};
pub use subscriber::{Subscriber, SubscriberStatus};
pub use trigger::{
    AttributeTriggerConfig, BehaviorTriggerConfig, BehaviorType, ChangeType, EventTriggerConfig,
    TimeBasedTriggerConfig, TimeSchedule, Trigger, TriggerConfig, TriggerStatus, TriggerType,
};
pub use validation::{validate_steps, ValidationError};

//! Automation engine
//!
//! The engine module provides:
//! - [`WorkflowExecutor`] - the step state machine for one execution
//! - [`TriggerEvaluator`] - matches signals to automations and records triggers
//! - [`Scheduler`] - resumes parked executions when their schedule is due
//! - [`AutomationService`] - administrative operations over automations
//! - [`AutomationJobHandler`] - routes queue jobs to the pieces above

mod collaborators;
mod dispatch;
mod executor;
mod scheduler;
mod service;
mod triggers;

pub use collaborators::{
    LoggingMessageSender, MessageSender, OutgoingMessage, RandomSource, SegmentResolver,
    SendError, SentMessage, SubscriberSegments, ThreadRandom,
};
pub use dispatch::AutomationJobHandler;
pub use executor::{
    select_split_path, ExecutorConfig, ExecutorError, StepOutcome, WorkflowExecutor,
    MAX_STEPS_PER_EXECUTION,
};
pub use scheduler::{
    ResumeOutcome, Scheduler, SchedulerConfig, SchedulerError, SweepDispatch, SweepReport,
};
pub use service::{
    AutomationAnalytics, AutomationService, DateRange, ExecutionPage, ExecutionQuery,
    ServiceError, SimulatedStep, StepPerformance, TestRun, TimelineEntry,
};
pub use triggers::{TriggerError, TriggerEvaluator};

//! Job queue for automation work
//!
//! This module provides:
//! - [`AutomationJob`] payloads for the four job kinds
//! - [`JobQueue`] trait, a priority- and delay-aware queue with retry/backoff
//! - [`InMemoryJobQueue`] for tests and single-process deployments
//! - [`AutomationQueue`] typed helpers that pick per-job options

mod automation;
mod backend;
mod job;
mod memory;

pub use automation::{delay_until, trigger_context, AutomationQueue};
pub use backend::{JobQueue, QueueError};
pub use job::{
    AutomationJob, ClaimedJob, ExecuteAutomationJob, JobFailureOutcome, JobOptions, JobPriority,
    JobRecord, JobState, ProcessScheduledStepJob, ProcessTriggerJob, QueueMetrics,
    RetentionPolicy, RetryFailedStepJob,
};
pub use memory::{InMemoryJobQueue, QueueConfig};

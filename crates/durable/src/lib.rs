//! # Durable Automation Engine
//!
//! Runs automation workflows for subscribers on top of a pluggable store and
//! job queue.
//!
//! ## Features
//!
//! - **Step state machine**: send, delay, condition, split and exit steps
//!   driven one at a time with a hard step limit
//! - **Suspend and resume**: a delay parks the execution behind a persisted
//!   schedule; any process can resume it later
//! - **Triggers**: event, behavior, time-based and attribute signals, with at
//!   most one pending trigger per automation and subscriber
//! - **Job queue**: priorities, delays, exponential backoff and retention
//! - **Worker pool**: concurrent jobs with timeouts and lifecycle events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │     TriggerEvaluator             AutomationService          │
//! │  (signals -> triggers)        (create/activate/pause/...)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ jobs
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                JobQueue  ──►  WorkerPool                     │
//! │            (AutomationJobHandler routes each job)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │    WorkflowExecutor  ◄── resume ──  Scheduler (sweeps)       │
//! │        (steps, schedules, results in AutomationStore)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dripline_durable::prelude::*;
//! use dripline_durable::queue::InMemoryJobQueue;
//! use dripline_durable::InMemoryAutomationStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryAutomationStore::new());
//! let queue = AutomationQueue::new(Arc::new(InMemoryJobQueue::new()));
//!
//! let executor = Arc::new(WorkflowExecutor::new(store.clone()));
//! let triggers = Arc::new(TriggerEvaluator::new(store.clone(), queue.clone()));
//! let service = AutomationService::new(store.clone(), executor, triggers, queue);
//!
//! let automation = service
//!     .create(
//!         NewAutomation::new(
//!             "Welcome",
//!             TriggerType::Event,
//!             serde_json::json!({ "events": ["subscriber.created"] }),
//!         )
//!         .with_steps(vec![Step::send_message("s1", "Welcome!").then("s2"), Step::exit("s2")]),
//!     )
//!     .await?;
//! service.activate(automation.id, false).await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        AutomationJobHandler, AutomationService, ExecutorConfig, ExecutorError, Scheduler,
        SchedulerConfig, ServiceError, TriggerEvaluator, WorkflowExecutor,
    };
    pub use crate::persistence::{AutomationStore, StoreError};
    pub use crate::queue::{AutomationQueue, JobOptions, JobPriority, JobQueue, QueueError};
    pub use crate::worker::{JobHandler, WorkerEvent, WorkerPool, WorkerPoolConfig};
    pub use dripline_core::{
        Automation, Execution, ExecutionStatus, NewAutomation, Step, Subscriber, Trigger,
        TriggerType,
    };
}

// Re-export key types at crate root
pub use engine::{
    AutomationJobHandler, AutomationService, ExecutorConfig, ExecutorError, Scheduler,
    SchedulerConfig, SchedulerError, ServiceError, TriggerError, TriggerEvaluator,
    WorkflowExecutor,
};
pub use persistence::{AutomationStore, InMemoryAutomationStore, StoreError};
pub use queue::{AutomationQueue, JobQueue, QueueError};
pub use reliability::{Backoff, BackoffKind};
pub use worker::{JobError, JobHandler, WorkerEvent, WorkerPool, WorkerPoolConfig, WorkerPoolError};

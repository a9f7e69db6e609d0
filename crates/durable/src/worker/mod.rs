//! Worker pool for job execution
//!
//! This module provides:
//! - [`WorkerPool`] - concurrent job execution with per-job timeouts
//! - [`JobHandler`] - the contract a job dispatcher implements
//! - [`WorkerEvent`] - progress, completion and failure notifications
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       WorkerPool                          │
//! │  ┌─────────────┐               ┌─────────────────────┐    │
//! │  │  Claim loop │               │   Stall Reclaimer   │    │
//! │  │ (wait_for_  │               │       (30s)         │    │
//! │  │   jobs)     │               │                     │    │
//! │  └──────┬──────┘               └─────────────────────┘    │
//! │         │                                                 │
//! │         ▼                                                 │
//! │  ┌────────────────────────────────────────────────────┐   │
//! │  │      JobHandler (Semaphore-limited, timed out)     │   │
//! │  │  [Job 1] [Job 2] [Job 3] ... [Job N]               │   │
//! │  └────────────────────────────────────────────────────┘   │
//! │         │                                                 │
//! │         ▼                                                 │
//! │  broadcast<WorkerEvent>                                   │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod handler;
mod pool;

pub use handler::{JobContext, JobError, JobHandler, WorkerEvent};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};

//! Persistence layer for automations
//!
//! This module provides:
//! - [`AutomationStore`] trait over automations, executions, schedules,
//!   triggers and subscribers
//! - [`InMemoryAutomationStore`] for tests and single-process deployments

mod memory;
mod store;

pub use memory::InMemoryAutomationStore;
pub use store::{
    AutomationFilter, AutomationStore, ExecutionFilter, Pagination, ScheduleFilter,
    StoreError, SubscriberFilter, TriggerFilter,
};

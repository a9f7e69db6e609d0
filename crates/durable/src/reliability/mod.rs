//! Reliability patterns for job processing
//!
//! This module provides:
//! - [`Backoff`] - Fixed or exponential delay between job attempts

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::{Backoff, BackoffKind};

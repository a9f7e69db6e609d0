// Worker process configuration
// Decision: Unparsable values fall back to defaults with a warning instead of aborting startup

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration for the worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker ID (unique identifier for this worker instance)
    pub worker_id: String,
    /// Maximum jobs running at once
    pub max_concurrent_jobs: usize,
    /// Budget for a single job run
    pub job_timeout: Duration,
    /// Delay between schedule sweeps
    pub scheduler_interval: Duration,
    /// Schedules resumed per sweep
    pub schedule_batch_size: usize,
    /// Delay between behavior trigger sweeps
    pub behavior_sweep_interval: Duration,
    /// Delay between time-based trigger sweeps
    pub time_sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrent_jobs: 10,
            job_timeout: Duration::from_secs(300),
            scheduler_interval: Duration::from_secs(60),
            schedule_batch_size: 100,
            behavior_sweep_interval: Duration::from_secs(3600),
            time_sweep_interval: Duration::from_secs(86_400),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKER_ID`: Worker ID (default: `worker-<uuid>`)
    /// - `MAX_CONCURRENT_JOBS`: Concurrent jobs (default: 10)
    /// - `JOB_TIMEOUT_SECS`: Per-job timeout (default: 300)
    /// - `SCHEDULER_INTERVAL_SECS`: Schedule sweep interval (default: 60)
    /// - `SCHEDULE_BATCH_SIZE`: Schedules per sweep (default: 100)
    /// - `BEHAVIOR_SWEEP_INTERVAL_SECS`: Behavior sweep interval (default: 3600)
    /// - `TIME_SWEEP_INTERVAL_SECS`: Time-based sweep interval (default: 86400)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; used by [`WorkerConfig::from_env`]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let number = |key: &str, default: u64| -> u64 {
            match lookup(key) {
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(value) if value > 0 => value,
                    _ => {
                        tracing::warn!(key, value = %raw, default, "invalid setting, using default");
                        default
                    }
                },
                None => default,
            }
        };
        let secs = |key: &str, default: Duration| Duration::from_secs(number(key, default.as_secs()));

        Self {
            worker_id: lookup("WORKER_ID")
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.worker_id),
            max_concurrent_jobs: number("MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs as u64)
                as usize,
            job_timeout: secs("JOB_TIMEOUT_SECS", defaults.job_timeout),
            scheduler_interval: secs("SCHEDULER_INTERVAL_SECS", defaults.scheduler_interval),
            schedule_batch_size: number("SCHEDULE_BATCH_SIZE", defaults.schedule_batch_size as u64)
                as usize,
            behavior_sweep_interval: secs(
                "BEHAVIOR_SWEEP_INTERVAL_SECS",
                defaults.behavior_sweep_interval,
            ),
            time_sweep_interval: secs("TIME_SWEEP_INTERVAL_SECS", defaults.time_sweep_interval),
        }
    }
}

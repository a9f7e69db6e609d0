pub mod config;
pub mod runtime;
pub mod telemetry;

pub use config::WorkerConfig;
pub use runtime::AutomationRuntime;
pub use telemetry::{init_logging, LogConfig};

//! Unit execution.
//!
//! [`UnitExecutionService`] runs a single unit against the configured
//! executor and persists the result; [`ExecutionScheduler`] feeds it pending
//! units with bounded concurrency and recovers stuck ones.

mod config;
mod scheduler;
mod service;
mod types;

pub use config::SchedulerConfig;
pub use scheduler::{ExecutionScheduler, SchedulerStats};
pub use service::UnitExecutionService;
pub use types::{ExecutionError, ExecutionOutcome, SchedulerStatsSnapshot, SchedulerStatus};

//! Types for unit execution and scheduling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{ExecutionReport, ExecutorError};
use crate::ledger::LedgerError;

/// Errors that can occur while driving a unit.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Unit or order is not in a status that allows the operation. Also
    /// returned when another worker claimed the unit first.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<LedgerError> for ExecutionError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::OrderNotFound(id) => ExecutionError::OrderNotFound(id),
            e @ (LedgerError::InvalidState { .. }
            | LedgerError::OrderClosed { .. }
            | LedgerError::UnitNotFound(_)) => {
                ExecutionError::InvalidState(e.to_string())
            }
            e => ExecutionError::Persistence(e.to_string()),
        }
    }
}

/// Classified result of one executor call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success(ExecutionReport),
    /// Executor completed but reported the unit cannot succeed. Not retried.
    BusinessFailure {
        reason: String,
        report: ExecutionReport,
    },
    /// Call failed or timed out. Retried while the unit has budget.
    TransportFailure(ExecutorError),
}

impl ExecutionOutcome {
    pub fn from_result(result: Result<ExecutionReport, ExecutorError>) -> Self {
        match result {
            Ok(report) if report.success => ExecutionOutcome::Success(report),
            Ok(report) => ExecutionOutcome::BusinessFailure {
                reason: report
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "executor reported failure".to_string()),
                report,
            },
            Err(e) => ExecutionOutcome::TransportFailure(e),
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success(_) => "success",
            ExecutionOutcome::BusinessFailure { .. } => "business_failure",
            ExecutionOutcome::TransportFailure(_) => "transport_failure",
        }
    }
}

/// Scheduler counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatsSnapshot {
    /// Units returned by pending fetches and handed to a worker.
    pub tasks_polled: u64,
    /// Executions that persisted an outcome.
    pub tasks_executed: u64,
    /// Executions or outcome recordings that errored.
    pub tasks_failed: u64,
    /// Units recovered by the stuck-unit sweep.
    pub tasks_reclaimed: u64,
}

/// Current status of the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub executor: String,
    pub max_concurrent_tasks: usize,
    /// Units currently dispatched by this process.
    pub in_flight: usize,
    pub stats: SchedulerStatsSnapshot,
}

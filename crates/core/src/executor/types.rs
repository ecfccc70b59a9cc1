//! Executor types and trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by an executor call. All of them are transport failures and
/// are retried while the unit has retries left.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("API error: {0}")]
    Api(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Short class name used in terminal failure reasons.
    pub fn class(&self) -> &'static str {
        match self {
            ExecutorError::ConnectionFailed(_) => "ConnectionFailed",
            ExecutorError::Timeout(_) => "Timeout",
            ExecutorError::Api(_) => "Api",
            ExecutorError::Internal(_) => "Internal",
        }
    }
}

/// Everything an executor needs to perform one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCommand {
    pub unit_id: String,
    pub order_id: String,
    pub target: String,
    pub executor_identity: String,
    pub assigned_node: String,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Upper bound the executor should respect for this call.
    pub timeout_ms: u64,
}

/// Result reported by an executor that completed its call.
///
/// `success == false` is a business failure: deterministic and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub node_used: String,
    /// Attempts consumed for this unit, including earlier transport retries.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    /// Successful report finishing now.
    pub fn succeeded(node_used: impl Into<String>, attempts: u32, started_at: DateTime<Utc>) -> Self {
        Self::finished(true, None, node_used.into(), attempts, started_at)
    }

    /// Business-failure report finishing now.
    pub fn rejected(
        node_used: impl Into<String>,
        reason: impl Into<String>,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::finished(false, Some(reason.into()), node_used.into(), attempts, started_at)
    }

    fn finished(
        success: bool,
        failure_reason: Option<String>,
        node_used: String,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            success,
            failure_reason,
            node_used,
            attempts,
            started_at,
            completed_at,
            duration_ms,
        }
    }
}

/// Performs a single unit of work against the outside world.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    /// Backend name for logs and status output.
    fn name(&self) -> &str;

    /// Execute one unit.
    ///
    /// `Ok` with `success == false` is a business failure. `Err` is a
    /// transport failure.
    async fn execute(&self, command: UnitCommand) -> Result<ExecutionReport, ExecutorError>;
}

//! In-process executor with deterministic pseudo-random outcomes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::config::SimulatedExecutorConfig;

use super::{ExecutionReport, ExecutorError, UnitCommand, UnitExecutor};

/// Executor for local runs: each unit's outcome is derived from a SHA-256 of
/// its id and identity, so reruns of the same data give the same results.
pub struct SimulatedUnitExecutor {
    config: SimulatedExecutorConfig,
}

impl SimulatedUnitExecutor {
    pub fn new(config: SimulatedExecutorConfig) -> Self {
        Self { config }
    }

    /// Maps a unit onto `[0, 1)`.
    fn roll(command: &UnitCommand) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(command.unit_id.as_bytes());
        hasher.update(b":");
        hasher.update(command.executor_identity.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[async_trait]
impl UnitExecutor for SimulatedUnitExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn execute(&self, command: UnitCommand) -> Result<ExecutionReport, ExecutorError> {
        let started_at = Utc::now();

        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let report = if Self::roll(&command) < self.config.success_rate {
            ExecutionReport::succeeded(&self.config.node, command.retry_count, started_at)
        } else {
            ExecutionReport::rejected(
                &self.config.node,
                format!("simulated rejection for {}", command.executor_identity),
                command.retry_count,
                started_at,
            )
        };

        Ok(report)
    }
}

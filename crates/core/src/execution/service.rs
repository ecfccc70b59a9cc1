//! Unit execution service.
//!
//! Drives one unit through `Pending -> Executing -> Completed | Failed`, with
//! `Executing -> Pending` on transport failures while retries remain. Every
//! write is conditional on the status the unit is expected to be in.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::executor::{ExecutorError, UnitCommand, UnitExecutor};
use crate::ledger::{LedgerError, LedgerStore};
use crate::metrics::PipelineMetrics;
use crate::order::{OrderStatus, Unit, UnitStatus};

use super::config::SchedulerConfig;
use super::types::{ExecutionError, ExecutionOutcome};

/// Orders whose units may still be dispatched or retried.
fn accepts_work(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Active | OrderStatus::Delivering)
}

pub struct UnitExecutionService {
    store: Arc<dyn LedgerStore>,
    executor: Arc<dyn UnitExecutor>,
    config: SchedulerConfig,
    metrics: Arc<PipelineMetrics>,
}

impl UnitExecutionService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        executor: Arc<dyn UnitExecutor>,
        config: SchedulerConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            metrics,
        }
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    /// Claim and execute a pending unit, persisting the outcome.
    ///
    /// Returns the unit as persisted afterwards: terminal, or back to
    /// `Pending` after a retryable transport failure. Fails with
    /// `InvalidState` if the unit is not pending, its order no longer accepts
    /// work, or another worker claimed it first.
    pub async fn execute(&self, unit: Unit) -> Result<Unit, ExecutionError> {
        if unit.status != UnitStatus::Pending {
            return Err(ExecutionError::InvalidState(format!(
                "unit {} is {}, expected pending",
                unit.id, unit.status
            )));
        }

        let order = self
            .store
            .get_order(&unit.order_id)?
            .ok_or_else(|| ExecutionError::OrderNotFound(unit.order_id.clone()))?;
        if !accepts_work(order.status) {
            return Err(ExecutionError::InvalidState(format!(
                "order {} is {}, not dispatching unit {}",
                order.id, order.status, unit.id
            )));
        }

        let started_at = Utc::now();
        let mut claimed = unit;
        claimed.status = UnitStatus::Executing;
        claimed.started_at = Some(started_at);
        claimed.completed_at = None;
        claimed.assigned_node = Some(self.config.executor_node.clone());
        self.store.transition_unit(&claimed, UnitStatus::Pending)?;
        self.store.mark_order_delivering(&order.id, started_at)?;

        debug!(
            unit_id = %claimed.id,
            order_id = %order.id,
            retry_count = claimed.retry_count,
            "Unit claimed"
        );

        let timeout_ms = self.config.unit_execution_timeout_ms;
        let command = UnitCommand {
            unit_id: claimed.id.clone(),
            order_id: order.id.clone(),
            target: order.target.clone(),
            executor_identity: claimed.executor_identity.clone(),
            assigned_node: self.config.executor_node.clone(),
            retry_count: claimed.retry_count,
            max_retries: claimed.max_retries,
            timeout_ms,
        };

        let timer = self.metrics.execution_duration.start_timer();
        let result = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.executor.execute(command),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(timeout_ms)),
        };
        timer.observe_duration();

        let outcome = ExecutionOutcome::from_result(result);
        self.metrics
            .units_executed
            .with_label_values(&[outcome.label()])
            .inc();

        self.apply_outcome(claimed, outcome)
    }

    /// Treat a unit stuck in `Executing` as a transport failure.
    ///
    /// Consumes one retry. Fails with `InvalidState` if the unit moved on in
    /// the meantime.
    pub fn reclaim(&self, unit: Unit) -> Result<Unit, ExecutionError> {
        if unit.status != UnitStatus::Executing {
            return Err(ExecutionError::InvalidState(format!(
                "unit {} is {}, expected executing",
                unit.id, unit.status
            )));
        }

        let now = Utc::now();
        let stuck_for = unit
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let error = ExecutorError::Timeout(stuck_for);

        let unit = self.persist_transport_failure(unit, &error, now)?;
        self.metrics.units_reclaimed.inc();

        info!(
            unit_id = %unit.id,
            stuck_ms = stuck_for,
            status = %unit.status,
            "Reclaimed stuck unit"
        );

        Ok(unit)
    }

    fn apply_outcome(
        &self,
        mut unit: Unit,
        outcome: ExecutionOutcome,
    ) -> Result<Unit, ExecutionError> {
        let now = Utc::now();

        match outcome {
            ExecutionOutcome::Success(report) => {
                unit.status = UnitStatus::Completed;
                unit.completed_at = Some(now);
                unit.retry_count = unit.retry_count.max(report.attempts);
                unit.failure_reason = None;
                debug!(
                    unit_id = %unit.id,
                    node = %report.node_used,
                    duration_ms = report.duration_ms,
                    "Unit completed"
                );
            }
            ExecutionOutcome::BusinessFailure { reason, .. } => {
                unit.status = UnitStatus::Failed;
                unit.completed_at = Some(now);
                warn!(unit_id = %unit.id, reason = %reason, "Unit rejected by executor");
                unit.failure_reason = Some(reason);
            }
            ExecutionOutcome::TransportFailure(error) => {
                return self.persist_transport_failure(unit, &error, now);
            }
        }

        self.store.transition_unit(&unit, UnitStatus::Executing)?;
        Ok(unit)
    }

    /// Requeue or fail an `Executing` unit after a transport failure.
    ///
    /// If the order is cancelled between the order read and the write, the
    /// store refuses the requeue and the unit fails instead.
    fn persist_transport_failure(
        &self,
        unit: Unit,
        error: &ExecutorError,
        now: DateTime<Utc>,
    ) -> Result<Unit, ExecutionError> {
        let order_open = self
            .store
            .get_order(&unit.order_id)?
            .map(|o| accepts_work(o.status))
            .unwrap_or(false);

        let mut next = transport_failure_outcome(&unit, error, now, order_open);
        match self.store.transition_unit(&next, UnitStatus::Executing) {
            Ok(()) => {}
            Err(LedgerError::OrderClosed { .. }) if order_open => {
                next = transport_failure_outcome(&unit, error, now, false);
                self.store.transition_unit(&next, UnitStatus::Executing)?;
            }
            Err(e) => return Err(e.into()),
        }

        if next.status == UnitStatus::Pending {
            self.metrics.unit_retries.inc();
            warn!(
                unit_id = %next.id,
                retry = next.retry_count,
                max_retries = next.max_retries,
                error = %error,
                "Transport failure, unit returned to pending"
            );
        } else {
            warn!(
                unit_id = %next.id,
                retry = next.retry_count,
                error = %error,
                "Transport failure, unit failed permanently"
            );
        }

        Ok(next)
    }
}

/// The unit as it should be persisted after a transport failure. A closed
/// order takes no more retries; the unit ends here and is refunded when its
/// outcome is recorded.
fn transport_failure_outcome(
    unit: &Unit,
    error: &ExecutorError,
    now: DateTime<Utc>,
    order_open: bool,
) -> Unit {
    let mut next = unit.clone();
    next.retry_count += 1;

    if order_open && next.can_retry() {
        next.status = UnitStatus::Pending;
        next.started_at = None;
        next.completed_at = None;
        next.assigned_node = None;
        next.failure_reason = Some(format!("{} (retry {})", error, next.retry_count));
    } else {
        next.status = UnitStatus::Failed;
        next.completed_at = Some(now);
        next.failure_reason = Some(if order_open {
            format!("{}: {}", error.class(), error)
        } else {
            format!("{}: {} (order closed, not retried)", error.class(), error)
        });
    }

    next
}

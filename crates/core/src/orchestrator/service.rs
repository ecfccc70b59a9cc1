//! Order orchestrator implementation.
//!
//! Owns order creation, folds unit outcomes into order state, and answers
//! status, metrics and audit queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::OrdersConfig;
use crate::ledger::{Cancellation, LedgerStore, OrderCreation, OrderFilter};
use crate::metrics::PipelineMetrics;
use crate::order::{exact_money, Account, Order, OrderStatus, TaskFactory, Unit, UnitStatus};

use super::invariants::check_order;
use super::types::{CreateOrderRequest, InvariantReport, OrchestratorError, OrderMetrics};

/// The order orchestrator.
pub struct OrderOrchestrator {
    store: Arc<dyn LedgerStore>,
    factory: TaskFactory,
    config: OrdersConfig,
    metrics: Arc<PipelineMetrics>,
}

impl OrderOrchestrator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        factory: TaskFactory,
        config: OrdersConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            factory,
            config,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Validate, decompose and persist a new order, charging its account.
    ///
    /// A request whose idempotency key was already used returns the existing
    /// order as `OrderCreation::Existing` without charging again.
    pub fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderCreation, OrchestratorError> {
        if request.target.trim().is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "target must not be empty".to_string(),
            ));
        }
        if request.quantity == 0 {
            return Err(OrchestratorError::InvalidArgument(
                "quantity must be positive".to_string(),
            ));
        }
        if request.quantity > self.config.max_quantity {
            return Err(OrchestratorError::InvalidArgument(format!(
                "quantity {} exceeds the maximum of {}",
                request.quantity, self.config.max_quantity
            )));
        }
        if matches!(request.account_id.as_deref(), Some(a) if a.trim().is_empty()) {
            return Err(OrchestratorError::InvalidArgument(
                "account_id must not be empty".to_string(),
            ));
        }
        if matches!(request.idempotency_key.as_deref(), Some(k) if k.trim().is_empty()) {
            return Err(OrchestratorError::InvalidArgument(
                "idempotency_key must not be empty".to_string(),
            ));
        }

        let unit_price = request.unit_price.unwrap_or(self.config.default_unit_price);
        if unit_price.is_sign_negative() && !unit_price.is_zero() {
            return Err(OrchestratorError::InvalidArgument(
                "unit_price must not be negative".to_string(),
            ));
        }

        let order = Order::new(
            request.target,
            request.quantity,
            unit_price,
            request.account_id,
            request.idempotency_key,
        )?;
        let units = self
            .factory
            .create_units(&order, &request.executor_identities)?;

        let creation = self.store.create_order(order, units)?;
        if creation.is_created() {
            self.metrics.orders_created.inc();
        } else {
            debug!(order_id = %creation.order().id, "Idempotent order replay");
        }

        Ok(creation)
    }

    /// Fold a terminal unit's outcome into its order and recompute the order
    /// status. Safe to call more than once per unit.
    pub fn record_unit_outcome(&self, unit_id: &str) -> Result<Order, OrchestratorError> {
        let settlement = self.store.settle_unit(unit_id)?;

        if settlement.applied {
            debug!(
                unit_id,
                order_id = %settlement.order_id,
                status = %settlement.unit_status,
                "Unit outcome settled"
            );
            if let Some(ref refund) = settlement.refund {
                self.metrics.record_refund(refund.applied, refund.amount);
            }
        } else {
            debug!(unit_id, "Unit outcome already settled");
        }

        let recompute = self.store.recompute_order_status(&settlement.order_id)?;
        if recompute.reached_terminal() {
            let order = &recompute.order;
            self.metrics
                .orders_finished
                .with_label_values(&[order.status.as_str()])
                .inc();
            info!(
                order_id = %order.id,
                status = %order.status,
                delivered = order.delivered,
                failed = order.failed_permanent,
                refunded = %order.refund_amount,
                "Order finished"
            );
        }

        Ok(recompute.order)
    }

    pub fn get_order(&self, order_id: &str) -> Result<Order, OrchestratorError> {
        self.store
            .get_order(order_id)?
            .ok_or_else(|| OrchestratorError::OrderNotFound(order_id.to_string()))
    }

    pub fn get_units(&self, order_id: &str) -> Result<Vec<Unit>, OrchestratorError> {
        // Distinguish "no such order" from "order without units".
        self.get_order(order_id)?;
        Ok(self.store.list_units(order_id)?)
    }

    pub fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, OrchestratorError> {
        Ok(self.store.list_orders(filter)?)
    }

    pub fn count_orders(&self, filter: &OrderFilter) -> Result<i64, OrchestratorError> {
        Ok(self.store.count_orders(filter)?)
    }

    /// Cancel a non-terminal order. Units that never started are refunded and
    /// never dispatched; units already executing finish and are settled.
    pub fn cancel_order(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<Cancellation, OrchestratorError> {
        let cancellation = self.store.cancel_order(order_id, reason)?;

        for refund in &cancellation.refunds {
            self.metrics.record_refund(refund.applied, refund.amount);
        }
        self.metrics
            .orders_finished
            .with_label_values(&[OrderStatus::Cancelled.as_str()])
            .inc();

        let refunded: Decimal = cancellation.refunds.iter().map(|r| r.amount).sum();
        info!(
            order_id,
            reason,
            refunded_units = cancellation.refunds.len(),
            refunded = %refunded,
            "Order cancelled"
        );

        Ok(cancellation)
    }

    /// Aggregate snapshot across all orders and units.
    pub fn get_metrics(&self) -> Result<OrderMetrics, OrchestratorError> {
        let totals = self.store.totals()?;

        let orders_by_status: BTreeMap<String, i64> = OrderStatus::ALL
            .iter()
            .map(|s| {
                let count = totals.orders_by_status.get(s).copied().unwrap_or(0);
                (s.as_str().to_string(), count)
            })
            .collect();
        let units_by_status: BTreeMap<String, i64> = UnitStatus::ALL
            .iter()
            .map(|s| {
                let count = totals.units_by_status.get(s).copied().unwrap_or(0);
                (s.as_str().to_string(), count)
            })
            .collect();

        let total_orders = orders_by_status.values().sum();
        let total_units: i64 = units_by_status.values().sum();
        let completed_units = units_by_status
            .get(UnitStatus::Completed.as_str())
            .copied()
            .unwrap_or(0);
        let success_rate = if total_units > 0 {
            completed_units as f64 / total_units as f64
        } else {
            0.0
        };

        Ok(OrderMetrics {
            total_orders,
            orders_by_status,
            total_units,
            units_by_status,
            success_rate,
            average_retries: totals.average_retries,
            total_delivered: totals.total_delivered,
            total_failed_permanent: totals.total_failed_permanent,
            total_refunded: totals.total_refunded,
            generated_at: Utc::now(),
        })
    }

    /// Audit one order's stored state. Read-only.
    pub fn verify_invariants(&self, order_id: &str) -> Result<InvariantReport, OrchestratorError> {
        let order = self.get_order(order_id)?;
        let units = self.store.list_units(order_id)?;
        let refunds = self.store.list_refund_events(order_id)?;

        let violations = check_order(&order, &units, &refunds);
        if !violations.is_empty() {
            warn!(
                order_id,
                violations = violations.len(),
                "Order failed invariant check"
            );
        }

        Ok(InvariantReport {
            order_id: order.id,
            ok: violations.is_empty(),
            violations,
            checked_at: Utc::now(),
        })
    }

    pub fn open_account(
        &self,
        account_id: &str,
        initial_balance: Decimal,
    ) -> Result<Account, OrchestratorError> {
        if account_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "account id must not be empty".to_string(),
            ));
        }
        if initial_balance.is_sign_negative() && !initial_balance.is_zero() {
            return Err(OrchestratorError::InvalidArgument(
                "initial balance must not be negative".to_string(),
            ));
        }
        let initial_balance = exact_money(initial_balance)?;
        Ok(self.store.open_account(account_id, initial_balance)?)
    }

    pub fn get_account(&self, account_id: &str) -> Result<Account, OrchestratorError> {
        self.store
            .get_account(account_id)?
            .ok_or_else(|| OrchestratorError::AccountNotFound(account_id.to_string()))
    }
}

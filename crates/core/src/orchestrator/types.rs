//! Types for the order orchestrator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::order::{FactoryError, MoneyError};

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad input to order creation or decomposition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation invoked against an order or unit in the wrong status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("insufficient balance on account {account_id}: required {required}, available {available}")]
    InsufficientBalance {
        account_id: String,
        required: Decimal,
        available: Decimal,
    },

    /// Ledger store failure.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<LedgerError> for OrchestratorError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::OrderNotFound(id) => OrchestratorError::OrderNotFound(id),
            LedgerError::UnitNotFound(id) => OrchestratorError::UnitNotFound(id),
            LedgerError::AccountNotFound(id) => OrchestratorError::AccountNotFound(id),
            LedgerError::AccountExists(id) => OrchestratorError::AccountExists(id),
            LedgerError::InsufficientBalance {
                account_id,
                required,
                available,
            } => OrchestratorError::InsufficientBalance {
                account_id,
                required,
                available,
            },
            e @ (LedgerError::InvalidState { .. } | LedgerError::OrderClosed { .. }) => {
                OrchestratorError::InvalidState(e.to_string())
            }
            LedgerError::InvalidAmount(msg) => OrchestratorError::InvalidArgument(msg),
            LedgerError::Database(msg) => OrchestratorError::Persistence(msg),
        }
    }
}

impl From<MoneyError> for OrchestratorError {
    fn from(e: MoneyError) -> Self {
        OrchestratorError::InvalidArgument(e.to_string())
    }
}

impl From<FactoryError> for OrchestratorError {
    fn from(e: FactoryError) -> Self {
        match e {
            FactoryError::InvalidArgument(msg) => OrchestratorError::InvalidArgument(msg),
        }
    }
}

/// Request to create a bulk order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub target: String,
    pub quantity: u32,
    /// One identity per unit, in unit order.
    pub executor_identities: Vec<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    /// Defaults to the configured unit price.
    #[serde(default)]
    pub unit_price: Option<Decimal>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Point-in-time aggregate view over all orders and units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderMetrics {
    pub total_orders: i64,
    pub orders_by_status: BTreeMap<String, i64>,
    pub total_units: i64,
    pub units_by_status: BTreeMap<String, i64>,
    /// Completed units over all units (0 when there are none).
    pub success_rate: f64,
    pub average_retries: f64,
    pub total_delivered: i64,
    pub total_failed_permanent: i64,
    pub total_refunded: Decimal,
    pub generated_at: DateTime<Utc>,
}

/// Which consistency rule a violation breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantRule {
    /// `delivered + failed_permanent + remains == quantity`.
    QuantityConservation,
    /// Order counters agree with the settled units.
    CounterConsistency,
    /// Started units carry `started_at` and `assigned_node`.
    UnitStarted,
    /// Terminal units carry `completed_at`.
    UnitCompleted,
    /// Refund total matches refunded units times unit price.
    RefundProportionality,
    /// Terminal order status agrees with unit statuses.
    StatusConsistency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub rule: InvariantRule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    pub message: String,
}

/// Read-only audit of one order against its stored units and refunds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantReport {
    pub order_id: String,
    pub ok: bool,
    pub violations: Vec<InvariantViolation>,
    pub checked_at: DateTime<Utc>,
}

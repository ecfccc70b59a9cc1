//! Ledger storage trait and types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::order::{Account, MoneyError, Order, OrderStatus, Unit, UnitStatus};

/// Error type for ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
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

    /// The row is not in the status the operation requires.
    #[error("cannot {operation} {entity} {id}: current status is {current}")]
    InvalidState {
        entity: &'static str,
        id: String,
        current: String,
        operation: String,
    },

    /// The unit's order no longer accepts work, so the unit cannot be
    /// claimed or returned to the queue.
    #[error("order {order_id} is {status} and takes no more work")]
    OrderClosed { order_id: String, status: String },

    /// An amount the ledger cannot hold exactly.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<MoneyError> for LedgerError {
    fn from(e: MoneyError) -> Self {
        LedgerError::InvalidAmount(e.to_string())
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

/// Result of persisting a new order.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderCreation {
    /// A new order was inserted and the account charged.
    Created(Order),
    /// An order with the same idempotency key already existed; nothing was charged.
    Existing(Order),
}

impl OrderCreation {
    pub fn order(&self) -> &Order {
        match self {
            OrderCreation::Created(order) | OrderCreation::Existing(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            OrderCreation::Created(order) | OrderCreation::Existing(order) => order,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, OrderCreation::Created(_))
    }
}

/// Result of a refund attempt for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundOutcome {
    pub unit_id: String,
    pub order_id: String,
    pub account_id: String,
    /// False when the refund gate was already closed.
    pub applied: bool,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

/// Result of folding a terminal unit outcome into its order's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub unit_id: String,
    pub order_id: String,
    pub unit_status: UnitStatus,
    /// False when the unit had already been settled.
    pub applied: bool,
    pub refund: Option<RefundOutcome>,
}

/// Result of recomputing an order's status from its units.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecompute {
    pub order: Order,
    pub previous_status: OrderStatus,
}

impl OrderRecompute {
    /// True when this recomputation moved the order into a terminal status.
    pub fn reached_terminal(&self) -> bool {
        !self.previous_status.is_terminal() && self.order.status.is_terminal()
    }
}

/// Result of cancelling an order.
#[derive(Debug, Clone, PartialEq)]
pub struct Cancellation {
    pub order: Order,
    /// Refunds issued for units that never started.
    pub refunds: Vec<RefundOutcome>,
}

/// Audit row written for every applied refund.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundEvent {
    pub id: String,
    pub order_id: String,
    pub unit_id: String,
    pub account_id: String,
    pub units: u32,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts across the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub orders_by_status: HashMap<OrderStatus, i64>,
    pub units_by_status: HashMap<UnitStatus, i64>,
    pub average_retries: f64,
    pub total_delivered: i64,
    pub total_failed_permanent: i64,
    pub total_refunded: Decimal,
}

/// Filter for querying orders.
#[derive(Debug, Clone)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub account_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for OrderFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderFilter {
    pub fn new() -> Self {
        Self {
            status: None,
            account_id: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Transactional storage for orders, units and account balances.
///
/// Every counter and balance change is applied as a single conditional SQL
/// update, never as a read-modify-write in application code.
pub trait LedgerStore: Send + Sync {
    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Create an account with an initial balance.
    fn open_account(&self, account_id: &str, initial_balance: Decimal)
        -> Result<Account, LedgerError>;

    fn get_account(&self, account_id: &str) -> Result<Option<Account>, LedgerError>;

    // ------------------------------------------------------------------
    // Orders and units
    // ------------------------------------------------------------------

    /// Persist an order and its units in one transaction.
    ///
    /// Looks up the idempotency key first, then debits `order.charged` from the
    /// paying account, inserts the order as `Pending`, inserts the units and
    /// finally marks the order `Active`.
    fn create_order(&self, order: Order, units: Vec<Unit>) -> Result<OrderCreation, LedgerError>;

    fn get_order(&self, order_id: &str) -> Result<Option<Order>, LedgerError>;

    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, LedgerError>;

    fn count_orders(&self, filter: &OrderFilter) -> Result<i64, LedgerError>;

    fn get_unit(&self, unit_id: &str) -> Result<Option<Unit>, LedgerError>;

    fn list_units(&self, order_id: &str) -> Result<Vec<Unit>, LedgerError>;

    /// Oldest-first page of `Pending` units whose order is still dispatchable.
    fn fetch_pending_units(&self, limit: usize) -> Result<Vec<Unit>, LedgerError>;

    /// Units stuck in `Executing` since before `started_before`.
    fn find_stuck_units(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Unit>, LedgerError>;

    /// Write the mutable fields of `unit`, but only if its stored status is
    /// still `expected`. Fails with `InvalidState` otherwise.
    ///
    /// Moves into `Executing` or back to `Pending` also require the order to
    /// still be `Active` or `Delivering` (and a claim requires the unit to be
    /// unrefunded), checked in the same statement. Fails with `OrderClosed`
    /// when only the order check stopped the write.
    fn transition_unit(&self, unit: &Unit, expected: UnitStatus) -> Result<(), LedgerError>;

    /// Move an `Active` order to `Delivering`, stamping `started_at`.
    /// No-op for orders in any other status.
    fn mark_order_delivering(&self, order_id: &str, at: DateTime<Utc>)
        -> Result<(), LedgerError>;

    /// Recompute the order status from its settled units in one transaction.
    /// Terminal statuses are never overwritten.
    fn recompute_order_status(&self, order_id: &str) -> Result<OrderRecompute, LedgerError>;

    /// Cancel a non-terminal order and refund its never-started units.
    fn cancel_order(&self, order_id: &str, reason: &str) -> Result<Cancellation, LedgerError>;

    // ------------------------------------------------------------------
    // Progress and refund ledger
    // ------------------------------------------------------------------

    /// `delivered += n`, `remains` recomputed.
    fn increment_delivered(&self, order_id: &str, n: u32) -> Result<(), LedgerError>;

    /// `failed_permanent += n`, `remains` recomputed.
    fn increment_failed_permanent(&self, order_id: &str, n: u32) -> Result<(), LedgerError>;

    /// `refund_amount += amount`.
    fn increment_order_refund(&self, order_id: &str, amount: Decimal) -> Result<(), LedgerError>;

    /// `balance += amount`.
    fn credit_account_balance(&self, account_id: &str, amount: Decimal)
        -> Result<(), LedgerError>;

    /// Credit `unit_price × failed_units` for `unit_id` at most once.
    ///
    /// The unit's refund gate is flipped first; the account credit, order refund
    /// total and audit row are only written if the gate flipped, all in the same
    /// transaction.
    fn process_refund(
        &self,
        unit_id: &str,
        order_id: &str,
        account_id: &str,
        failed_units: u32,
        unit_price: Decimal,
    ) -> Result<RefundOutcome, LedgerError>;

    /// Fold a terminal unit's outcome into its order's counters exactly once,
    /// refunding it if it failed and the order has a paying account.
    fn settle_unit(&self, unit_id: &str) -> Result<Settlement, LedgerError>;

    fn list_refund_events(&self, order_id: &str) -> Result<Vec<RefundEvent>, LedgerError>;

    /// Aggregate counts for reporting.
    fn totals(&self) -> Result<LedgerTotals, LedgerError>;
}

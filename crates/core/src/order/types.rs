//! Order and unit types.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::money::{exact_money, line_amount, MoneyError};

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, units not yet persisted.
    Pending,
    /// Units persisted, nothing started yet.
    Active,
    /// At least one unit has started and not all units are terminal.
    Delivering,
    /// All units terminal, none failed.
    Completed,
    /// All units terminal, at least one failed permanently.
    Failed,
    /// Cancelled by the caller before reaching a terminal status.
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Active,
        OrderStatus::Delivering,
        OrderStatus::Completed,
        OrderStatus::Failed,
        OrderStatus::Cancelled,
    ];

    /// Returns the string representation used in storage and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Active => "active",
            OrderStatus::Delivering => "delivering",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Parses the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Returns true if no further status change is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }

    /// Returns true if the order can be cancelled from this status.
    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl UnitStatus {
    pub const ALL: [UnitStatus; 4] = [
        UnitStatus::Pending,
        UnitStatus::Executing,
        UnitStatus::Completed,
        UnitStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Executing => "executing",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    ///
    /// `Executing -> Pending` is the retry path taken on transport failures
    /// while retries remain.
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        matches!(
            (self, next),
            (UnitStatus::Pending, UnitStatus::Executing)
                | (UnitStatus::Executing, UnitStatus::Completed)
                | (UnitStatus::Executing, UnitStatus::Failed)
                | (UnitStatus::Executing, UnitStatus::Pending)
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bulk order: a quantity of units against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    /// Opaque reference to what the units apply to.
    pub target: String,
    pub quantity: u32,
    /// Units that reached `Completed`.
    pub delivered: u32,
    /// Units that reached `Failed`.
    pub failed_permanent: u32,
    /// `quantity - delivered - failed_permanent`, never negative.
    pub remains: u32,
    /// Cumulative amount credited back for failed units.
    pub refund_amount: Decimal,
    pub status: OrderStatus,
    /// Paying account. Orders without an account are neither charged nor refunded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub unit_price: Decimal,
    /// Amount debited from the account at creation.
    pub charged: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Create a new order in `Pending` status with a fresh id.
    ///
    /// Fails when the unit price or the charge cannot be held exactly at the
    /// ledger scale, so refunds always add up to what was charged.
    pub fn new(
        target: impl Into<String>,
        quantity: u32,
        unit_price: Decimal,
        account_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Result<Self, MoneyError> {
        let unit_price = exact_money(unit_price)?;
        let charged = if account_id.is_some() {
            line_amount(unit_price, quantity)?
        } else {
            Decimal::ZERO
        };

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.into(),
            quantity,
            delivered: 0,
            failed_permanent: 0,
            remains: quantity,
            refund_amount: Decimal::ZERO,
            status: OrderStatus::Pending,
            account_id,
            unit_price,
            charged,
            idempotency_key,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    /// Returns true if `delivered + failed_permanent + remains == quantity`.
    pub fn is_quantity_conserved(&self) -> bool {
        self.delivered as u64 + self.failed_permanent as u64 + self.remains as u64
            == self.quantity as u64
    }
}

/// One independently executable assignment decomposed from an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    /// Id of the owning order, resolved through the ledger store.
    pub order_id: String,
    /// Identity/credential handle the unit executes as.
    pub executor_identity: String,
    pub status: UnitStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution node that ran (or is running) the unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub refunded: bool,
    /// Set once the terminal outcome has been folded into the order counters.
    pub settled: bool,
}

impl Unit {
    /// Returns true if another transport-failure retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns true if the unit satisfies the timestamp/node invariants for its status.
    pub fn is_well_formed(&self) -> bool {
        let started_ok = match self.status {
            UnitStatus::Pending => true,
            _ => self.started_at.is_some() && self.assigned_node.is_some(),
        };
        let completed_ok = !self.status.is_terminal() || self.completed_at.is_some();
        started_ok && completed_ok
    }
}

/// A paying account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

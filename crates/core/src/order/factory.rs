//! Decomposition of an order into execution units.

use chrono::Utc;
use thiserror::Error;

use super::{Order, Unit, UnitStatus};

/// Default retry budget per unit for transport failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FactoryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Builds one `Pending` unit per executor identity. Pure: nothing is persisted.
#[derive(Debug, Clone)]
pub struct TaskFactory {
    max_retries: u32,
}

impl Default for TaskFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl TaskFactory {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Create the units for `order`, one per identity, in input order.
    ///
    /// The identity count must equal the order quantity; there is no batching
    /// of several units onto one identity.
    pub fn create_units(
        &self,
        order: &Order,
        executor_identities: &[String],
    ) -> Result<Vec<Unit>, FactoryError> {
        if executor_identities.is_empty() {
            return Err(FactoryError::InvalidArgument(
                "at least one executor identity is required".to_string(),
            ));
        }
        if executor_identities.len() != order.quantity as usize {
            return Err(FactoryError::InvalidArgument(format!(
                "executor identity count ({}) must equal order quantity ({})",
                executor_identities.len(),
                order.quantity
            )));
        }

        let now = Utc::now();
        let units = executor_identities
            .iter()
            .map(|identity| Unit {
                id: uuid::Uuid::new_v4().to_string(),
                order_id: order.id.clone(),
                executor_identity: identity.clone(),
                status: UnitStatus::Pending,
                retry_count: 0,
                max_retries: self.max_retries,
                created_at: now,
                started_at: None,
                completed_at: None,
                assigned_node: None,
                failure_reason: None,
                refunded: false,
                settled: false,
            })
            .collect();

        Ok(units)
    }
}

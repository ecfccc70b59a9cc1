//! Orders, their execution units, and order decomposition.

mod factory;
mod money;
mod types;

pub use factory::{FactoryError, TaskFactory, DEFAULT_MAX_RETRIES};
pub use money::{exact_money, from_minor_units, line_amount, to_minor_units, MoneyError, MONEY_SCALE};
pub use types::{Account, Order, OrderStatus, Unit, UnitStatus};

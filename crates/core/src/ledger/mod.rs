//! Transactional ledger for orders, units, balances and refunds.

mod sqlite;
mod store;

pub use sqlite::SqliteLedgerStore;
pub use store::{
    Cancellation, LedgerError, LedgerStore, LedgerTotals, OrderCreation, OrderFilter,
    OrderRecompute, RefundEvent, RefundOutcome, Settlement,
};

//! Fixed-scale money helpers.
//!
//! Amounts are persisted as integer minor units at scale 4 so the ledger can
//! apply increments as plain SQL arithmetic.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Number of decimal places kept for monetary amounts.
pub const MONEY_SCALE: u32 = 4;

const MINOR_PER_MAJOR: i64 = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount {0} has more than 4 decimal places")]
    TooPrecise(Decimal),

    #[error("amount {0} is out of range")]
    OutOfRange(Decimal),
}

/// Convert an amount to integer minor units (1 = 0.0001), rounding to the
/// ledger scale first.
pub fn to_minor_units(amount: Decimal) -> Result<i64, MoneyError> {
    amount
        .round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
        .checked_mul(Decimal::from(MINOR_PER_MAJOR))
        .and_then(|minor| minor.to_i64())
        .ok_or(MoneyError::OutOfRange(amount))
}

/// Convert integer minor units back to an amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, MONEY_SCALE)
}

/// Accept a caller-supplied amount only if the ledger can store it exactly.
pub fn exact_money(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount.normalize().scale() > MONEY_SCALE {
        return Err(MoneyError::TooPrecise(amount));
    }
    Ok(from_minor_units(to_minor_units(amount)?))
}

/// `unit_price × units`, rounded to the ledger scale and checked against the
/// storable range.
pub fn line_amount(unit_price: Decimal, units: u32) -> Result<Decimal, MoneyError> {
    let amount = unit_price
        .checked_mul(Decimal::from(units))
        .ok_or(MoneyError::OutOfRange(unit_price))?;
    Ok(from_minor_units(to_minor_units(amount)?))
}

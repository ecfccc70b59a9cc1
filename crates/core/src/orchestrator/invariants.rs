//! Consistency checks over one order's stored rows.

use rust_decimal::Decimal;

use crate::ledger::RefundEvent;
use crate::order::{line_amount, Order, OrderStatus, Unit, UnitStatus};

use super::types::{InvariantRule, InvariantViolation};

/// Check `order` against its units and refund events.
pub(crate) fn check_order(
    order: &Order,
    units: &[Unit],
    refunds: &[RefundEvent],
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut violate = |rule, unit_id: Option<&str>, message: String| {
        violations.push(InvariantViolation {
            rule,
            unit_id: unit_id.map(String::from),
            message,
        })
    };

    if !order.is_quantity_conserved() {
        violate(
            InvariantRule::QuantityConservation,
            None,
            format!(
                "delivered {} + failed {} + remains {} != quantity {}",
                order.delivered, order.failed_permanent, order.remains, order.quantity
            ),
        );
    }

    if units.len() != order.quantity as usize {
        violate(
            InvariantRule::CounterConsistency,
            None,
            format!("{} units stored for quantity {}", units.len(), order.quantity),
        );
    }

    let settled_completed = units
        .iter()
        .filter(|u| u.settled && u.status == UnitStatus::Completed)
        .count() as u32;
    let settled_failed = units
        .iter()
        .filter(|u| u.settled && u.status == UnitStatus::Failed)
        .count() as u32;
    if settled_completed != order.delivered {
        violate(
            InvariantRule::CounterConsistency,
            None,
            format!(
                "delivered is {} but {} completed units are settled",
                order.delivered, settled_completed
            ),
        );
    }
    if settled_failed != order.failed_permanent {
        violate(
            InvariantRule::CounterConsistency,
            None,
            format!(
                "failed_permanent is {} but {} failed units are settled",
                order.failed_permanent, settled_failed
            ),
        );
    }

    for unit in units {
        if unit.status != UnitStatus::Pending
            && (unit.started_at.is_none() || unit.assigned_node.is_none())
        {
            violate(
                InvariantRule::UnitStarted,
                Some(&unit.id),
                format!("{} unit has no start time or node", unit.status),
            );
        }
        if unit.status.is_terminal() && unit.completed_at.is_none() {
            violate(
                InvariantRule::UnitCompleted,
                Some(&unit.id),
                format!("{} unit has no completion time", unit.status),
            );
        }
        if unit.refunded && order.account_id.is_none() {
            violate(
                InvariantRule::RefundProportionality,
                Some(&unit.id),
                "unit refunded on an order without a paying account".to_string(),
            );
        }
    }

    let refunded_units = units.iter().filter(|u| u.refunded).count() as u32;
    match line_amount(order.unit_price, refunded_units) {
        Ok(expected_refund) if expected_refund == order.refund_amount => {}
        Ok(expected_refund) => violate(
            InvariantRule::RefundProportionality,
            None,
            format!(
                "refund_amount is {} but {} refunded units at {} make {}",
                order.refund_amount, refunded_units, order.unit_price, expected_refund
            ),
        ),
        Err(e) => violate(
            InvariantRule::RefundProportionality,
            None,
            format!("expected refund for {} units: {}", refunded_units, e),
        ),
    }

    let event_total: Decimal = refunds.iter().map(|e| e.amount).sum();
    if refunds.len() as u32 != refunded_units || event_total != order.refund_amount {
        violate(
            InvariantRule::RefundProportionality,
            None,
            format!(
                "{} refund events totalling {} for {} refunded units",
                refunds.len(),
                event_total,
                refunded_units
            ),
        );
    }

    // Outside cancellation, every refund belongs to a settled failure.
    if order.account_id.is_some() && order.status != OrderStatus::Cancelled {
        for unit in units {
            let should_be_refunded = unit.settled && unit.status == UnitStatus::Failed;
            if unit.refunded != should_be_refunded {
                violate(
                    InvariantRule::RefundProportionality,
                    Some(&unit.id),
                    format!(
                        "{} unit (settled: {}) has refunded = {}",
                        unit.status, unit.settled, unit.refunded
                    ),
                );
            }
        }
    }

    match order.status {
        OrderStatus::Completed => {
            if let Some(unit) = units.iter().find(|u| u.status != UnitStatus::Completed) {
                violate(
                    InvariantRule::StatusConsistency,
                    Some(&unit.id),
                    format!("order completed but unit is {}", unit.status),
                );
            }
        }
        OrderStatus::Failed => {
            if let Some(unit) = units.iter().find(|u| !u.status.is_terminal()) {
                violate(
                    InvariantRule::StatusConsistency,
                    Some(&unit.id),
                    format!("order failed but unit is {}", unit.status),
                );
            }
            if !units.iter().any(|u| u.status == UnitStatus::Failed) {
                violate(
                    InvariantRule::StatusConsistency,
                    None,
                    "order failed but no unit failed".to_string(),
                );
            }
        }
        _ => {}
    }

    if order.status.is_terminal() && order.completed_at.is_none() {
        violate(
            InvariantRule::StatusConsistency,
            None,
            format!("{} order has no completion time", order.status),
        );
    }

    violations
}

//! Prometheus metrics for the order pipeline.
//!
//! `PipelineMetrics` is created once per process and handed to the components
//! that record into it. Register it into whatever `Registry` the host exposes.

use prometheus::{
    Counter, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Counters and histograms recorded by the orchestrator, execution service
/// and scheduler.
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Units executed by outcome: "success", "business_failure", "transport_failure".
    pub units_executed: IntCounterVec,
    /// Transport failures that sent a unit back to pending.
    pub unit_retries: IntCounter,
    /// Units recovered by the stuck-unit sweep.
    pub units_reclaimed: IntCounter,
    /// Executor call duration in seconds.
    pub execution_duration: Histogram,
    /// Refund attempts by result: "applied", "skipped".
    pub refunds: IntCounterVec,
    /// Sum of applied refunds.
    pub refunded_amount: Counter,
    pub orders_created: IntCounter,
    /// Orders reaching a terminal status, by status.
    pub orders_finished: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            units_executed: IntCounterVec::new(
                Opts::new("unitflow_units_executed_total", "Units executed by outcome"),
                &["outcome"],
            )?,
            unit_retries: IntCounter::new(
                "unitflow_unit_retries_total",
                "Transport failures that returned a unit to pending",
            )?,
            units_reclaimed: IntCounter::new(
                "unitflow_units_reclaimed_total",
                "Units reclaimed after being stuck in executing",
            )?,
            execution_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "unitflow_unit_execution_duration_seconds",
                    "Duration of executor calls",
                )
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            )?,
            refunds: IntCounterVec::new(
                Opts::new("unitflow_refunds_total", "Refund attempts by result"),
                &["result"],
            )?,
            refunded_amount: Counter::new(
                "unitflow_refunded_amount_total",
                "Total amount credited back to accounts",
            )?,
            orders_created: IntCounter::new(
                "unitflow_orders_created_total",
                "Orders created (idempotent replays excluded)",
            )?,
            orders_finished: IntCounterVec::new(
                Opts::new(
                    "unitflow_orders_finished_total",
                    "Orders reaching a terminal status",
                ),
                &["status"],
            )?,
        })
    }

    /// Register every collector into `registry`.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.units_executed.clone()))?;
        registry.register(Box::new(self.unit_retries.clone()))?;
        registry.register(Box::new(self.units_reclaimed.clone()))?;
        registry.register(Box::new(self.execution_duration.clone()))?;
        registry.register(Box::new(self.refunds.clone()))?;
        registry.register(Box::new(self.refunded_amount.clone()))?;
        registry.register(Box::new(self.orders_created.clone()))?;
        registry.register(Box::new(self.orders_finished.clone()))?;
        Ok(())
    }

    pub(crate) fn record_refund(&self, applied: bool, amount: Decimal) {
        if applied {
            self.refunds.with_label_values(&["applied"]).inc();
            self.refunded_amount.inc_by(amount.to_f64().unwrap_or(0.0));
        } else {
            self.refunds.with_label_values(&["skipped"]).inc();
        }
    }
}

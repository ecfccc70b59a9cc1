//! Order orchestration.
//!
//! The orchestrator is the single entry point for changing order state:
//! - **Creation**: validation, decomposition and charging in one transaction
//! - **Outcomes**: terminal unit results folded into counters and refunds once
//! - **Queries**: status, aggregate metrics and invariant audits

mod invariants;
mod service;
mod types;

pub use service::OrderOrchestrator;
pub use types::{
    CreateOrderRequest, InvariantReport, InvariantRule, InvariantViolation, OrchestratorError,
    OrderMetrics,
};

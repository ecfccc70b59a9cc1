//! Testing utilities and mock implementations.
//!
//! This module provides a scripted `UnitExecutor` plus fixtures for building
//! orchestrators, services and schedulers over an in-memory ledger.
//!
//! # Example
//!
//! ```rust,ignore
//! use unitflow_core::testing::{fixtures, MockBehavior, MockUnitExecutor};
//!
//! let executor = Arc::new(MockUnitExecutor::new());
//! executor.set_behavior("identity-0", MockBehavior::Reject("banned".into())).await;
//!
//! let harness = fixtures::harness(executor.clone(), fixtures::fast_scheduler_config());
//! ```

mod mock_executor;

pub use mock_executor::{MockBehavior, MockUnitExecutor, RecordedCommand};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use crate::config::OrdersConfig;
    use crate::execution::{
        ExecutionScheduler, SchedulerConfig, SchedulerStats, UnitExecutionService,
    };
    use crate::executor::UnitExecutor;
    use crate::ledger::{LedgerStore, SqliteLedgerStore};
    use crate::metrics::PipelineMetrics;
    use crate::orchestrator::{CreateOrderRequest, OrderOrchestrator};
    use crate::order::TaskFactory;

    /// `count` distinct executor identities.
    pub fn identities(count: u32) -> Vec<String> {
        (0..count).map(|i| format!("identity-{}", i)).collect()
    }

    /// Order request with one identity per unit and no account.
    pub fn order_request(target: &str, quantity: u32) -> CreateOrderRequest {
        CreateOrderRequest {
            target: target.to_string(),
            quantity,
            executor_identities: identities(quantity),
            account_id: None,
            unit_price: None,
            idempotency_key: None,
        }
    }

    /// Order request charged to `account_id` at `unit_price`.
    pub fn paid_order_request(
        target: &str,
        quantity: u32,
        account_id: &str,
        unit_price: Decimal,
    ) -> CreateOrderRequest {
        CreateOrderRequest {
            account_id: Some(account_id.to_string()),
            unit_price: Some(unit_price),
            ..order_request(target, quantity)
        }
    }

    /// Scheduler settings tuned for tests: short intervals and timeouts.
    pub fn fast_scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_ms: 5,
            unit_execution_timeout_ms: 1000,
            sweep_interval_ms: 50,
            ..SchedulerConfig::default()
        }
    }

    /// Fully wired pipeline over an in-memory ledger.
    pub struct Harness {
        pub store: Arc<dyn LedgerStore>,
        pub metrics: Arc<PipelineMetrics>,
        pub orchestrator: Arc<OrderOrchestrator>,
        pub service: Arc<UnitExecutionService>,
        pub stats: Arc<SchedulerStats>,
        pub scheduler: ExecutionScheduler,
    }

    /// Wire a pipeline around `executor` with an in-memory store.
    pub fn harness(executor: Arc<dyn UnitExecutor>, config: SchedulerConfig) -> Harness {
        let store: Arc<dyn LedgerStore> =
            Arc::new(SqliteLedgerStore::in_memory().expect("in-memory ledger"));
        harness_with_store(store, executor, config)
    }

    /// Wire a pipeline around `executor` over an existing store.
    pub fn harness_with_store(
        store: Arc<dyn LedgerStore>,
        executor: Arc<dyn UnitExecutor>,
        config: SchedulerConfig,
    ) -> Harness {
        let metrics = Arc::new(PipelineMetrics::new().expect("pipeline metrics"));
        let orchestrator = Arc::new(OrderOrchestrator::new(
            Arc::clone(&store),
            TaskFactory::new(config.max_retries_per_unit),
            OrdersConfig::default(),
            Arc::clone(&metrics),
        ));
        let service = Arc::new(UnitExecutionService::new(
            Arc::clone(&store),
            executor,
            config.clone(),
            Arc::clone(&metrics),
        ));
        let stats = Arc::new(SchedulerStats::new());
        let scheduler = ExecutionScheduler::new(
            config,
            Arc::clone(&store),
            Arc::clone(&service),
            Arc::clone(&orchestrator),
            Arc::clone(&stats),
        );

        Harness {
            store,
            metrics,
            orchestrator,
            service,
            stats,
            scheduler,
        }
    }
}

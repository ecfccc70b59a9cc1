pub mod config;
pub mod execution;
pub mod executor;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod order;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, ExecutorBackend,
    SanitizedConfig,
};
pub use execution::{
    ExecutionError, ExecutionScheduler, SchedulerConfig, SchedulerStats, SchedulerStatus,
    UnitExecutionService,
};
pub use executor::{create_executor, ExecutorError, UnitExecutor};
pub use ledger::{LedgerError, LedgerStore, OrderFilter, SqliteLedgerStore};
pub use metrics::PipelineMetrics;
pub use orchestrator::{CreateOrderRequest, OrchestratorError, OrderOrchestrator};
pub use order::{Account, Order, OrderStatus, TaskFactory, Unit, UnitStatus};

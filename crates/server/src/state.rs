use std::sync::Arc;

use unitflow_core::{Config, ExecutionScheduler, OrderOrchestrator, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: Arc<OrderOrchestrator>,
    scheduler: Arc<ExecutionScheduler>,
}

impl AppState {
    pub fn new(
        config: Config,
        orchestrator: Arc<OrderOrchestrator>,
        scheduler: Arc<ExecutionScheduler>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            scheduler,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn orchestrator(&self) -> &OrderOrchestrator {
        self.orchestrator.as_ref()
    }

    pub fn scheduler(&self) -> &ExecutionScheduler {
        self.scheduler.as_ref()
    }
}

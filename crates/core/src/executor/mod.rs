//! Unit executor abstraction.
//!
//! This module provides a `UnitExecutor` trait for performing individual
//! units against the outside world, plus the backends shipped with the crate.

mod http;
mod simulated;
mod types;

use std::sync::Arc;

pub use http::HttpUnitExecutor;
pub use simulated::SimulatedUnitExecutor;
pub use types::*;

use crate::config::{ExecutorBackend, ExecutorConfig};

/// Build the executor selected by configuration.
pub fn create_executor(config: &ExecutorConfig) -> Result<Arc<dyn UnitExecutor>, ExecutorError> {
    match config.backend {
        ExecutorBackend::Simulated => Ok(Arc::new(SimulatedUnitExecutor::new(
            config.simulated.clone(),
        ))),
        ExecutorBackend::Http => {
            let http = config.http.clone().ok_or_else(|| {
                ExecutorError::Internal("executor.http is not configured".to_string())
            })?;
            Ok(Arc::new(HttpUnitExecutor::new(http)?))
        }
    }
}

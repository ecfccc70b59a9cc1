//! Scheduler configuration.

use serde::{Deserialize, Serialize};

use crate::order::DEFAULT_MAX_RETRIES;

/// Configuration for unit execution and the polling scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable/disable the background scheduler.
    /// When disabled, units stay pending until driven manually.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How often to poll for pending units (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum units executing at once in this process.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,

    /// Transport-failure retry budget given to new units.
    #[serde(default = "default_max_retries")]
    pub max_retries_per_unit: u32,

    /// Timeout applied to each executor call (milliseconds).
    #[serde(default = "default_execution_timeout")]
    pub unit_execution_timeout_ms: u64,

    /// Node name recorded on units claimed by this process.
    #[serde(default = "default_executor_node")]
    pub executor_node: String,

    /// Units executing for longer than this are reclaimed (milliseconds).
    #[serde(default = "default_stuck_grace")]
    pub stuck_unit_grace_ms: u64,

    /// How often the stuck-unit sweep runs (milliseconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    100
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_execution_timeout() -> u64 {
    5000 // 5 seconds
}

fn default_executor_node() -> String {
    "local-executor".to_string()
}

fn default_stuck_grace() -> u64 {
    30_000 // 30 seconds
}

fn default_sweep_interval() -> u64 {
    10_000 // 10 seconds
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_ms: default_poll_interval(),
            max_concurrent_tasks: default_max_concurrent(),
            max_retries_per_unit: default_max_retries(),
            unit_execution_timeout_ms: default_execution_timeout(),
            executor_node: default_executor_node(),
            stuck_unit_grace_ms: default_stuck_grace(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

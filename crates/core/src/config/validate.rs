use super::{
    types::{Config, ExecutorBackend},
    ConfigError,
};
use crate::order::exact_money;

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Scheduler limits and intervals are positive
/// - Simulated success rate is a fraction
/// - The http backend has its section
/// - Amounts fit the ledger's fixed scale
/// - Seeded accounts have unique ids and non-negative balances
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    let scheduler = &config.scheduler;
    if scheduler.max_concurrent_tasks == 0 {
        return Err(invalid("scheduler.max_concurrent_tasks must be at least 1"));
    }
    if scheduler.poll_interval_ms == 0 {
        return Err(invalid("scheduler.poll_interval_ms must be at least 1"));
    }
    if scheduler.max_retries_per_unit == 0 {
        return Err(invalid("scheduler.max_retries_per_unit must be at least 1"));
    }
    if scheduler.unit_execution_timeout_ms == 0 {
        return Err(invalid(
            "scheduler.unit_execution_timeout_ms must be at least 1",
        ));
    }
    if scheduler.executor_node.trim().is_empty() {
        return Err(invalid("scheduler.executor_node cannot be empty"));
    }
    if scheduler.stuck_unit_grace_ms <= scheduler.unit_execution_timeout_ms {
        return Err(invalid(
            "scheduler.stuck_unit_grace_ms must be greater than unit_execution_timeout_ms",
        ));
    }

    if config.orders.default_unit_price.is_sign_negative() {
        return Err(invalid("orders.default_unit_price cannot be negative"));
    }
    if let Err(e) = exact_money(config.orders.default_unit_price) {
        return Err(ConfigError::ValidationError(format!(
            "orders.default_unit_price: {}",
            e
        )));
    }
    if config.orders.max_quantity == 0 {
        return Err(invalid("orders.max_quantity must be at least 1"));
    }

    let rate = config.executor.simulated.success_rate;
    if !(0.0..=1.0).contains(&rate) {
        return Err(invalid("executor.simulated.success_rate must be between 0 and 1"));
    }

    if config.executor.backend == ExecutorBackend::Http {
        match config.executor.http {
            None => {
                return Err(invalid(
                    "executor.http section is required when backend = \"http\"",
                ))
            }
            Some(ref http) if http.url.trim().is_empty() => {
                return Err(invalid("executor.http.url cannot be empty"));
            }
            Some(_) => {}
        }
    }

    let mut seen = std::collections::HashSet::new();
    for account in &config.accounts {
        if account.id.trim().is_empty() {
            return Err(invalid("accounts.id cannot be empty"));
        }
        if account.balance.is_sign_negative() {
            return Err(ConfigError::ValidationError(format!(
                "account {} has a negative balance",
                account.id
            )));
        }
        if let Err(e) = exact_money(account.balance) {
            return Err(ConfigError::ValidationError(format!(
                "account {} balance: {}",
                account.id, e
            )));
        }
        if !seen.insert(account.id.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "account {} is listed more than once",
                account.id
            )));
        }
    }

    Ok(())
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::ValidationError(msg.to_string())
}

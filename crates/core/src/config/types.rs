use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::execution::SchedulerConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub orders: OrdersConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Accounts opened at startup if they do not exist yet.
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("unitflow.db")
}

/// Order intake configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrdersConfig {
    /// Price per unit applied when a request does not carry one.
    #[serde(default)]
    pub default_unit_price: Decimal,
    /// Largest quantity accepted for a single order.
    #[serde(default = "default_max_quantity")]
    pub max_quantity: u32,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            default_unit_price: Decimal::ZERO,
            max_quantity: default_max_quantity(),
        }
    }
}

fn default_max_quantity() -> u32 {
    100_000
}

/// Account seeded from config
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AccountSeed {
    pub id: String,
    #[serde(default)]
    pub balance: Decimal,
}

/// Available executor backends
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorBackend {
    #[default]
    Simulated,
    Http,
}

impl ExecutorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorBackend::Simulated => "simulated",
            ExecutorBackend::Http => "http",
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub backend: ExecutorBackend,
    /// Remote executor farm (required when backend = "http")
    #[serde(default)]
    pub http: Option<HttpExecutorConfig>,
    #[serde(default)]
    pub simulated: SimulatedExecutorConfig,
}

/// Remote executor farm configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpExecutorConfig {
    /// Endpoint that accepts unit commands (e.g., "http://farm:9000/execute")
    pub url: String,
    /// Sent as a bearer token when set
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
}

fn default_timeout() -> u32 {
    30
}

/// In-process simulated executor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatedExecutorConfig {
    /// Fraction of units that succeed (0.0-1.0)
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    /// Artificial latency per unit
    #[serde(default)]
    pub latency_ms: u64,
    /// Node name reported back
    #[serde(default = "default_sim_node")]
    pub node: String,
}

impl Default for SimulatedExecutorConfig {
    fn default() -> Self {
        Self {
            success_rate: default_success_rate(),
            latency_ms: 0,
            node: default_sim_node(),
        }
    }
}

fn default_success_rate() -> f64 {
    1.0
}

fn default_sim_node() -> String {
    "sim-node".to_string()
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub orders: OrdersConfig,
    pub executor: SanitizedExecutorConfig,
    /// Number of accounts seeded from config.
    pub seeded_accounts: usize,
}

/// Sanitized executor config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedExecutorConfig {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<SanitizedHttpExecutorConfig>,
    pub simulated: SimulatedExecutorConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedHttpExecutorConfig {
    pub url: String,
    pub api_key_configured: bool,
    pub timeout_secs: u32,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            scheduler: config.scheduler.clone(),
            orders: config.orders.clone(),
            executor: SanitizedExecutorConfig {
                backend: config.executor.backend.as_str().to_string(),
                http: config.executor.http.as_ref().map(|h| SanitizedHttpExecutorConfig {
                    url: h.url.clone(),
                    api_key_configured: h.api_key.as_deref().is_some_and(|k| !k.is_empty()),
                    timeout_secs: h.timeout_secs,
                }),
                simulated: config.executor.simulated.clone(),
            },
            seeded_accounts: config.accounts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert_eq!(config.database.path.to_str().unwrap(), "unitflow.db");
        assert_eq!(config.orders.default_unit_price, Decimal::ZERO);
        assert_eq!(config.orders.max_quantity, 100_000);
        assert_eq!(config.executor.backend, ExecutorBackend::Simulated);
        assert_eq!(config.executor.simulated.success_rate, 1.0);
        assert_eq!(config.executor.simulated.node, "sim-node");
        assert!(config.executor.http.is_none());
    }

    #[test]
    fn test_deserialize_server_and_database() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9000

[database]
path = "/data/orders.sqlite"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host.to_string(), "127.0.0.1");
        assert_eq!(config.database.path.to_str().unwrap(), "/data/orders.sqlite");
    }

    #[test]
    fn test_deserialize_orders_price_as_string() {
        let toml = r#"
[orders]
default_unit_price = "0.10"
max_quantity = 5000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.orders.default_unit_price, "0.10".parse::<Decimal>().unwrap());
        assert_eq!(config.orders.max_quantity, 5000);
    }

    #[test]
    fn test_deserialize_http_executor() {
        let toml = r#"
[executor]
backend = "http"

[executor.http]
url = "http://farm:9000/execute"
api_key = "secret"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.executor.backend, ExecutorBackend::Http);
        let http = config.executor.http.as_ref().unwrap();
        assert_eq!(http.url, "http://farm:9000/execute");
        assert_eq!(http.api_key.as_deref(), Some("secret"));
        assert_eq!(http.timeout_secs, 30); // default
    }

    #[test]
    fn test_sanitized_config_hides_api_key() {
        let config = Config {
            executor: ExecutorConfig {
                backend: ExecutorBackend::Http,
                http: Some(HttpExecutorConfig {
                    url: "http://farm".to_string(),
                    api_key: Some("secret-key".to_string()),
                    timeout_secs: 60,
                }),
                simulated: SimulatedExecutorConfig::default(),
            },
            ..Config::default()
        };

        let sanitized = SanitizedConfig::from(&config);
        assert_eq!(sanitized.executor.backend, "http");
        let http = sanitized.executor.http.as_ref().unwrap();
        assert!(http.api_key_configured);
        assert_eq!(http.timeout_secs, 60);

        let json = serde_json::to_string(&sanitized).unwrap();
        assert!(!json.contains("secret-key"));
    }

    #[test]
    fn test_deserialize_accounts() {
        let toml = r#"
[[accounts]]
id = "acme"
balance = "500.00"

[[accounts]]
id = "empty"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].id, "acme");
        assert_eq!(config.accounts[0].balance, "500".parse::<Decimal>().unwrap());
        assert_eq!(config.accounts[1].balance, Decimal::ZERO);
        assert_eq!(SanitizedConfig::from(&config).seeded_accounts, 2);
    }
}

//! Remote executor farm over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::HttpExecutorConfig;

use super::{ExecutionReport, ExecutorError, UnitCommand, UnitExecutor};

/// Executor that POSTs each unit command as JSON to a remote endpoint and
/// expects an `ExecutionReport` back.
///
/// Network errors and non-2xx responses are transport failures. A 2xx body
/// with `success = false` is a business failure.
pub struct HttpUnitExecutor {
    client: Client,
    config: HttpExecutorConfig,
}

impl HttpUnitExecutor {
    pub fn new(config: HttpExecutorConfig) -> Result<Self, ExecutorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| ExecutorError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn map_send_error(&self, e: reqwest::Error) -> ExecutorError {
        if e.is_timeout() {
            ExecutorError::Timeout(self.config.timeout_secs as u64 * 1000)
        } else if e.is_connect() {
            ExecutorError::ConnectionFailed(e.to_string())
        } else {
            ExecutorError::Api(e.to_string())
        }
    }
}

#[async_trait]
impl UnitExecutor for HttpUnitExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, command: UnitCommand) -> Result<ExecutionReport, ExecutorError> {
        let mut request = self.client.post(&self.config.url).json(&command);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Api(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let report: ExecutionReport = response
            .json()
            .await
            .map_err(|e| ExecutorError::Api(format!("invalid executor response: {}", e)))?;

        debug!(
            unit_id = %command.unit_id,
            success = report.success,
            node = %report.node_used,
            "Remote executor responded"
        );

        Ok(report)
    }
}

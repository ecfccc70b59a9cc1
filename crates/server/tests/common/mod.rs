//! Common test utilities for in-process API testing with a mock executor.
//!
//! The fixture wires the real orchestrator, execution service and scheduler
//! over a temporary SQLite ledger, with a scripted `MockUnitExecutor` in place
//! of a remote executor farm.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use unitflow_core::{
    config::DatabaseConfig,
    execution::SchedulerConfig,
    testing::{fixtures, MockUnitExecutor},
    Config, ExecutionScheduler, LedgerStore, OrderOrchestrator, SqliteLedgerStore,
};
use unitflow_server::state::AppState;

/// In-process server over a temporary ledger.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_order_creation() {
///     let fixture = TestFixture::new();
///
///     let response = fixture.post("/api/v1/orders", json!({
///         "target": "target://x",
///         "quantity": 1,
///         "executor_identities": ["id-0"]
///     })).await;
///
///     assert_eq!(response.status, 201);
/// }
/// ```
pub struct TestFixture {
    pub router: Router,
    /// Scripted executor, configure per-identity outcomes here
    pub executor: Arc<MockUnitExecutor>,
    pub orchestrator: Arc<OrderOrchestrator>,
    /// Not started; tests start it when they want units to move
    pub scheduler: Arc<ExecutionScheduler>,
    pub store: Arc<dyn LedgerStore>,
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let store: Arc<dyn LedgerStore> =
            Arc::new(SqliteLedgerStore::new(&db_path).expect("Failed to create ledger store"));
        let executor = Arc::new(MockUnitExecutor::new());

        let scheduler_config = SchedulerConfig {
            max_concurrent_tasks: 20,
            ..fixtures::fast_scheduler_config()
        };
        let config = Config {
            database: DatabaseConfig { path: db_path },
            scheduler: scheduler_config.clone(),
            ..Config::default()
        };

        let harness =
            fixtures::harness_with_store(Arc::clone(&store), executor.clone(), scheduler_config);
        let orchestrator = harness.orchestrator;
        let scheduler = Arc::new(harness.scheduler);

        let state = Arc::new(AppState::new(
            config,
            Arc::clone(&orchestrator),
            Arc::clone(&scheduler),
        ));
        let router = unitflow_server::api::create_router(state);

        Self {
            router,
            executor,
            orchestrator,
            scheduler,
            store,
            temp_dir,
        }
    }

    /// Poll an order over the API until it reaches a terminal status.
    pub async fn wait_for_terminal(&self, order_id: &str) -> Value {
        for _ in 0..1000 {
            let response = self.get(&format!("/api/v1/orders/{}", order_id)).await;
            let status = response.body["status"].as_str().unwrap_or_default().to_string();
            if matches!(status.as_str(), "completed" | "failed" | "cancelled") {
                return response.body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("order {} did not finish", order_id);
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a GET request and return the raw text body.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// JSON body for an order with one identity per unit.
pub fn order_body(target: &str, quantity: u32) -> Value {
    serde_json::json!({
        "target": target,
        "quantity": quantity,
        "executor_identities": fixtures::identities(quantity),
    })
}

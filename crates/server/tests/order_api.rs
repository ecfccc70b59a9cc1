//! Order API tests against an in-process router.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{order_body, TestFixture};
use unitflow_core::testing::MockBehavior;

#[tokio::test]
async fn test_health_and_config() {
    let fixture = TestFixture::new();

    let response = fixture.get("/api/v1/health").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");

    let response = fixture.get("/api/v1/config").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["executor"]["backend"], "simulated");
    assert_eq!(response.body["scheduler"]["max_concurrent_tasks"], 20);
}

#[tokio::test]
async fn test_create_and_get_order() {
    let fixture = TestFixture::new();

    let response = fixture
        .post("/api/v1/orders", order_body("target://api", 3))
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["status"], "active");
    assert_eq!(response.body["quantity"], 3);
    assert_eq!(response.body["remains"], 3);
    let order_id = response.body["id"].as_str().unwrap().to_string();

    let response = fixture.get(&format!("/api/v1/orders/{}", order_id)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["target"], "target://api");

    let response = fixture
        .get(&format!("/api/v1/orders/{}/units", order_id))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["total"], 3);
    assert_eq!(response.body["units"][0]["status"], "pending");
    assert_eq!(response.body["units"][0]["executor_identity"], "identity-0");
}

#[tokio::test]
async fn test_create_order_validation() {
    let fixture = TestFixture::new();

    let response = fixture
        .post(
            "/api/v1/orders",
            json!({ "target": "t", "quantity": 2, "executor_identities": ["only-one"] }),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.body["error"].as_str().unwrap().contains("quantity"));

    let response = fixture.post("/api/v1/orders", order_body("", 1)).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_order_is_404() {
    let fixture = TestFixture::new();

    assert_eq!(
        fixture.get("/api/v1/orders/nope").await.status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        fixture.get("/api/v1/orders/nope/units").await.status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        fixture.post_empty("/api/v1/orders/nope/cancel").await.status,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_paid_order_and_idempotent_replay() {
    let fixture = TestFixture::new();

    let response = fixture
        .post("/api/v1/accounts", json!({ "id": "acme", "balance": "10" }))
        .await;
    assert_eq!(response.status, StatusCode::CREATED);

    let mut body = order_body("target://paid", 4);
    body["account_id"] = json!("acme");
    body["unit_price"] = json!("1.5");
    body["idempotency_key"] = json!("req-1");

    let first = fixture.post("/api/v1/orders", body.clone()).await;
    assert_eq!(first.status, StatusCode::CREATED);
    let second = fixture.post("/api/v1/orders", body).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(first.body["id"], second.body["id"]);

    let account = fixture.get("/api/v1/accounts/acme").await;
    assert_eq!(account.status, StatusCode::OK);
    assert_eq!(account.body["balance"], "4.0000");
}

#[tokio::test]
async fn test_unstorable_amounts_are_400() {
    let fixture = TestFixture::new();

    let response = fixture
        .post("/api/v1/accounts", json!({ "id": "acme", "balance": "1" }))
        .await;
    assert_eq!(response.status, StatusCode::CREATED);

    for price in ["0.00015", "79228162514264337593543950335"] {
        let mut body = order_body("target://odd-price", 2);
        body["account_id"] = json!("acme");
        body["unit_price"] = json!(price);
        let response = fixture.post("/api/v1/orders", body).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "price {}", price);
    }

    let response = fixture
        .post(
            "/api/v1/accounts",
            json!({ "id": "whale", "balance": "1000000000000000" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let account = fixture.get("/api/v1/accounts/acme").await;
    assert_eq!(account.body["balance"], "1.0000");
}

#[tokio::test]
async fn test_insufficient_balance_is_402() {
    let fixture = TestFixture::new();
    fixture
        .post("/api/v1/accounts", json!({ "id": "poor", "balance": "1" }))
        .await;

    let mut body = order_body("target://x", 5);
    body["account_id"] = json!("poor");
    body["unit_price"] = json!("1");

    let response = fixture.post("/api/v1/orders", body).await;
    assert_eq!(response.status, StatusCode::PAYMENT_REQUIRED);

    let mut body = order_body("target://x", 1);
    body["account_id"] = json!("ghost");
    let response = fixture.post("/api/v1/orders", body).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_account_is_409() {
    let fixture = TestFixture::new();
    let body = json!({ "id": "acme", "balance": "1" });
    assert_eq!(
        fixture.post("/api/v1/accounts", body.clone()).await.status,
        StatusCode::CREATED
    );
    assert_eq!(
        fixture.post("/api/v1/accounts", body).await.status,
        StatusCode::CONFLICT
    );
}

#[tokio::test]
async fn test_list_orders_with_filters() {
    let fixture = TestFixture::new();
    for i in 0..3 {
        fixture
            .post("/api/v1/orders", order_body(&format!("target://{}", i), 1))
            .await;
    }

    let response = fixture.get("/api/v1/orders?limit=2").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["orders"].as_array().unwrap().len(), 2);
    assert_eq!(response.body["total"], 3);
    assert_eq!(response.body["limit"], 2);

    let response = fixture.get("/api/v1/orders?status=active").await;
    assert_eq!(response.body["total"], 3);

    let response = fixture.get("/api/v1/orders?status=completed").await;
    assert_eq!(response.body["total"], 0);

    let response = fixture.get("/api/v1/orders?status=bogus").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_order() {
    let fixture = TestFixture::new();
    fixture
        .post("/api/v1/accounts", json!({ "id": "acme", "balance": "5" }))
        .await;
    let mut body = order_body("target://c", 5);
    body["account_id"] = json!("acme");
    body["unit_price"] = json!("1");
    let order_id = fixture.post("/api/v1/orders", body).await.body["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = fixture
        .post(
            &format!("/api/v1/orders/{}/cancel", order_id),
            json!({ "reason": "changed my mind" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["order"]["status"], "cancelled");
    assert_eq!(response.body["order"]["failure_reason"], "changed my mind");
    assert_eq!(response.body["refunded_units"], 5);

    let account = fixture.get("/api/v1/accounts/acme").await;
    assert_eq!(account.body["balance"], "5.0000");

    // Already terminal
    let response = fixture
        .post_empty(&format!("/api/v1/orders/{}/cancel", order_id))
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_order_runs_to_completion_with_refunds() {
    let fixture = TestFixture::new();
    fixture
        .executor
        .set_behavior("identity-1", MockBehavior::Reject("banned".to_string()))
        .await;
    fixture
        .post("/api/v1/accounts", json!({ "id": "acme", "balance": "10" }))
        .await;

    let mut body = order_body("target://run", 4);
    body["account_id"] = json!("acme");
    body["unit_price"] = json!("2");
    let order_id = fixture.post("/api/v1/orders", body).await.body["id"]
        .as_str()
        .unwrap()
        .to_string();

    fixture.scheduler.start().await;
    let order = fixture.wait_for_terminal(&order_id).await;
    fixture.scheduler.stop().await;

    assert_eq!(order["status"], "failed");
    assert_eq!(order["delivered"], 3);
    assert_eq!(order["failed_permanent"], 1);
    assert_eq!(order["refund_amount"], "2.0000");
    assert_eq!(order["failure_reason"], "1 of 4 units failed permanently");

    let account = fixture.get("/api/v1/accounts/acme").await;
    assert_eq!(account.body["balance"], "4.0000");

    let report = fixture
        .get(&format!("/api/v1/orders/{}/invariants", order_id))
        .await;
    assert_eq!(report.status, StatusCode::OK);
    assert_eq!(report.body["ok"], true);

    let metrics = fixture.get("/api/v1/metrics/orders").await;
    assert_eq!(metrics.status, StatusCode::OK);
    assert_eq!(metrics.body["total_orders"], 1);
    assert_eq!(metrics.body["total_delivered"], 3);
    assert_eq!(metrics.body["total_failed_permanent"], 1);

    let scheduler = fixture.get("/api/v1/scheduler").await;
    assert_eq!(scheduler.body["running"], false);
    assert_eq!(scheduler.body["executor"], "mock");
    assert_eq!(scheduler.body["stats"]["tasks_executed"], 4);
}

#[tokio::test]
async fn test_prometheus_endpoint() {
    let fixture = TestFixture::new();
    fixture.get("/api/v1/health").await;

    let (status, text) = fixture.get_text("/api/v1/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("unitflow_http_requests_total"));
    assert!(text.contains("unitflow_scheduler_running"));
}

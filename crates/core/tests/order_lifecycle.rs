//! Order lifecycle integration tests.
//!
//! These tests run orders end to end through the scheduler with a scripted
//! executor: creation and charging, dispatch, retries, settlement, refunds
//! and cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tempfile::TempDir;

use unitflow_core::{
    execution::{ExecutionError, SchedulerConfig},
    executor::ExecutorError,
    ledger::{LedgerStore, OrderCreation, SqliteLedgerStore},
    orchestrator::{OrchestratorError, OrderOrchestrator},
    testing::{fixtures, MockBehavior, MockUnitExecutor},
    Order, OrderStatus, UnitStatus,
};

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

/// Poll until the order reaches a terminal status.
async fn wait_for_terminal(orchestrator: &OrderOrchestrator, order_id: &str) -> Order {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let order = orchestrator.get_order(order_id).unwrap();
        if order.status.is_terminal() {
            return order;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("order {} stuck in {}", order_id, order.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn wide_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks: 50,
        ..fixtures::fast_scheduler_config()
    }
}

#[tokio::test]
async fn test_happy_path_delivers_every_unit() {
    let executor = Arc::new(MockUnitExecutor::new());
    let h = fixtures::harness(executor.clone(), wide_config());
    h.orchestrator.open_account("acct", dec("100")).unwrap();

    let order = h
        .orchestrator
        .create_order(fixtures::paid_order_request("target://a", 500, "acct", dec("0.10")))
        .unwrap()
        .into_order();
    assert_eq!(order.status, OrderStatus::Active);
    assert_eq!(order.charged, dec("50"));
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("50"));

    h.scheduler.start().await;
    let order = wait_for_terminal(&h.orchestrator, &order.id).await;
    h.scheduler.stop().await;

    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.delivered, 500);
    assert_eq!(order.failed_permanent, 0);
    assert_eq!(order.remains, 0);
    assert_eq!(order.refund_amount, Decimal::ZERO);
    assert!(order.completed_at.is_some());
    assert_eq!(executor.call_count().await, 500);

    let units = h.orchestrator.get_units(&order.id).unwrap();
    assert!(units.iter().all(|u| u.status == UnitStatus::Completed));
    assert!(units.iter().all(|u| u.is_well_formed()));

    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("50"));
    assert!(h.orchestrator.verify_invariants(&order.id).unwrap().ok);
}

#[tokio::test]
async fn test_partial_failure_refunds_failed_units() {
    let executor = Arc::new(MockUnitExecutor::new());
    for identity in fixtures::identities(2000).into_iter().take(1600) {
        executor
            .set_behavior(identity, MockBehavior::Reject("account banned".to_string()))
            .await;
    }
    let h = fixtures::harness(executor.clone(), wide_config());
    h.orchestrator.open_account("acct", dec("500")).unwrap();

    let order = h
        .orchestrator
        .create_order(fixtures::paid_order_request("target://b", 2000, "acct", dec("0.10")))
        .unwrap()
        .into_order();
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("300"));

    h.scheduler.start().await;
    let order = wait_for_terminal(&h.orchestrator, &order.id).await;
    h.scheduler.stop().await;

    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.delivered, 400);
    assert_eq!(order.failed_permanent, 1600);
    assert_eq!(order.remains, 0);
    assert_eq!(order.refund_amount, dec("160"));
    assert_eq!(
        order.failure_reason.as_deref(),
        Some("1600 of 2000 units failed permanently")
    );
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("460"));

    let refunds = h.store.list_refund_events(&order.id).unwrap();
    assert_eq!(refunds.len(), 1600);
    assert!(refunds.iter().all(|r| r.amount == dec("0.10")));

    let report = h.orchestrator.verify_invariants(&order.id).unwrap();
    assert!(report.ok, "violations: {:?}", report.violations);
}

#[tokio::test]
async fn test_duplicate_idempotency_key_charges_once() {
    let executor = Arc::new(MockUnitExecutor::new());
    let h = fixtures::harness(executor, fixtures::fast_scheduler_config());
    h.orchestrator.open_account("acct", dec("10")).unwrap();

    let mut request = fixtures::paid_order_request("target://c", 20, "acct", dec("0.25"));
    request.idempotency_key = Some("req-42".to_string());

    let first = h.orchestrator.create_order(request.clone()).unwrap();
    let second = h.orchestrator.create_order(request).unwrap();

    assert!(first.is_created());
    assert!(matches!(second, OrderCreation::Existing(_)));
    assert_eq!(first.order().id, second.order().id);
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("5"));
    assert_eq!(h.store.list_units(&first.order().id).unwrap().len(), 20);
}

#[tokio::test]
async fn test_retries_until_exhausted() {
    let executor = Arc::new(MockUnitExecutor::new());
    executor
        .set_behavior(
            "identity-0",
            MockBehavior::FailAlways(ExecutorError::ConnectionFailed("reset".to_string())),
        )
        .await;
    executor
        .set_behavior(
            "identity-1",
            MockBehavior::FailTransport {
                error: ExecutorError::Timeout(50),
                times: 2,
            },
        )
        .await;
    let h = fixtures::harness(executor.clone(), fixtures::fast_scheduler_config());
    h.orchestrator.open_account("acct", dec("1")).unwrap();

    let order = h
        .orchestrator
        .create_order(fixtures::paid_order_request("target://d", 2, "acct", dec("0.5")))
        .unwrap()
        .into_order();

    h.scheduler.start().await;
    let order = wait_for_terminal(&h.orchestrator, &order.id).await;
    h.scheduler.stop().await;

    let units = h.orchestrator.get_units(&order.id).unwrap();
    let exhausted = units
        .iter()
        .find(|u| u.executor_identity == "identity-0")
        .unwrap();
    assert_eq!(exhausted.status, UnitStatus::Failed);
    assert_eq!(exhausted.retry_count, 3);
    assert!(exhausted.refunded);
    assert_eq!(executor.calls_for_unit(&exhausted.id).await.len(), 3);

    let recovered = units
        .iter()
        .find(|u| u.executor_identity == "identity-1")
        .unwrap();
    assert_eq!(recovered.status, UnitStatus::Completed);
    assert_eq!(recovered.retry_count, 2);
    assert!(!recovered.refunded);

    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.refund_amount, dec("0.5"));
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("0.5"));
    assert!(h.stats.snapshot().tasks_executed >= 5);
}

#[tokio::test]
async fn test_concurrent_outcome_recording_refunds_once() {
    let executor = Arc::new(MockUnitExecutor::with_default(MockBehavior::Reject(
        "rejected".to_string(),
    )));
    let h = fixtures::harness(executor, fixtures::fast_scheduler_config());
    h.orchestrator.open_account("acct", dec("10")).unwrap();

    let order = h
        .orchestrator
        .create_order(fixtures::paid_order_request("target://e", 1, "acct", dec("2")))
        .unwrap()
        .into_order();
    let unit = h.orchestrator.get_units(&order.id).unwrap().remove(0);

    // Execute without recording, then record from many tasks at once.
    let unit = h.service.execute(unit).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Failed);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let orchestrator = Arc::clone(&h.orchestrator);
        let unit_id = unit.id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            orchestrator.record_unit_outcome(&unit_id)
        }));
    }
    for handle in futures::future::join_all(handles).await {
        handle.unwrap().unwrap();
    }

    let order = h.orchestrator.get_order(&order.id).unwrap();
    assert_eq!(order.failed_permanent, 1);
    assert_eq!(order.refund_amount, dec("2"));
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("10"));
    assert_eq!(h.store.list_refund_events(&order.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_refunds_apply_once() {
    let executor = Arc::new(MockUnitExecutor::new());
    let h = fixtures::harness(executor, fixtures::fast_scheduler_config());
    h.orchestrator.open_account("acct", dec("3")).unwrap();

    let order = h
        .orchestrator
        .create_order(fixtures::paid_order_request("target://f", 3, "acct", dec("1")))
        .unwrap()
        .into_order();
    let unit = h.orchestrator.get_units(&order.id).unwrap().remove(0);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&h.store);
        let unit_id = unit.id.clone();
        let order_id = order.id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            store.process_refund(&unit_id, &order_id, "acct", 1, dec("1"))
        }));
    }

    let mut applied = 0;
    for handle in futures::future::join_all(handles).await {
        if handle.unwrap().unwrap().applied {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("1"));
    assert_eq!(h.orchestrator.get_order(&order.id).unwrap().refund_amount, dec("1"));
}

#[tokio::test]
async fn test_cancel_refunds_unstarted_units() {
    let executor = Arc::new(MockUnitExecutor::new());
    let h = fixtures::harness(executor.clone(), fixtures::fast_scheduler_config());
    h.orchestrator.open_account("acct", dec("10")).unwrap();

    let order = h
        .orchestrator
        .create_order(fixtures::paid_order_request("target://g", 10, "acct", dec("1")))
        .unwrap()
        .into_order();

    // Finish two units by hand before cancelling.
    let units = h.orchestrator.get_units(&order.id).unwrap();
    for unit in units.iter().take(2) {
        let done = h.service.execute(unit.clone()).await.unwrap();
        h.orchestrator.record_unit_outcome(&done.id).unwrap();
    }

    let cancellation = h.orchestrator.cancel_order(&order.id, "customer request").unwrap();
    assert_eq!(cancellation.order.status, OrderStatus::Cancelled);
    assert_eq!(cancellation.refunds.len(), 8);
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("8"));

    // Nothing is dispatched for a cancelled order.
    executor.clear_recorded().await;
    h.scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.scheduler.stop().await;
    assert_eq!(executor.call_count().await, 0);

    let order = h.orchestrator.get_order(&order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.delivered, 2);
    assert_eq!(order.failure_reason.as_deref(), Some("customer request"));
    assert!(h.orchestrator.cancel_order(&order.id, "again").is_err());
}

#[tokio::test]
async fn test_cancel_between_fetch_and_claim_dispatches_nothing() {
    let executor = Arc::new(MockUnitExecutor::new());
    let h = fixtures::harness(executor.clone(), fixtures::fast_scheduler_config());
    h.orchestrator.open_account("acct", dec("10")).unwrap();

    let order = h
        .orchestrator
        .create_order(fixtures::paid_order_request("target://race", 3, "acct", dec("1")))
        .unwrap()
        .into_order();

    // A worker fetched the page, then the order was cancelled before it claimed.
    let fetched = h.store.fetch_pending_units(10).unwrap();
    assert_eq!(fetched.len(), 3);
    h.orchestrator.cancel_order(&order.id, "customer request").unwrap();

    for unit in fetched {
        let result = h.service.execute(unit).await;
        assert!(matches!(result, Err(ExecutionError::InvalidState(_))));
    }
    assert_eq!(executor.call_count().await, 0);

    let order = h.orchestrator.get_order(&order.id).unwrap();
    assert_eq!(order.delivered, 0);
    assert_eq!(order.refund_amount, dec("3"));
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("10"));
    for unit in h.orchestrator.get_units(&order.id).unwrap() {
        assert_eq!(unit.status, UnitStatus::Pending);
        assert!(unit.refunded);
    }
}

#[tokio::test]
async fn test_cancel_with_units_in_flight_conserves_balance() {
    let executor = Arc::new(MockUnitExecutor::new());
    executor.set_latency(Duration::from_millis(100)).await;
    executor
        .set_behavior("identity-1", MockBehavior::Reject("sold out".to_string()))
        .await;
    let config = SchedulerConfig {
        max_concurrent_tasks: 4,
        ..fixtures::fast_scheduler_config()
    };
    let h = fixtures::harness(executor.clone(), config);
    h.orchestrator.open_account("acct", dec("20")).unwrap();

    let order = h
        .orchestrator
        .create_order(fixtures::paid_order_request("target://busy", 10, "acct", dec("1.5")))
        .unwrap()
        .into_order();
    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("5"));

    h.scheduler.start().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while executor.call_count().await < 4 {
        assert!(tokio::time::Instant::now() < deadline, "units never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let cancellation = h.orchestrator.cancel_order(&order.id, "customer request").unwrap();
    assert_eq!(cancellation.refunds.len(), 6);
    h.scheduler.stop().await;

    // The four running units finished and settled against the cancelled order.
    assert_eq!(executor.call_count().await, 4);
    let order = h.orchestrator.get_order(&order.id).unwrap();
    let units = h.orchestrator.get_units(&order.id).unwrap();
    let refunded = units.iter().filter(|u| u.refunded).count() as u32;
    let delivered = units
        .iter()
        .filter(|u| u.status == UnitStatus::Completed)
        .count() as u32;

    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.delivered, delivered);
    assert!(units
        .iter()
        .all(|u| u.status != UnitStatus::Completed || !u.refunded));
    assert_eq!(delivered + refunded, 10);
    assert_eq!(order.refund_amount, Decimal::from(refunded) * dec("1.5"));
    assert_eq!(
        h.orchestrator.get_account("acct").unwrap().balance,
        dec("20") - order.charged + order.refund_amount
    );
    assert!(h.orchestrator.verify_invariants(&order.id).unwrap().ok);
}

#[tokio::test]
async fn test_unstorable_amounts_are_rejected_without_charging() {
    let executor = Arc::new(MockUnitExecutor::new());
    let h = fixtures::harness(executor, fixtures::fast_scheduler_config());
    h.orchestrator.open_account("acct", dec("1")).unwrap();

    let too_precise = fixtures::paid_order_request("target://p", 10, "acct", dec("0.00015"));
    assert!(matches!(
        h.orchestrator.create_order(too_precise),
        Err(OrchestratorError::InvalidArgument(_))
    ));

    let overflowing = fixtures::paid_order_request("target://p", 2, "acct", Decimal::MAX);
    assert!(matches!(
        h.orchestrator.create_order(overflowing),
        Err(OrchestratorError::InvalidArgument(_))
    ));

    let too_large = fixtures::paid_order_request("target://p", 2, "acct", dec("500000000000000"));
    assert!(matches!(
        h.orchestrator.create_order(too_large),
        Err(OrchestratorError::InvalidArgument(_))
    ));

    assert!(matches!(
        h.orchestrator.open_account("whale", dec("1000000000000000")),
        Err(OrchestratorError::InvalidArgument(_))
    ));

    assert_eq!(h.orchestrator.get_account("acct").unwrap().balance, dec("1"));
    assert_eq!(
        h.orchestrator
            .count_orders(&unitflow_core::OrderFilter::new())
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_stuck_units_are_reclaimed_on_start() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("ledger.db");
    let store: Arc<dyn LedgerStore> =
        Arc::new(SqliteLedgerStore::new(&db_path).expect("Failed to open ledger"));

    let executor = Arc::new(MockUnitExecutor::new());
    let config = SchedulerConfig {
        stuck_unit_grace_ms: 1000,
        ..fixtures::fast_scheduler_config()
    };
    let h = fixtures::harness_with_store(store, executor.clone(), config);

    let order = h
        .orchestrator
        .create_order(fixtures::order_request("target://h", 3))
        .unwrap()
        .into_order();

    // Simulate a worker that died mid-execution in a previous process.
    let mut stuck = h.orchestrator.get_units(&order.id).unwrap().remove(0);
    stuck.status = UnitStatus::Executing;
    stuck.started_at = Some(Utc::now() - chrono::Duration::minutes(5));
    stuck.assigned_node = Some("crashed-node".to_string());
    h.store.transition_unit(&stuck, UnitStatus::Pending).unwrap();

    h.scheduler.start().await;
    let order = wait_for_terminal(&h.orchestrator, &order.id).await;
    h.scheduler.stop().await;

    assert_eq!(order.status, OrderStatus::Completed);
    let unit = h.store.get_unit(&stuck.id).unwrap().unwrap();
    assert_eq!(unit.status, UnitStatus::Completed);
    assert_eq!(unit.retry_count, 1);
    assert_eq!(h.stats.snapshot().tasks_reclaimed, 1);
}

#[tokio::test]
async fn test_in_flight_never_exceeds_limit() {
    let executor = Arc::new(MockUnitExecutor::new());
    executor.set_latency(Duration::from_millis(5)).await;
    let config = SchedulerConfig {
        max_concurrent_tasks: 4,
        ..fixtures::fast_scheduler_config()
    };
    let h = fixtures::harness(executor.clone(), config);

    let order = h
        .orchestrator
        .create_order(fixtures::order_request("target://i", 60))
        .unwrap()
        .into_order();

    h.scheduler.start().await;
    let order = wait_for_terminal(&h.orchestrator, &order.id).await;
    h.scheduler.stop().await;

    assert_eq!(order.status, OrderStatus::Completed);
    assert!(executor.max_in_flight() <= 4);
    assert!(executor.max_in_flight() >= 2);
}

#[tokio::test]
async fn test_scheduler_status_reports_counters() {
    let executor = Arc::new(MockUnitExecutor::new());
    let h = fixtures::harness(executor, fixtures::fast_scheduler_config());

    let status = h.scheduler.status().await;
    assert!(!status.running);
    assert_eq!(status.executor, "mock");
    assert_eq!(status.max_concurrent_tasks, 10);

    let order = h
        .orchestrator
        .create_order(fixtures::order_request("target://j", 4))
        .unwrap()
        .into_order();
    h.scheduler.start().await;
    wait_for_terminal(&h.orchestrator, &order.id).await;

    let status = h.scheduler.status().await;
    assert!(status.running);
    assert_eq!(status.stats.tasks_polled, 4);
    assert_eq!(status.stats.tasks_executed, 4);
    h.scheduler.stop().await;
}

//! Order and account API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use unitflow_core::{
    ledger::OrderCreation,
    orchestrator::{InvariantReport, OrderMetrics},
    Account, CreateOrderRequest, OrchestratorError, Order, OrderFilter, OrderStatus, Unit,
};

use crate::state::AppState;

/// Maximum allowed limit for order queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for order queries
const DEFAULT_LIMIT: i64 = 100;

const DEFAULT_CANCEL_REASON: &str = "cancelled via API";

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for listing orders
#[derive(Debug, Deserialize)]
pub struct ListOrdersParams {
    /// Filter by status
    pub status: Option<String>,
    /// Filter by paying account
    pub account_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Request body for cancelling an order
#[derive(Debug, Deserialize)]
pub struct CancelOrderBody {
    pub reason: Option<String>,
}

/// Request body for opening an account
#[derive(Debug, Deserialize)]
pub struct OpenAccountBody {
    pub id: String,
    #[serde(default)]
    pub balance: Decimal,
}

#[derive(Debug, Serialize)]
pub struct ListOrdersResponse {
    pub orders: Vec<Order>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct OrderUnitsResponse {
    pub order_id: String,
    pub units: Vec<Unit>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct CancelOrderResponse {
    pub order: Order,
    /// Units refunded because they never started.
    pub refunded_units: usize,
    pub refunded_amount: Decimal,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

impl From<OrchestratorError> for ErrorResponse {
    fn from(e: OrchestratorError) -> Self {
        Self {
            error: e.to_string(),
        }
    }
}

/// Map an orchestrator error onto an HTTP status.
fn error_status(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::InvalidState(_) | OrchestratorError::AccountExists(_) => {
            StatusCode::CONFLICT
        }
        OrchestratorError::OrderNotFound(_)
        | OrchestratorError::UnitNotFound(_)
        | OrchestratorError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        OrchestratorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn into_api_error(e: OrchestratorError) -> ApiError {
    let status = error_status(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Order API failure: {}", e);
    }
    (status, Json(ErrorResponse::from(e)))
}

// ============================================================================
// Order handlers
// ============================================================================

/// Create an order. Replaying an idempotency key returns the existing order
/// with 200 instead of 201.
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    match state.orchestrator().create_order(body) {
        Ok(OrderCreation::Created(order)) => Ok((StatusCode::CREATED, Json(order))),
        Ok(OrderCreation::Existing(order)) => Ok((StatusCode::OK, Json(order))),
        Err(e) => Err(into_api_error(e)),
    }
}

/// Get an order by ID
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    state
        .orchestrator()
        .get_order(&id)
        .map(Json)
        .map_err(into_api_error)
}

/// List orders with optional filters
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListOrdersParams>,
) -> Result<Json<ListOrdersResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = OrderFilter::new().with_limit(limit).with_offset(offset);

    if let Some(ref status) = params.status {
        let status = OrderStatus::parse(status).ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                format!("Unknown order status: {}", status),
            )
        })?;
        filter = filter.with_status(status);
    }

    if let Some(ref account_id) = params.account_id {
        filter = filter.with_account(account_id);
    }

    let orders = state
        .orchestrator()
        .list_orders(&filter)
        .map_err(into_api_error)?;

    // Total ignores pagination
    let count_filter = OrderFilter {
        limit: i64::MAX,
        offset: 0,
        ..filter.clone()
    };
    let total = state
        .orchestrator()
        .count_orders(&count_filter)
        .map_err(into_api_error)?;

    Ok(Json(ListOrdersResponse {
        orders,
        total,
        limit,
        offset,
    }))
}

/// List the units of an order
pub async fn get_order_units(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderUnitsResponse>, ApiError> {
    let units = state.orchestrator().get_units(&id).map_err(into_api_error)?;
    Ok(Json(OrderUnitsResponse {
        order_id: id,
        total: units.len(),
        units,
    }))
}

/// Audit an order against its units and refund events
pub async fn get_order_invariants(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<InvariantReport>, ApiError> {
    state
        .orchestrator()
        .verify_invariants(&id)
        .map(Json)
        .map_err(into_api_error)
}

/// Cancel an order, refunding units that never started
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelOrderBody>>,
) -> Result<Json<CancelOrderResponse>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

    let cancellation = state
        .orchestrator()
        .cancel_order(&id, &reason)
        .map_err(into_api_error)?;

    let refunded_amount: Decimal = cancellation
        .refunds
        .iter()
        .filter(|r| r.applied)
        .map(|r| r.amount)
        .sum();

    Ok(Json(CancelOrderResponse {
        refunded_units: cancellation.refunds.iter().filter(|r| r.applied).count(),
        refunded_amount,
        order: cancellation.order,
    }))
}

/// Aggregate order and unit metrics
pub async fn get_order_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<OrderMetrics>, ApiError> {
    state
        .orchestrator()
        .get_metrics()
        .map(Json)
        .map_err(into_api_error)
}

// ============================================================================
// Account handlers
// ============================================================================

pub async fn open_account(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OpenAccountBody>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    state
        .orchestrator()
        .open_account(&body.id, body.balance)
        .map(|account| (StatusCode::CREATED, Json(account)))
        .map_err(into_api_error)
}

pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Account>, ApiError> {
    state
        .orchestrator()
        .get_account(&id)
        .map(Json)
        .map_err(into_api_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&OrchestratorError::InvalidArgument("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&OrchestratorError::OrderNotFound("o".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&OrchestratorError::InvalidState("done".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&OrchestratorError::InsufficientBalance {
                account_id: "a".into(),
                required: Decimal::ONE,
                available: Decimal::ZERO,
            }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            error_status(&OrchestratorError::Persistence("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{handlers, middleware::metrics_middleware, orders};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Health, config and observability
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/scheduler", get(handlers::get_scheduler))
        .route("/metrics", get(handlers::get_metrics))
        .route("/metrics/orders", get(orders::get_order_metrics))
        // Orders
        .route("/orders", post(orders::create_order).get(orders::list_orders))
        .route("/orders/{id}", get(orders::get_order))
        .route("/orders/{id}/units", get(orders::get_order_units))
        .route("/orders/{id}/invariants", get(orders::get_order_invariants))
        .route("/orders/{id}/cancel", post(orders::cancel_order))
        // Accounts
        .route("/accounts", post(orders::open_account))
        .route("/accounts/{id}", get(orders::get_account))
        .layer(middleware::from_fn(metrics_middleware))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

//! API module - Axum HTTP server and routes
//!
//! Thin glue over the settlement engine: handlers call engine methods
//! and wrap the results in JSON envelopes.

mod handlers;

use crate::AppState;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main application router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ==========================================
        // Status & Health
        // ==========================================
        .route("/api/health", get(handlers::health_check))
        .route("/api/status", get(handlers::get_status))
        .route("/api/totals", get(handlers::get_totals))
        // ==========================================
        // Engine Settings
        // ==========================================
        .route("/api/settings/policy", put(handlers::update_policy))
        .route("/api/settings/rebalancer", put(handlers::update_rebalancer))
        // ==========================================
        // Position Intake
        // ==========================================
        .route("/api/positions", post(handlers::submit_position))
        .route("/api/positions/batch", post(handlers::submit_batch))
        // ==========================================
        // Orders
        // ==========================================
        .route("/api/orders", get(handlers::get_orders))
        .route("/api/orders/:order_id", get(handlers::get_order))
        .route("/api/orders/:order_id/cancel", post(handlers::cancel_order))
        // ==========================================
        // Liquidity Providers
        // ==========================================
        .route("/api/providers", get(handlers::get_providers))
        .route("/api/providers", post(handlers::register_provider))
        .route(
            "/api/providers/:provider_id/connectivity",
            put(handlers::update_connectivity),
        )
        .route(
            "/api/providers/:provider_id/inject",
            post(handlers::inject_capital),
        )
        // ==========================================
        // Deliveries
        // ==========================================
        .route("/api/deliveries", get(handlers::get_deliveries))
        .route(
            "/api/deliveries/:delivery_id/status",
            put(handlers::update_delivery_status),
        )
        // Apply middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

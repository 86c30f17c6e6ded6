//! API request handlers
//!
//! All endpoint handlers for the settlement API.

use crate::engine::EngineError;
use crate::router::RouteError;
use crate::types::{Commodity, Connectivity, DeliveryStatus, OrderState, PositionClosed};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

// ==========================================
// Response Helpers
// ==========================================

pub fn error_response(error: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

pub fn bad_request(error: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

pub fn not_found(error: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

fn engine_error(e: EngineError) -> Response {
    match e {
        EngineError::OrderNotFound(_) | EngineError::DeliveryNotFound(_) => {
            not_found(&e.to_string())
        }
        EngineError::NotCancellable(_)
        | EngineError::DeliveryRegression(_)
        | EngineError::Route(RouteError::BelowMinimum { .. }) => bad_request(&e.to_string()),
        EngineError::Route(RouteError::NoProviderAvailable(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "success": false,
                "error": e.to_string()
            })),
        )
            .into_response(),
        _ => error_response(&e.to_string()),
    }
}

// ==========================================
// Request Types
// ==========================================

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub positions: Vec<PositionClosed>,
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    pub account: Option<String>,
    pub status: Option<OrderState>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterProviderRequest {
    pub name: String,
    pub total_capacity: f64,
    #[serde(default)]
    pub inventory: HashMap<Commodity, f64>,
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default = "default_latency_ms")]
    pub avg_latency_ms: f64,
}

fn default_success_rate() -> f64 {
    0.95
}
fn default_latency_ms() -> f64 {
    1200.0
}

#[derive(Debug, Deserialize)]
pub struct ConnectivityRequest {
    pub connectivity: Connectivity,
}

#[derive(Debug, Deserialize)]
pub struct InjectRequest {
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct DeliveryStatusRequest {
    pub status: DeliveryStatus,
}

#[derive(Debug, Deserialize)]
pub struct PolicyUpdate {
    pub min_margin_ratio: Option<f64>,
    pub min_order_value: Option<f64>,
    pub max_order_value: Option<f64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RebalancerUpdate {
    pub interval_ms: Option<u64>,
    pub floor_ratio: Option<f64>,
    pub target_ratio: Option<f64>,
}

// ==========================================
// Health & Status Handlers
// ==========================================

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "gold_settlement",
        "version": "1.0.0"
    }))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.stats();
    Json(serde_json::json!({
        "is_running": stats.is_running,
        "orders_routed": stats.orders_routed,
        "orders_settled": stats.orders_settled,
        "orders_failed": stats.orders_failed,
        "execution_timeouts": stats.execution_timeouts,
        "capacity_topups": stats.capacity_topups,
        "rebalance_cycles": stats.rebalance_cycles,
        "uptime_seconds": stats.uptime_seconds,
    }))
}

pub async fn get_totals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.totals())
}

// ==========================================
// Settings Handlers
// ==========================================

pub async fn update_policy(
    State(state): State<Arc<AppState>>,
    Json(updates): Json<PolicyUpdate>,
) -> impl IntoResponse {
    state.config.update_policy(
        updates.min_margin_ratio,
        updates.min_order_value,
        updates.max_order_value,
        updates.max_retries,
    );
    Json(serde_json::json!({
        "success": true,
        "message": "Routing policy updated"
    }))
}

pub async fn update_rebalancer(
    State(state): State<Arc<AppState>>,
    Json(updates): Json<RebalancerUpdate>,
) -> impl IntoResponse {
    state.config.update_rebalancer(
        updates.interval_ms,
        updates.floor_ratio,
        updates.target_ratio,
    );
    Json(serde_json::json!({
        "success": true,
        "message": "Rebalancer settings updated"
    }))
}

// ==========================================
// Position Intake Handlers
// ==========================================

pub async fn submit_position(
    State(state): State<Arc<AppState>>,
    Json(position): Json<PositionClosed>,
) -> Response {
    match state.engine.route_now(&position) {
        Ok(order) => Json(serde_json::json!({
            "success": true,
            "message": "Position routed",
            "order": order
        }))
        .into_response(),
        Err(e) => engine_error(e),
    }
}

pub async fn submit_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> impl IntoResponse {
    let submitted = req.positions.len();
    let accepted = state.engine.submit_batch(req.positions);
    info!("Batch intake: {}/{} positions accepted", accepted, submitted);
    Json(serde_json::json!({
        "success": accepted == submitted,
        "submitted": submitted,
        "accepted": accepted
    }))
}

// ==========================================
// Order Handlers
// ==========================================

pub async fn get_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> impl IntoResponse {
    let orders = state.engine.orders(query.account.as_deref(), query.status);
    Json(serde_json::json!({
        "count": orders.len(),
        "orders": orders
    }))
}

pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Response {
    match state.engine.order(order_id) {
        Some(order) => Json(serde_json::json!({ "order": order })).into_response(),
        None => not_found(&format!("order {} not found", order_id)),
    }
}

pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Response {
    match state.engine.cancel_order(order_id) {
        Ok(order) => Json(serde_json::json!({
            "success": true,
            "message": "Order cancelled",
            "order": order
        }))
        .into_response(),
        Err(e) => engine_error(e),
    }
}

// ==========================================
// Provider Handlers
// ==========================================

pub async fn get_providers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let providers = state.engine.providers();
    Json(serde_json::json!({
        "count": providers.len(),
        "providers": providers
    }))
}

pub async fn register_provider(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterProviderRequest>,
) -> Response {
    if req.total_capacity <= 0.0 {
        return bad_request("total_capacity must be positive");
    }
    if !(0.0..=1.0).contains(&req.success_rate) {
        return bad_request("success_rate must be in 0..=1");
    }
    let id = state.engine.register_provider(
        &req.name,
        req.total_capacity,
        req.inventory,
        req.success_rate,
        req.avg_latency_ms,
    );
    Json(serde_json::json!({
        "success": true,
        "provider_id": id
    }))
    .into_response()
}

pub async fn update_connectivity(
    State(state): State<Arc<AppState>>,
    Path(provider_id): Path<Uuid>,
    Json(req): Json<ConnectivityRequest>,
) -> Response {
    match state.engine.mark_connectivity(provider_id, req.connectivity) {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "provider_id": provider_id,
            "connectivity": req.connectivity
        }))
        .into_response(),
        Err(e) => engine_error(e),
    }
}

pub async fn inject_capital(
    State(state): State<Arc<AppState>>,
    Path(provider_id): Path<Uuid>,
    Json(req): Json<InjectRequest>,
) -> Response {
    if req.amount <= 0.0 {
        return bad_request("amount must be positive");
    }
    match state.engine.inject_capital(provider_id, req.amount) {
        Ok(snapshot) => Json(serde_json::json!({
            "success": true,
            "provider": snapshot
        }))
        .into_response(),
        Err(e) => engine_error(e),
    }
}

// ==========================================
// Delivery Handlers
// ==========================================

pub async fn get_deliveries(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let deliveries = state.engine.deliveries();
    Json(serde_json::json!({
        "count": deliveries.len(),
        "deliveries": deliveries
    }))
}

pub async fn update_delivery_status(
    State(state): State<Arc<AppState>>,
    Path(delivery_id): Path<Uuid>,
    Json(req): Json<DeliveryStatusRequest>,
) -> Response {
    match state.engine.update_delivery_status(delivery_id, req.status) {
        Ok(record) => Json(serde_json::json!({
            "success": true,
            "delivery": record
        }))
        .into_response(),
        Err(e) => engine_error(e),
    }
}

//! Type definitions for the settlement engine
//! Entities, lifecycle states, and engine configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Commodity variants accepted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Commodity {
    Gold9999,
    GoldCoin,
    GoldBar,
}

impl std::fmt::Display for Commodity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Commodity::Gold9999 => write!(f, "gold_9999"),
            Commodity::GoldCoin => write!(f, "gold_coin"),
            Commodity::GoldBar => write!(f, "gold_bar"),
        }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order lifecycle state
///
/// Transitions are strictly monotonic except for Failed, which is terminal
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Reserved,
    Executing,
    Executed,
    Settled,
    Failed,
}

impl OrderState {
    pub fn rank(&self) -> u8 {
        match self {
            OrderState::Pending => 0,
            OrderState::Reserved => 1,
            OrderState::Executing => 2,
            OrderState::Executed => 3,
            OrderState::Settled => 4,
            OrderState::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Settled | OrderState::Failed)
    }

    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == OrderState::Failed {
            return true;
        }
        next.rank() == self.rank() + 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Reserved => "reserved",
            OrderState::Executing => "executing",
            OrderState::Executed => "executed",
            OrderState::Settled => "settled",
            OrderState::Failed => "failed",
        }
    }
}

/// A routed settlement order against a single liquidity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub account_ref: String,
    pub commodity: Commodity,
    pub side: OrderSide,
    pub units: f64,
    pub unit_price: f64,
    pub total_value: f64,
    pub provider_id: Option<Uuid>,
    pub state: OrderState,
    /// Set once execution completes; differs from total_value by the spread
    pub realized_value: Option<f64>,
    pub market_impact_bps: f64,
    pub failure_reason: Option<String>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// Provider connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Connected,
    Disconnected,
    Maintenance,
}

impl Connectivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Connected => "connected",
            Connectivity::Disconnected => "disconnected",
            Connectivity::Maintenance => "maintenance",
        }
    }
}

/// Read-only snapshot of a liquidity provider for the query surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub id: Uuid,
    pub name: String,
    pub total_capacity: f64,
    pub reserved: f64,
    pub allocated: f64,
    pub free_capacity: f64,
    pub inventory: HashMap<Commodity, f64>,
    pub connectivity: Connectivity,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

/// Delivery lifecycle state, mutated only by the external tracking collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Scheduled,
    InTransit,
    Delivered,
    Confirmed,
}

impl DeliveryStatus {
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Scheduled => 0,
            DeliveryStatus::InTransit => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Confirmed => 3,
        }
    }
}

/// Scheduled physical delivery created at settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub quantity: f64,
    pub origin: String,
    pub destination: String,
    pub carrier: String,
    pub status: DeliveryStatus,
    pub tracking_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Position-closed event consumed from external collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosed {
    pub account_ref: String,
    pub commodity: Commodity,
    pub side: OrderSide,
    pub units: f64,
    pub price: f64,
}

/// Aggregate totals for the query surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateTotals {
    pub providers: usize,
    pub total_capacity: f64,
    pub total_reserved: f64,
    pub total_free: f64,
    pub orders_by_state: HashMap<String, usize>,
    pub deliveries: usize,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum fraction of the order value a provider must hold to be eligible
    pub min_margin_ratio: f64,
    /// Orders below this value are rejected at intake
    pub min_order_value: f64,
    /// Orders above this value are clamped to it
    pub max_order_value: f64,
    /// Re-route attempts after an execution timeout
    pub max_retries: u32,
    /// Hard execution timeout as a multiple of the provider's average latency
    pub timeout_factor: f64,
    /// Nominal provider spread applied to the realized value
    pub spread_bps: f64,
    /// Base market impact per order
    pub impact_base_bps: f64,
    pub rebalance_interval_ms: u64,
    /// Providers below `floor_ratio * avg free` get topped up
    pub rebalance_floor_ratio: f64,
    /// Top-up target as a fraction of average free capacity
    pub rebalance_target_ratio: f64,
    pub weight_success: f64,
    pub weight_latency: f64,
    pub weight_capacity: f64,
    pub delivery_origin: String,
    pub delivery_carrier: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_margin_ratio: 0.5,
            min_order_value: 50_000.0,
            max_order_value: 10_000_000.0,
            max_retries: 3,
            timeout_factor: 2.0,
            spread_bps: 20.0,
            impact_base_bps: 1.5,
            rebalance_interval_ms: 30_000,
            rebalance_floor_ratio: 0.3,
            rebalance_target_ratio: 0.8,
            weight_success: 0.4,
            weight_latency: 0.3,
            weight_capacity: 0.3,
            delivery_origin: "Central bullion vault".to_string(),
            delivery_carrier: "armored-freight".to_string(),
        }
    }
}

/// Engine statistics for the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub is_running: bool,
    pub orders_routed: u64,
    pub orders_settled: u64,
    pub orders_failed: u64,
    pub execution_timeouts: u64,
    pub capacity_topups: u64,
    pub rebalance_cycles: u64,
    pub uptime_seconds: u64,
}

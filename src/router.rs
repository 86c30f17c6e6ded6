//! Order router - turns closed positions into reserved orders
//!
//! Routing reserves capacity on the chosen provider BEFORE the order is
//! inserted into the ledger, so a failed reservation leaves no order
//! behind. When no provider is eligible the router falls back to a single
//! capacity top-up and retries once.

use crate::events::{EngineEvent, EventBus};
use crate::ledger::OrderLedger;
use crate::pool::{PoolError, ProviderPool};
use crate::types::{EngineConfig, Order, OrderState, PositionClosed};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("order value {value:.0} below minimum {minimum:.0}")]
    BelowMinimum { value: f64, minimum: f64 },
    #[error("no provider available for order value {0:.0}")]
    NoProviderAvailable(f64),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub struct Router {
    pool: Arc<ProviderPool>,
    ledger: Arc<OrderLedger>,
    events: Arc<EventBus>,
}

impl Router {
    pub fn new(pool: Arc<ProviderPool>, ledger: Arc<OrderLedger>, events: Arc<EventBus>) -> Self {
        Self {
            pool,
            ledger,
            events,
        }
    }

    /// Route a closed position to the best provider and reserve capacity.
    ///
    /// Returns the reserved order. Oversized positions are clamped to the
    /// configured maximum; undersized ones are rejected outright.
    pub fn route(&self, position: &PositionClosed, config: &EngineConfig) -> Result<Order, RouteError> {
        let raw_value = position.units * position.price;
        if raw_value < config.min_order_value {
            return Err(RouteError::BelowMinimum {
                value: raw_value,
                minimum: config.min_order_value,
            });
        }

        let (units, total_value) = if raw_value > config.max_order_value {
            let scale = config.max_order_value / raw_value;
            warn!(
                "Clamping oversized position from {:.0} to {:.0}",
                raw_value, config.max_order_value
            );
            (position.units * scale, config.max_order_value)
        } else {
            (position.units, raw_value)
        };

        let exclude = HashSet::new();
        let provider_id = self.pick_provider(total_value, position, units, &exclude, config)?;

        self.pool
            .reserve(provider_id, total_value, position.commodity, units, position.side)?;

        let order = Order {
            id: Uuid::new_v4(),
            account_ref: position.account_ref.clone(),
            commodity: position.commodity,
            side: position.side,
            units,
            unit_price: position.price,
            total_value,
            provider_id: Some(provider_id),
            state: OrderState::Reserved,
            realized_value: None,
            market_impact_bps: market_impact_bps(total_value, config),
            failure_reason: None,
            retries: 0,
            created_at: Utc::now(),
            executed_at: None,
        };

        info!(
            "📋 Routed {} {} order {} ({:.2} units, {:.0}) to provider {}",
            order.side,
            order.commodity,
            order.id,
            order.units,
            order.total_value,
            provider_id
        );
        self.ledger.insert(order.clone());
        self.events.publish(EngineEvent::OrderCreated(order.clone()));
        Ok(order)
    }

    /// Score and pick, excluding already-tried providers. Used for both
    /// first routing and failover re-routing.
    pub fn pick_provider(
        &self,
        order_value: f64,
        position: &PositionClosed,
        units: f64,
        exclude: &HashSet<Uuid>,
        config: &EngineConfig,
    ) -> Result<Uuid, RouteError> {
        let candidates = self.pool.score(
            order_value,
            position.commodity,
            position.side,
            units,
            exclude,
            config,
        );
        if let Some(best) = candidates.first() {
            return Ok(best.id);
        }

        // No eligible provider: revive the best-ranked remaining one
        match self
            .pool
            .top_up_best(order_value, position.commodity, units, exclude, config)
        {
            Some(id) => Ok(id),
            None => Err(RouteError::NoProviderAvailable(order_value)),
        }
    }
}

/// Market impact in bps, growing with the log of order size past 1M
fn market_impact_bps(order_value: f64, config: &EngineConfig) -> f64 {
    let size_factor = if order_value > 1_000_000.0 {
        1.0 + (order_value / 1_000_000.0).log10() * 0.1
    } else {
        1.0
    };
    config.impact_base_bps * size_factor
}

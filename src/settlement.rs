//! Settlement - spread capture and physical delivery scheduling
//!
//! After execution the engine keeps the spread (the gap between requested
//! and realized value) as permanently allocated capital on the provider
//! and returns the rest of the reservation to free capacity. Buy orders
//! then get a delivery record for the physical metal; sell orders return
//! the units to the provider's inventory.

use crate::events::{EngineEvent, EventBus};
use crate::ledger::{DeliveryBook, OrderLedger};
use crate::pool::{PoolError, ProviderPool};
use crate::types::{DeliveryRecord, DeliveryStatus, EngineConfig, Order, OrderSide, OrderState};
use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SettleError {
    #[error("order {0} has no provider assigned")]
    NoProvider(Uuid),
    #[error("order {0} has no realized value")]
    NotExecuted(Uuid),
    #[error("order {0} is not in a settleable state")]
    WrongState(Uuid),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub struct SettlementManager {
    pool: Arc<ProviderPool>,
    ledger: Arc<OrderLedger>,
    deliveries: Arc<DeliveryBook>,
    events: Arc<EventBus>,
}

impl SettlementManager {
    pub fn new(
        pool: Arc<ProviderPool>,
        ledger: Arc<OrderLedger>,
        deliveries: Arc<DeliveryBook>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            pool,
            ledger,
            deliveries,
            events,
        }
    }

    /// Settle an executed order: capture the spread, release the rest,
    /// schedule delivery, and mark the order settled.
    pub fn settle(&self, order: &Order, config: &EngineConfig) -> Result<(), SettleError> {
        let provider_id = order.provider_id.ok_or(SettleError::NoProvider(order.id))?;
        let realized = order
            .realized_value
            .ok_or(SettleError::NotExecuted(order.id))?;

        // Guard before touching the books: a concurrent cancel or timeout
        // may already have moved the order to a terminal state and released
        // its reservation.
        let current = self
            .ledger
            .get(order.id)
            .ok_or(SettleError::WrongState(order.id))?;
        if current.state != OrderState::Executed {
            return Err(SettleError::WrongState(order.id));
        }

        let spread = (order.total_value - realized).abs().min(order.total_value);

        // Spread moves from reserved to allocated; the remainder frees up
        self.pool.adjust(provider_id, -spread)?;
        self.pool.release(provider_id, order.total_value - spread)?;

        if order.side == OrderSide::Sell {
            self.pool
                .return_inventory(provider_id, order.commodity, order.units)?;
        }

        if !self.ledger.try_transition(order.id, OrderState::Settled) {
            // Books already balanced above; the order lost a race (e.g. a
            // concurrent cancel landed first) and stays terminal as-is.
            return Err(SettleError::WrongState(order.id));
        }

        info!(
            "✅ Settled order {}: requested {:.0}, realized {:.0}, spread {:.0}",
            order.id, order.total_value, realized, spread
        );

        let settled = self.ledger.get(order.id).unwrap_or_else(|| order.clone());
        self.events.publish(EngineEvent::OrderSettled(settled));

        if order.side == OrderSide::Buy {
            let record = self.schedule_delivery(order, config);
            info!(
                "🚚 Scheduled delivery {} for order {} ({:.2} units, tracking {})",
                record.id, order.id, record.quantity, record.tracking_id
            );
            self.deliveries.insert(record.clone());
            self.events.publish(EngineEvent::DeliveryScheduled(record));
        }

        Ok(())
    }

    fn schedule_delivery(&self, order: &Order, config: &EngineConfig) -> DeliveryRecord {
        let executed_at = order.executed_at.unwrap_or_else(Utc::now);
        let id = Uuid::new_v4();
        DeliveryRecord {
            id,
            order_id: order.id,
            quantity: order.units,
            origin: config.delivery_origin.clone(),
            destination: format!("Registered address of {}", order.account_ref),
            carrier: config.delivery_carrier.clone(),
            status: DeliveryStatus::Scheduled,
            tracking_id: format!("TRK-{}", &id.simple().to_string()[..12].to_uppercase()),
            scheduled_for: executed_at + Duration::hours(24),
            created_at: Utc::now(),
        }
    }
}

//! Event bus for lifecycle notifications
//!
//! External collaborators (notifiers, dashboards) subscribe here. Delivery is
//! best-effort: settlement correctness never depends on a listener observing
//! an event, so publish failures are logged and swallowed.

use crate::types::{DeliveryRecord, Order};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

const BUS_CAPACITY: usize = 1024;

/// Lifecycle event carrying a full snapshot of the relevant entity
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum EngineEvent {
    OrderCreated(Order),
    OrderExecuted(Order),
    OrderSettled(Order),
    OrderFailed(Order),
    DeliveryScheduled(DeliveryRecord),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::OrderCreated(_) => "orderCreated",
            EngineEvent::OrderExecuted(_) => "orderExecuted",
            EngineEvent::OrderSettled(_) => "orderSettled",
            EngineEvent::OrderFailed(_) => "orderFailed",
            EngineEvent::DeliveryScheduled(_) => "deliveryScheduled",
        }
    }
}

/// Broadcast fan-out point for engine events
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Subscribe to all engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers; never fails
    pub fn publish(&self, event: EngineEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.send(event) {
            // No active subscribers - fine, fan-out is best-effort
            debug!("Event {} had no listeners", e.0.name());
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Commodity, OrderSide, OrderState};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_order() -> Order {
        Order {
            id: Uuid::new_v4(),
            account_ref: "ACC-1".to_string(),
            commodity: Commodity::Gold9999,
            side: OrderSide::Buy,
            units: 10.0,
            unit_price: 100.0,
            total_value: 1000.0,
            provider_id: None,
            state: OrderState::Pending,
            realized_value: None,
            market_impact_bps: 0.0,
            failure_reason: None,
            retries: 0,
            created_at: Utc::now(),
            executed_at: None,
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::OrderCreated(sample_order()));
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::OrderCreated(sample_order()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "orderCreated");
    }
}

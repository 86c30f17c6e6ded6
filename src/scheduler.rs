//! Execution scheduler - drives reserved orders through the provider leg
//!
//! Each order gets its own task. An attempt races the provider simulation
//! against a hard timeout of `timeout_factor` times the provider's average
//! latency. On timeout the reservation is released and the order re-routes
//! to the next-best provider, excluding everyone already tried, up to
//! `max_retries` failovers. Orders stay in `executing` across retries and
//! only reach `failed` once every avenue is exhausted.

use crate::config::ConfigManager;
use crate::events::{EngineEvent, EventBus};
use crate::ledger::OrderLedger;
use crate::pool::ProviderPool;
use crate::router::Router;
use crate::settlement::SettlementManager;
use crate::types::{Order, OrderState, PositionClosed};
use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct ExecutionScheduler {
    pool: Arc<ProviderPool>,
    ledger: Arc<OrderLedger>,
    router: Arc<Router>,
    settlement: Arc<SettlementManager>,
    events: Arc<EventBus>,
    config: Arc<ConfigManager>,
    timeouts: AtomicU64,
    settled: AtomicU64,
    failed: AtomicU64,
}

enum AttemptOutcome {
    /// Realized value and observed latency
    Filled(f64, f64),
    /// Hard timeout fired before the provider answered
    TimedOut,
}

impl ExecutionScheduler {
    pub fn new(
        pool: Arc<ProviderPool>,
        ledger: Arc<OrderLedger>,
        router: Arc<Router>,
        settlement: Arc<SettlementManager>,
        events: Arc<EventBus>,
        config: Arc<ConfigManager>,
    ) -> Self {
        Self {
            pool,
            ledger,
            router,
            settlement,
            events,
            config,
            timeouts: AtomicU64::new(0),
            settled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Spawn the execution task for a freshly reserved order
    pub fn execute(self: &Arc<Self>, order: Order) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.drive(order).await;
        });
    }

    async fn drive(&self, order: Order) {
        if !self.ledger.try_transition(order.id, OrderState::Executing) {
            // Lost to a cancel between routing and pickup; reservation was
            // released by whoever won.
            return;
        }

        let config = self.config.get();
        let mut tried: HashSet<Uuid> = HashSet::new();
        let mut provider_id = match order.provider_id {
            Some(id) => id,
            None => {
                self.fail_order(order.id, "order reserved without a provider");
                return;
            }
        };

        loop {
            tried.insert(provider_id);

            let Some(snapshot) = self.pool.snapshot(provider_id) else {
                self.fail_order(order.id, "provider vanished mid-execution");
                return;
            };
            let window =
                Duration::from_millis((snapshot.avg_latency_ms * config.timeout_factor) as u64);

            let outcome = self.attempt(&order, snapshot.avg_latency_ms, snapshot.success_rate, window).await;

            match outcome {
                AttemptOutcome::Filled(realized, latency_ms) => {
                    self.ledger.set_executed(order.id, realized, Utc::now());
                    if !self.ledger.try_transition(order.id, OrderState::Executed) {
                        // Terminal race: return the reservation and stop
                        if let Err(e) = self.pool.unwind_reservation(
                            provider_id,
                            order.total_value,
                            order.commodity,
                            order.units,
                            order.side,
                        ) {
                            error!("Unwind after lost execution race failed: {}", e);
                        }
                        return;
                    }
                    let _ = self.pool.record_outcome(provider_id, true, latency_ms);

                    if let Some(executed) = self.ledger.get(order.id) {
                        self.events.publish(EngineEvent::OrderExecuted(executed.clone()));
                        match self.settlement.settle(&executed, &config) {
                            Ok(()) => {
                                self.settled.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                error!("Settlement of order {} failed: {}", order.id, e);
                            }
                        }
                    }
                    return;
                }
                AttemptOutcome::TimedOut => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "⏱️ Order {} timed out on provider {} after {:?}",
                        order.id, provider_id, window
                    );
                    if let Err(e) = self.pool.unwind_reservation(
                        provider_id,
                        order.total_value,
                        order.commodity,
                        order.units,
                        order.side,
                    ) {
                        error!("Unwind after failed attempt: {}", e);
                    }
                    let _ = self
                        .pool
                        .record_outcome(provider_id, false, snapshot.avg_latency_ms);

                    let current = self.ledger.get(order.id);
                    let retries = current.as_ref().map(|o| o.retries).unwrap_or(u32::MAX);
                    if retries >= config.max_retries {
                        self.fail_order(order.id, "retries exhausted across providers");
                        return;
                    }

                    let position = PositionClosed {
                        account_ref: order.account_ref.clone(),
                        commodity: order.commodity,
                        side: order.side,
                        units: order.units,
                        price: order.unit_price,
                    };
                    let next = match self.router.pick_provider(
                        order.total_value,
                        &position,
                        order.units,
                        &tried,
                        &config,
                    ) {
                        Ok(id) => id,
                        Err(e) => {
                            self.fail_order(order.id, &format!("re-route failed: {}", e));
                            return;
                        }
                    };
                    if let Err(e) = self.pool.reserve(
                        next,
                        order.total_value,
                        order.commodity,
                        order.units,
                        order.side,
                    ) {
                        self.fail_order(order.id, &format!("failover reserve failed: {}", e));
                        return;
                    }

                    self.ledger.bump_retries(order.id);
                    self.ledger.set_provider(order.id, next);
                    info!(
                        "🔁 Order {} failing over from {} to {} (attempt {})",
                        order.id,
                        provider_id,
                        next,
                        retries + 2
                    );
                    provider_id = next;
                }
            }
        }
    }

    /// One provider attempt under the hard timeout window.
    ///
    /// Latency jitters in 0.5x..1.5x of the provider's average; a failing
    /// draw is an unresponsive provider, so nothing arrives inside the
    /// window and the timeout fires.
    async fn attempt(
        &self,
        order: &Order,
        avg_latency_ms: f64,
        success_rate: f64,
        window: Duration,
    ) -> AttemptOutcome {
        let (latency_ms, fills, spread) = {
            let mut rng = rand::thread_rng();
            let latency = avg_latency_ms * rng.gen_range(0.5..1.5);
            let fills = rng.gen::<f64>() < success_rate;
            let config = self.config.get();
            let nominal = order.total_value * config.spread_bps / 10_000.0;
            let spread = (nominal * rng.gen_range(0.5..1.5)).min(order.total_value);
            (latency, fills, spread)
        };

        if !fills {
            tokio::time::sleep(window).await;
            return AttemptOutcome::TimedOut;
        }

        let fill = async {
            tokio::time::sleep(Duration::from_millis(latency_ms as u64)).await;
            order.total_value - spread
        };
        match tokio::time::timeout(window, fill).await {
            Ok(realized) => AttemptOutcome::Filled(realized, latency_ms),
            Err(_) => AttemptOutcome::TimedOut,
        }
    }

    fn fail_order(&self, id: Uuid, reason: &str) {
        if self.ledger.try_fail(id, reason) {
            self.failed.fetch_add(1, Ordering::Relaxed);
            warn!("❌ Order {} failed: {}", id, reason);
            if let Some(order) = self.ledger.get(id) {
                self.events.publish(EngineEvent::OrderFailed(order));
            }
        }
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn settled_count(&self) -> u64 {
        self.settled.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DeliveryBook;
    use crate::types::{Commodity, EngineConfig, OrderSide};
    use std::collections::HashMap;
    use tokio::sync::broadcast;

    struct Harness {
        pool: Arc<ProviderPool>,
        ledger: Arc<OrderLedger>,
        router: Arc<Router>,
        scheduler: Arc<ExecutionScheduler>,
        rx: broadcast::Receiver<EngineEvent>,
    }

    fn harness() -> Harness {
        let pool = Arc::new(ProviderPool::new());
        let ledger = Arc::new(OrderLedger::new());
        let deliveries = Arc::new(DeliveryBook::new());
        let events = Arc::new(EventBus::new());
        let rx = events.subscribe();
        let config = Arc::new(ConfigManager::new(EngineConfig::default()));
        let router = Arc::new(Router::new(
            Arc::clone(&pool),
            Arc::clone(&ledger),
            Arc::clone(&events),
        ));
        let settlement = Arc::new(SettlementManager::new(
            Arc::clone(&pool),
            Arc::clone(&ledger),
            Arc::clone(&deliveries),
            Arc::clone(&events),
        ));
        let scheduler = Arc::new(ExecutionScheduler::new(
            Arc::clone(&pool),
            Arc::clone(&ledger),
            Arc::clone(&router),
            settlement,
            events,
            config,
        ));
        Harness {
            pool,
            ledger,
            router,
            scheduler,
            rx,
        }
    }

    fn register(pool: &ProviderPool, name: &str, success_rate: f64) -> Uuid {
        let mut inventory = HashMap::new();
        inventory.insert(Commodity::Gold9999, 1_000.0);
        pool.register(name, 1_000_000.0, inventory, success_rate, 1000.0)
    }

    fn position() -> PositionClosed {
        PositionClosed {
            account_ref: "ACC-1001".to_string(),
            commodity: Commodity::Gold9999,
            side: OrderSide::Buy,
            units: 2.0,
            price: 50_000.0,
        }
    }

    async fn wait_for_terminal(mut rx: broadcast::Receiver<EngineEvent>, id: Uuid) -> EngineEvent {
        loop {
            let event = rx.recv().await.unwrap();
            match &event {
                EngineEvent::OrderSettled(o) | EngineEvent::OrderFailed(o) if o.id == id => {
                    return event
                }
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reliable_provider_fills_and_settles() {
        let h = harness();
        let provider = register(&h.pool, "Sure LP", 1.0);
        let config = EngineConfig::default();

        let order = h.router.route(&position(), &config).unwrap();
        h.scheduler.execute(order.clone());
        let event = wait_for_terminal(h.rx, order.id).await;

        assert!(matches!(event, EngineEvent::OrderSettled(_)));
        let settled = h.ledger.get(order.id).unwrap();
        assert_eq!(settled.state, OrderState::Settled);
        let realized = settled.realized_value.unwrap();
        assert!(realized < order.total_value);
        assert!(realized > order.total_value * 0.99);

        // Reservation fully unwound: only the spread stays allocated
        let snap = h.pool.snapshot(provider).unwrap();
        assert!((snap.reserved - 0.0).abs() < 1e-6);
        assert!((snap.allocated - (order.total_value - realized)).abs() < 1e-6);
        assert_eq!(h.scheduler.settled_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_over_to_the_next_provider() {
        let h = harness();
        let dead = register(&h.pool, "Dead LP", 0.0);
        let backup = register(&h.pool, "Backup LP", 1.0);

        // Order routed to the dead provider by hand so the failover path
        // is exercised regardless of relative scores
        let pos = position();
        let total = pos.units * pos.price;
        h.pool
            .reserve(dead, total, pos.commodity, pos.units, pos.side)
            .unwrap();
        let order = Order {
            id: Uuid::new_v4(),
            account_ref: pos.account_ref.clone(),
            commodity: pos.commodity,
            side: pos.side,
            units: pos.units,
            unit_price: pos.price,
            total_value: total,
            provider_id: Some(dead),
            state: OrderState::Reserved,
            realized_value: None,
            market_impact_bps: 1.5,
            failure_reason: None,
            retries: 0,
            created_at: Utc::now(),
            executed_at: None,
        };
        h.ledger.insert(order.clone());
        h.scheduler.execute(order.clone());
        let event = wait_for_terminal(h.rx, order.id).await;

        assert!(matches!(event, EngineEvent::OrderSettled(_)));
        let settled = h.ledger.get(order.id).unwrap();
        assert_eq!(settled.provider_id, Some(backup));
        assert_eq!(settled.retries, 1);

        // The dead provider's reservation was released
        let snap = h.pool.snapshot(dead).unwrap();
        assert!((snap.reserved - 0.0).abs() < 1e-6);
        assert!(h.scheduler.timeout_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn order_fails_once_retries_are_exhausted() {
        let h = harness();
        // Four hopeless providers: first attempt plus three failovers
        let providers: Vec<Uuid> = (0..4)
            .map(|i| register(&h.pool, &format!("Hopeless LP {}", i), 0.0))
            .collect();
        let config = EngineConfig::default();

        let order = h.router.route(&position(), &config).unwrap();
        h.scheduler.execute(order.clone());
        let event = wait_for_terminal(h.rx, order.id).await;

        assert!(matches!(event, EngineEvent::OrderFailed(_)));
        let failed = h.ledger.get(order.id).unwrap();
        assert_eq!(failed.state, OrderState::Failed);
        assert!(failed.failure_reason.is_some());
        assert_eq!(failed.retries, config.max_retries);

        // Every reservation along the way was released, inventory included
        for provider in providers {
            let snap = h.pool.snapshot(provider).unwrap();
            assert!((snap.reserved - 0.0).abs() < 1e-6);
            assert!((snap.inventory[&Commodity::Gold9999] - 1_000.0).abs() < 1e-9);
        }
        assert_eq!(h.scheduler.failed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_buy_returns_drawn_down_inventory() {
        let h = harness();
        let provider = register(&h.pool, "Hopeless LP", 0.0);
        let config = EngineConfig::default();
        let held_before = h.pool.snapshot(provider).unwrap().inventory[&Commodity::Gold9999];

        let order = h.router.route(&position(), &config).unwrap();
        h.scheduler.execute(order.clone());
        let event = wait_for_terminal(h.rx, order.id).await;

        assert!(matches!(event, EngineEvent::OrderFailed(_)));
        let snap = h.pool.snapshot(provider).unwrap();
        assert!((snap.reserved - 0.0).abs() < 1e-6);
        // The 2 units drawn down at reserve time came back with the capital
        assert!((snap.inventory[&Commodity::Gold9999] - held_before).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_order_is_not_executed() {
        let h = harness();
        register(&h.pool, "Idle LP", 1.0);
        let config = EngineConfig::default();

        let order = h.router.route(&position(), &config).unwrap();
        assert!(h.ledger.try_fail(order.id, "cancelled"));
        h.scheduler.execute(order.clone());
        tokio::time::sleep(Duration::from_secs(10)).await;

        let stored = h.ledger.get(order.id).unwrap();
        assert_eq!(stored.state, OrderState::Failed);
        assert!(stored.executed_at.is_none());
    }
}

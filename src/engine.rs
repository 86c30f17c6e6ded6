//! Settlement engine facade
//!
//! Owns the pool, ledger, router, scheduler, settlement manager and
//! rebalancer, and exposes the operations the API layer calls. Closed
//! positions arrive either one at a time (routed inline) or in batches
//! through an intake queue drained by a background worker.

use crate::config::ConfigManager;
use crate::events::{EngineEvent, EventBus};
use crate::ledger::{DeliveryBook, OrderLedger};
use crate::pool::{PoolError, ProviderPool};
use crate::rebalancer::RebalancerJob;
use crate::router::{RouteError, Router};
use crate::scheduler::ExecutionScheduler;
use crate::settlement::SettlementManager;
use crate::types::{
    AggregateTotals, Commodity, Connectivity, DeliveryRecord, DeliveryStatus, EngineStats, Order,
    OrderState, PositionClosed, ProviderSnapshot,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

const INTAKE_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("order {0} not found")]
    OrderNotFound(Uuid),
    #[error("order {0} can no longer be cancelled")]
    NotCancellable(Uuid),
    #[error("delivery {0} not found")]
    DeliveryNotFound(Uuid),
    #[error("delivery {0} cannot move backwards")]
    DeliveryRegression(Uuid),
    #[error("intake queue full")]
    IntakeFull,
}

pub struct SettlementEngine {
    config: Arc<ConfigManager>,
    pool: Arc<ProviderPool>,
    ledger: Arc<OrderLedger>,
    deliveries: Arc<DeliveryBook>,
    events: Arc<EventBus>,
    router: Arc<Router>,
    scheduler: Arc<ExecutionScheduler>,
    rebalancer: RebalancerJob,
    intake_tx: mpsc::Sender<PositionClosed>,
    intake_rx: Mutex<Option<mpsc::Receiver<PositionClosed>>>,
    running: AtomicBool,
    orders_routed: AtomicU64,
    started_at: Mutex<Option<std::time::Instant>>,
}

impl SettlementEngine {
    pub fn new(config: Arc<ConfigManager>) -> Arc<Self> {
        let pool = Arc::new(ProviderPool::new());
        let ledger = Arc::new(OrderLedger::new());
        let deliveries = Arc::new(DeliveryBook::new());
        let events = Arc::new(EventBus::new());
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
            Arc::clone(&events),
            Arc::clone(&config),
        ));
        let rebalancer = RebalancerJob::new(Arc::clone(&pool), Arc::clone(&config));
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);

        Arc::new(Self {
            config,
            pool,
            ledger,
            deliveries,
            events,
            router,
            scheduler,
            rebalancer,
            intake_tx,
            intake_rx: Mutex::new(Some(intake_rx)),
            running: AtomicBool::new(false),
            orders_routed: AtomicU64::new(0),
            started_at: Mutex::new(None),
        })
    }

    /// Start the intake worker and the rebalancer
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.started_at.lock() = Some(std::time::Instant::now());
        self.rebalancer.start();

        let Some(mut rx) = self.intake_rx.lock().take() else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!("📥 Intake worker started");
            while let Some(position) = rx.recv().await {
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = engine.route_now(&position) {
                    warn!(
                        "Dropped position from {} at intake: {}",
                        position.account_ref, e
                    );
                }
            }
            info!("Intake worker stopped");
        });
        info!("🚀 Settlement engine started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.rebalancer.stop();
        info!("Settlement engine stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Route a closed position and hand the order to the scheduler
    pub fn route_now(self: &Arc<Self>, position: &PositionClosed) -> Result<Order, EngineError> {
        let config = self.config.get();
        let order = self.router.route(position, &config)?;
        self.orders_routed.fetch_add(1, Ordering::Relaxed);
        self.scheduler.execute(order.clone());
        Ok(order)
    }

    /// Enqueue a closed position for the intake worker
    pub fn submit_position(&self, position: PositionClosed) -> Result<(), EngineError> {
        self.intake_tx
            .try_send(position)
            .map_err(|_| EngineError::IntakeFull)
    }

    /// Enqueue a batch; returns how many were accepted
    pub fn submit_batch(&self, positions: Vec<PositionClosed>) -> usize {
        let mut accepted = 0;
        for position in positions {
            match self.submit_position(position) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    error!("Batch intake stopped: {}", e);
                    break;
                }
            }
        }
        accepted
    }

    /// Cancel an order that has not started executing.
    ///
    /// Wins or loses the race against the scheduler through the ledger's
    /// state machine; on a win the reservation is released here.
    pub fn cancel_order(&self, id: Uuid) -> Result<Order, EngineError> {
        let order = self.ledger.get(id).ok_or(EngineError::OrderNotFound(id))?;
        if !matches!(order.state, OrderState::Pending | OrderState::Reserved) {
            return Err(EngineError::NotCancellable(id));
        }
        // CAS on the observed state: if the scheduler moved the order to
        // executing in the meantime, the cancel loses and releases nothing.
        if !self
            .ledger
            .try_fail_from(id, order.state, "cancelled by account holder")
        {
            return Err(EngineError::NotCancellable(id));
        }
        if let (OrderState::Reserved, Some(provider_id)) = (order.state, order.provider_id) {
            self.pool.unwind_reservation(
                provider_id,
                order.total_value,
                order.commodity,
                order.units,
                order.side,
            )?;
        }
        info!("🛑 Order {} cancelled", id);
        let cancelled = self.ledger.get(id).ok_or(EngineError::OrderNotFound(id))?;
        self.events.publish(EngineEvent::OrderFailed(cancelled.clone()));
        Ok(cancelled)
    }

    pub fn register_provider(
        &self,
        name: &str,
        total_capacity: f64,
        inventory: HashMap<Commodity, f64>,
        success_rate: f64,
        avg_latency_ms: f64,
    ) -> Uuid {
        self.pool
            .register(name, total_capacity, inventory, success_rate, avg_latency_ms)
    }

    pub fn mark_connectivity(&self, id: Uuid, state: Connectivity) -> Result<(), EngineError> {
        self.pool.mark_connectivity(id, state)?;
        Ok(())
    }

    pub fn inject_capital(&self, id: Uuid, amount: f64) -> Result<ProviderSnapshot, EngineError> {
        self.pool.inject_capital(id, amount)?;
        self.pool
            .snapshot(id)
            .ok_or(EngineError::Pool(PoolError::UnknownProvider(id)))
    }

    pub fn update_delivery_status(
        &self,
        id: Uuid,
        status: DeliveryStatus,
    ) -> Result<DeliveryRecord, EngineError> {
        if self.deliveries.get(id).is_none() {
            return Err(EngineError::DeliveryNotFound(id));
        }
        if !self.deliveries.advance_status(id, status) {
            return Err(EngineError::DeliveryRegression(id));
        }
        self.deliveries
            .get(id)
            .ok_or(EngineError::DeliveryNotFound(id))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn order(&self, id: Uuid) -> Option<Order> {
        self.ledger.get(id)
    }

    pub fn orders(&self, account_ref: Option<&str>, state: Option<OrderState>) -> Vec<Order> {
        self.ledger.filtered(account_ref, state)
    }

    pub fn providers(&self) -> Vec<ProviderSnapshot> {
        self.pool.snapshot_all()
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.deliveries.all()
    }

    pub fn totals(&self) -> AggregateTotals {
        let (total_capacity, total_reserved, total_free) = self.pool.totals();
        AggregateTotals {
            providers: self.pool.len(),
            total_capacity,
            total_reserved,
            total_free,
            orders_by_state: self.ledger.counts_by_state(),
            deliveries: self.deliveries.len(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let uptime_seconds = self
            .started_at
            .lock()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        EngineStats {
            is_running: self.is_running(),
            orders_routed: self.orders_routed.load(Ordering::Relaxed),
            orders_settled: self.scheduler.settled_count(),
            orders_failed: self.scheduler.failed_count(),
            execution_timeouts: self.scheduler.timeout_count(),
            capacity_topups: self.pool.topup_count(),
            rebalance_cycles: self.rebalancer.cycle_count(),
            uptime_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EngineConfig, OrderSide};

    fn engine_with_providers(rates: &[(f64, f64)]) -> (Arc<SettlementEngine>, Vec<Uuid>) {
        let config = Arc::new(ConfigManager::new(EngineConfig::default()));
        let engine = SettlementEngine::new(config);
        let ids = rates
            .iter()
            .enumerate()
            .map(|(i, (success, latency))| {
                let mut inventory = HashMap::new();
                inventory.insert(Commodity::Gold9999, 10_000.0);
                engine.register_provider(
                    &format!("LP {}", i),
                    5_000_000.0,
                    inventory,
                    *success,
                    *latency,
                )
            })
            .collect();
        (engine, ids)
    }

    fn position(units: f64) -> PositionClosed {
        PositionClosed {
            account_ref: "ACC-1001".to_string(),
            commodity: Commodity::Gold9999,
            side: OrderSide::Buy,
            units,
            price: 60_000.0,
        }
    }

    async fn wait_for_settled(
        mut rx: broadcast::Receiver<EngineEvent>,
        id: Uuid,
    ) -> Order {
        loop {
            match rx.recv().await.unwrap() {
                EngineEvent::OrderSettled(o) if o.id == id => return o,
                EngineEvent::OrderFailed(o) if o.id == id => {
                    panic!("order failed: {:?}", o.failure_reason)
                }
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_buy_order_settles_and_schedules_delivery() {
        let (engine, providers) = engine_with_providers(&[(1.0, 1000.0)]);
        engine.start();
        let rx = engine.subscribe();

        let order = engine.route_now(&position(10.0)).unwrap();
        let settled = wait_for_settled(rx, order.id).await;

        assert_eq!(settled.state, OrderState::Settled);
        assert_eq!(engine.deliveries().len(), 1);
        assert_eq!(engine.deliveries()[0].order_id, order.id);

        // Conservation across the whole pipeline
        let snap = engine.providers();
        let lp = snap.iter().find(|p| p.id == providers[0]).unwrap();
        assert!(
            (lp.total_capacity - (lp.free_capacity + lp.reserved + lp.allocated)).abs() < 1e-6
        );

        let stats = engine.stats();
        assert_eq!(stats.orders_routed, 1);
        assert_eq!(stats.orders_settled, 1);
        assert_eq!(stats.orders_failed, 0);
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn intake_worker_drains_batches() {
        let (engine, _) = engine_with_providers(&[(1.0, 1000.0)]);
        engine.start();
        let mut rx = engine.subscribe();

        let accepted = engine.submit_batch(vec![position(2.0), position(3.0), position(4.0)]);
        assert_eq!(accepted, 3);

        let mut settled = 0;
        while settled < 3 {
            if let EngineEvent::OrderSettled(_) = rx.recv().await.unwrap() {
                settled += 1;
            }
        }
        assert_eq!(engine.stats().orders_routed, 3);
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_reserved_order_releases_capacity() {
        let (engine, providers) = engine_with_providers(&[(1.0, 1000.0)]);

        // route_now spawns the execution task but it has not been polled
        // yet, so the cancel lands first
        let order = engine.route_now(&position(10.0)).unwrap();
        let cancelled = engine.cancel_order(order.id).unwrap();
        assert_eq!(cancelled.state, OrderState::Failed);

        // Scheduler task wakes up, loses the race, leaves the books alone
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;

        let lp = engine
            .providers()
            .into_iter()
            .find(|p| p.id == providers[0])
            .unwrap();
        assert!((lp.reserved - 0.0).abs() < 1e-6);
        assert!((lp.free_capacity - lp.total_capacity).abs() < 1e-6);
        assert!(lp.allocated.abs() < 1e-6);
        // Buy-side inventory drawn down at reserve time is back too
        assert!((lp.inventory[&Commodity::Gold9999] - 10_000.0).abs() < 1e-9);

        let stored = engine.order(order.id).unwrap();
        assert_eq!(stored.state, OrderState::Failed);
        assert!(stored.executed_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn settled_orders_cannot_be_cancelled() {
        let (engine, _) = engine_with_providers(&[(1.0, 1000.0)]);
        engine.start();
        let rx = engine.subscribe();

        let order = engine.route_now(&position(5.0)).unwrap();
        wait_for_settled(rx, order.id).await;

        let err = engine.cancel_order(order.id).unwrap_err();
        assert!(matches!(err, EngineError::NotCancellable(_)));
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_provider_finishes_in_flight_work_but_gets_no_new_orders() {
        // Scenario: two providers, the better one goes into maintenance
        // while its order is executing
        let (engine, providers) = engine_with_providers(&[(1.0, 500.0), (1.0, 2000.0)]);
        engine.start();
        let rx = engine.subscribe();

        let first = engine.route_now(&position(5.0)).unwrap();
        assert_eq!(first.provider_id, Some(providers[0]));
        engine
            .mark_connectivity(providers[0], Connectivity::Disconnected)
            .unwrap();

        // In-flight order still completes against the disconnected provider
        let settled = wait_for_settled(rx, first.id).await;
        assert_eq!(settled.provider_id, Some(providers[0]));

        // New orders avoid it
        let second = engine.route_now(&position(5.0)).unwrap();
        assert_eq!(second.provider_id, Some(providers[1]));
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_status_follows_the_forward_path() {
        let (engine, _) = engine_with_providers(&[(1.0, 1000.0)]);
        engine.start();
        let rx = engine.subscribe();

        let order = engine.route_now(&position(5.0)).unwrap();
        wait_for_settled(rx, order.id).await;

        let delivery = engine.deliveries()[0].clone();
        let updated = engine
            .update_delivery_status(delivery.id, DeliveryStatus::InTransit)
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::InTransit);

        let err = engine
            .update_delivery_status(delivery.id, DeliveryStatus::Scheduled)
            .unwrap_err();
        assert!(matches!(err, EngineError::DeliveryRegression(_)));
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn inject_capital_raises_free_capacity() {
        let (engine, providers) = engine_with_providers(&[(1.0, 1000.0)]);

        let before = engine
            .providers()
            .into_iter()
            .find(|p| p.id == providers[0])
            .unwrap();
        let after = engine.inject_capital(providers[0], 500_000.0).unwrap();
        assert!((after.free_capacity - (before.free_capacity + 500_000.0)).abs() < 1e-6);

        let totals = engine.totals();
        assert!((totals.total_capacity - after.total_capacity).abs() < 1e-6);
    }
}

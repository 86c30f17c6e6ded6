//! Background liquidity rebalancer
//!
//! Periodically raises any connected provider whose free capacity has
//! drifted below 30% of the pool's average back up to 80% of it. Goes
//! through the same pool entry points as routing, so cycles interleave
//! safely with in-flight orders.

use crate::config::ConfigManager;
use crate::pool::ProviderPool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct RebalancerJob {
    pool: Arc<ProviderPool>,
    config: Arc<ConfigManager>,
    running: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
}

impl RebalancerJob {
    pub fn new(pool: Arc<ProviderPool>, config: Arc<ConfigManager>) -> Self {
        Self {
            pool,
            config,
            running: Arc::new(AtomicBool::new(false)),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the periodic loop; idempotent
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let config = Arc::clone(&self.config);
        let running = Arc::clone(&self.running);
        let cycles = Arc::clone(&self.cycles);

        tokio::spawn(async move {
            let snapshot = config.get();
            info!(
                "⚖️ Rebalancer started (every {}ms)",
                snapshot.rebalance_interval_ms
            );
            let mut ticker =
                tokio::time::interval(Duration::from_millis(snapshot.rebalance_interval_ms));
            // First tick completes immediately; skip it so the loop waits a
            // full interval before the first cycle
            ticker.tick().await;

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let current = config.get();
                let topped_up = pool.rebalance_below_floor(&current);
                cycles.fetch_add(1, Ordering::Relaxed);
                if topped_up > 0 {
                    info!("⚖️ Rebalance cycle topped up {} providers", topped_up);
                } else {
                    debug!("Rebalance cycle: all providers above floor");
                }
            }
            info!("Rebalancer stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Commodity, EngineConfig, OrderSide};
    use std::collections::HashMap;

    #[tokio::test(start_paused = true)]
    async fn periodic_cycle_restores_drained_providers() {
        let pool = Arc::new(ProviderPool::new());
        let mut inventory = HashMap::new();
        inventory.insert(Commodity::Gold9999, 1_000.0);
        let rich = pool.register("Rich LP", 1_000_000.0, inventory.clone(), 0.95, 1000.0);
        let drained = pool.register("Drained LP", 200_000.0, inventory, 0.95, 1000.0);
        // Drain it below the floor
        pool.reserve(drained, 195_000.0, Commodity::Gold9999, 1.0, OrderSide::Buy)
            .unwrap();

        let config = Arc::new(ConfigManager::new(EngineConfig::default()));
        let job = RebalancerJob::new(Arc::clone(&pool), Arc::clone(&config));
        job.start();

        tokio::time::sleep(Duration::from_millis(31_000)).await;
        tokio::task::yield_now().await;

        let avg_free = (1_000_000.0 + 5_000.0) / 2.0;
        let floor = avg_free * config.get().rebalance_floor_ratio;
        let snap = pool.snapshot(drained).unwrap();
        assert!(snap.free_capacity >= floor);
        // Reserved capital untouched by the top-up
        assert!((snap.reserved - 195_000.0).abs() < 1e-6);
        // Healthy provider left alone
        let rich_snap = pool.snapshot(rich).unwrap();
        assert!((rich_snap.free_capacity - 1_000_000.0).abs() < 1e-6);
        assert!(job.cycle_count() >= 1);

        job.stop();
        assert!(!job.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let pool = Arc::new(ProviderPool::new());
        let config = Arc::new(ConfigManager::new(EngineConfig::default()));
        let job = RebalancerJob::new(pool, config);

        job.start();
        job.start();
        assert!(job.is_running());

        tokio::time::sleep(Duration::from_millis(61_000)).await;
        tokio::task::yield_now().await;
        // Only one loop running: two intervals, two cycles
        assert_eq!(job.cycle_count(), 2);
        job.stop();
    }
}

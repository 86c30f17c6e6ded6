//! Provider pool - authoritative store of liquidity provider state
//!
//! The pool is the only component allowed to mutate reserved capacity,
//! allocated capital, or inventory. Every mutation goes through one mutex
//! per provider, so conflicting operations on the same provider serialize
//! while unrelated providers proceed in parallel.
//!
//! Capacity accounting: `total = free + reserved + allocated` at every
//! quiescent point. A release or adjust that would break that identity is a
//! programming error and is rejected, never clamped.

use crate::types::{Commodity, Connectivity, EngineConfig, OrderSide, ProviderSnapshot};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Tolerance for f64 capital comparisons
const EPS: f64 = 1e-6;

/// Smoothing factor for rolling success-rate / latency stats
const STATS_ALPHA: f64 = 0.1;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PoolError {
    #[error("unknown provider {0}")]
    UnknownProvider(Uuid),
    #[error("insufficient capacity on {provider}: requested {requested:.0}, free {free:.0}")]
    InsufficientCapacity {
        provider: Uuid,
        requested: f64,
        free: f64,
    },
    #[error("insufficient {commodity} inventory on {provider}: requested {requested:.2}, held {held:.2}")]
    InsufficientInventory {
        provider: Uuid,
        commodity: Commodity,
        requested: f64,
        held: f64,
    },
    #[error("capacity accounting violation on {provider}: {detail}")]
    AccountingViolation { provider: Uuid, detail: String },
}

/// Internal provider state, guarded by one mutex per provider
struct ProviderState {
    id: Uuid,
    name: String,
    total_capacity: f64,
    reserved: f64,
    allocated: f64,
    inventory: HashMap<Commodity, f64>,
    connectivity: Connectivity,
    success_rate: f64,
    avg_latency_ms: f64,
}

impl ProviderState {
    fn free(&self) -> f64 {
        self.total_capacity - self.reserved - self.allocated
    }

    fn held(&self, commodity: Commodity) -> f64 {
        self.inventory.get(&commodity).copied().unwrap_or(0.0)
    }
}

/// A scored routing candidate
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub id: Uuid,
    pub name: String,
    pub score: f64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

/// Concurrency-safe registry of liquidity providers
pub struct ProviderPool {
    providers: DashMap<Uuid, Arc<Mutex<ProviderState>>>,
    topups: AtomicU64,
    rebalanced: AtomicU64,
}

impl ProviderPool {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            topups: AtomicU64::new(0),
            rebalanced: AtomicU64::new(0),
        }
    }

    /// Register a provider and return its id
    pub fn register(
        &self,
        name: &str,
        total_capacity: f64,
        inventory: HashMap<Commodity, f64>,
        success_rate: f64,
        avg_latency_ms: f64,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let state = ProviderState {
            id,
            name: name.to_string(),
            total_capacity,
            reserved: 0.0,
            allocated: 0.0,
            inventory,
            connectivity: Connectivity::Connected,
            success_rate,
            avg_latency_ms,
        };
        self.providers.insert(id, Arc::new(Mutex::new(state)));
        info!(
            "Registered provider {} ({}) with {:.0} capacity",
            name, id, total_capacity
        );
        id
    }

    fn entry(&self, id: Uuid) -> Result<Arc<Mutex<ProviderState>>, PoolError> {
        self.providers
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(PoolError::UnknownProvider(id))
    }

    /// Score eligible providers for an order, best first
    ///
    /// Deterministic for a frozen snapshot: ties break on provider id.
    pub fn score(
        &self,
        order_value: f64,
        commodity: Commodity,
        side: OrderSide,
        units: f64,
        exclude: &HashSet<Uuid>,
        config: &EngineConfig,
    ) -> Vec<ScoredCandidate> {
        let mut candidates = Vec::new();

        for entry in self.providers.iter() {
            let provider = entry.value().lock();

            if exclude.contains(&provider.id) {
                continue;
            }
            if provider.connectivity != Connectivity::Connected {
                continue;
            }
            if provider.free() < order_value * config.min_margin_ratio {
                continue;
            }
            // Buy orders draw down the provider's physical inventory
            if side == OrderSide::Buy && provider.held(commodity) < units {
                continue;
            }

            candidates.push(ScoredCandidate {
                id: provider.id,
                name: provider.name.clone(),
                score: score_provider(&provider, order_value, config),
                success_rate: provider.success_rate,
                avg_latency_ms: provider.avg_latency_ms,
            });
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// Atomically check and reserve capacity (and inventory, for buys)
    pub fn reserve(
        &self,
        id: Uuid,
        amount: f64,
        commodity: Commodity,
        units: f64,
        side: OrderSide,
    ) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let mut provider = entry.lock();

        if provider.free() + EPS < amount {
            return Err(PoolError::InsufficientCapacity {
                provider: id,
                requested: amount,
                free: provider.free(),
            });
        }
        if side == OrderSide::Buy {
            let held = provider.held(commodity);
            if held + EPS < units {
                return Err(PoolError::InsufficientInventory {
                    provider: id,
                    commodity,
                    requested: units,
                    held,
                });
            }
            *provider.inventory.entry(commodity).or_insert(0.0) -= units;
        }
        provider.reserved += amount;
        Ok(())
    }

    /// Return reserved capital to free capacity
    pub fn release(&self, id: Uuid, amount: f64) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let mut provider = entry.lock();

        if amount > provider.reserved + EPS {
            return Err(PoolError::AccountingViolation {
                provider: id,
                detail: format!(
                    "release of {:.2} exceeds reserved {:.2}",
                    amount, provider.reserved
                ),
            });
        }
        provider.reserved -= amount;
        Ok(())
    }

    /// Permanently allocate (delta < 0) or free up (delta > 0) capital
    ///
    /// A negative delta moves |delta| from reserved into allocated - the
    /// settlement path for realized spread. A positive delta returns
    /// previously allocated capital to free capacity.
    pub fn adjust(&self, id: Uuid, delta: f64) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let mut provider = entry.lock();

        if delta < 0.0 {
            let amount = -delta;
            if amount > provider.reserved + EPS {
                return Err(PoolError::AccountingViolation {
                    provider: id,
                    detail: format!(
                        "allocation of {:.2} exceeds reserved {:.2}",
                        amount, provider.reserved
                    ),
                });
            }
            provider.reserved -= amount;
            provider.allocated += amount;
        } else if delta > 0.0 {
            if delta > provider.allocated + EPS {
                return Err(PoolError::AccountingViolation {
                    provider: id,
                    detail: format!(
                        "deallocation of {:.2} exceeds allocated {:.2}",
                        delta, provider.allocated
                    ),
                });
            }
            provider.allocated -= delta;
        }
        Ok(())
    }

    /// Unwind a failed or cancelled reservation in one atomic step: the
    /// capital goes back to free capacity and, for buy orders, the units
    /// drawn down at reserve time go back to inventory.
    pub fn unwind_reservation(
        &self,
        id: Uuid,
        amount: f64,
        commodity: Commodity,
        units: f64,
        side: OrderSide,
    ) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let mut provider = entry.lock();

        if amount > provider.reserved + EPS {
            return Err(PoolError::AccountingViolation {
                provider: id,
                detail: format!(
                    "unwind of {:.2} exceeds reserved {:.2}",
                    amount, provider.reserved
                ),
            });
        }
        provider.reserved -= amount;
        if side == OrderSide::Buy {
            *provider.inventory.entry(commodity).or_insert(0.0) += units;
        }
        Ok(())
    }

    /// Return physical units to a provider's inventory (sell-side settlement)
    pub fn return_inventory(
        &self,
        id: Uuid,
        commodity: Commodity,
        units: f64,
    ) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let mut provider = entry.lock();
        *provider.inventory.entry(commodity).or_insert(0.0) += units;
        Ok(())
    }

    /// Mark connectivity; takes effect on the next scoring pass
    pub fn mark_connectivity(&self, id: Uuid, state: Connectivity) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let mut provider = entry.lock();
        provider.connectivity = state;
        info!("Provider {} marked {}", provider.name, state.as_str());
        Ok(())
    }

    /// Inject fresh capital into a provider (raises total capacity)
    pub fn inject_capital(&self, id: Uuid, amount: f64) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let mut provider = entry.lock();
        provider.total_capacity += amount;
        info!(
            "💰 Injected {:.0} into {}, free capacity now {:.0}",
            amount,
            provider.name,
            provider.free()
        );
        Ok(())
    }

    /// Fold an execution outcome into the provider's rolling stats
    pub fn record_outcome(
        &self,
        id: Uuid,
        success: bool,
        latency_ms: f64,
    ) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let mut provider = entry.lock();
        let observed = if success { 1.0 } else { 0.0 };
        provider.success_rate =
            (1.0 - STATS_ALPHA) * provider.success_rate + STATS_ALPHA * observed;
        provider.avg_latency_ms =
            (1.0 - STATS_ALPHA) * provider.avg_latency_ms + STATS_ALPHA * latency_ms;
        Ok(())
    }

    /// Liveness escape hatch: when no provider is eligible, raise the
    /// best-ranked remaining one to twice the order value and reconnect it.
    ///
    /// Trades strict capital accounting for order-success liveness, so it is
    /// logged loudly and counted.
    pub fn top_up_best(
        &self,
        order_value: f64,
        commodity: Commodity,
        units: f64,
        exclude: &HashSet<Uuid>,
        config: &EngineConfig,
    ) -> Option<Uuid> {
        // Rank everything that is not excluded, ignoring eligibility
        let mut ranked: Vec<(Uuid, f64)> = Vec::new();
        for entry in self.providers.iter() {
            let provider = entry.value().lock();
            if exclude.contains(&provider.id) {
                continue;
            }
            ranked.push((provider.id, score_provider(&provider, order_value, config)));
        }
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let (id, _) = ranked.first().copied()?;
        let entry = self.entry(id).ok()?;
        let mut provider = entry.lock();

        let target_free = order_value * 2.0;
        if provider.free() < target_free {
            provider.total_capacity += target_free - provider.free();
        }
        let held = provider.held(commodity);
        if held < units {
            *provider.inventory.entry(commodity).or_insert(0.0) += units - held;
        }
        provider.connectivity = Connectivity::Connected;

        self.topups.fetch_add(1, Ordering::Relaxed);
        warn!(
            "🚨 Capacity top-up on {}: free raised to {:.0} to keep routing live",
            provider.name,
            provider.free()
        );
        Some(id)
    }

    /// One rebalance cycle: raise every connected provider whose free
    /// capacity sits below the floor up to the target. Returns the number
    /// of providers topped up.
    pub fn rebalance_below_floor(&self, config: &EngineConfig) -> usize {
        let ids: Vec<Uuid> = self.providers.iter().map(|e| *e.key()).collect();
        if ids.is_empty() {
            return 0;
        }

        let mut total_free = 0.0;
        for id in &ids {
            if let Ok(entry) = self.entry(*id) {
                total_free += entry.lock().free();
            }
        }
        let avg_free = total_free / ids.len() as f64;
        let floor = avg_free * config.rebalance_floor_ratio;
        let target = avg_free * config.rebalance_target_ratio;

        let mut count = 0;
        for id in &ids {
            let Ok(entry) = self.entry(*id) else { continue };
            let mut provider = entry.lock();
            if provider.connectivity == Connectivity::Disconnected {
                continue;
            }
            let free = provider.free();
            if free < floor {
                provider.total_capacity += target - free;
                count += 1;
                info!(
                    "⚖️ Rebalanced {}: free {:.0} → {:.0}",
                    provider.name, free, target
                );
            }
        }

        if count > 0 {
            self.rebalanced.fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Snapshot a single provider for the query surface
    pub fn snapshot(&self, id: Uuid) -> Option<ProviderSnapshot> {
        let entry = self.entry(id).ok()?;
        let provider = entry.lock();
        Some(snapshot_of(&provider))
    }

    /// Snapshot all providers, ordered by name for stable output
    pub fn snapshot_all(&self) -> Vec<ProviderSnapshot> {
        let mut snapshots: Vec<ProviderSnapshot> = self
            .providers
            .iter()
            .map(|entry| snapshot_of(&entry.value().lock()))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// (total capacity, total reserved, total free) across the pool
    pub fn totals(&self) -> (f64, f64, f64) {
        let mut capacity = 0.0;
        let mut reserved = 0.0;
        let mut free = 0.0;
        for entry in self.providers.iter() {
            let provider = entry.value().lock();
            capacity += provider.total_capacity;
            reserved += provider.reserved;
            free += provider.free();
        }
        (capacity, reserved, free)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn topup_count(&self) -> u64 {
        self.topups.load(Ordering::Relaxed)
    }

    pub fn rebalanced_count(&self) -> u64 {
        self.rebalanced.load(Ordering::Relaxed)
    }
}

impl Default for ProviderPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Score = 0.4·success + 0.3·latency factor + 0.3·capacity coverage
fn score_provider(provider: &ProviderState, order_value: f64, config: &EngineConfig) -> f64 {
    let latency_factor = if provider.avg_latency_ms > 0.0 {
        (1000.0 / provider.avg_latency_ms).min(1.0)
    } else {
        1.0
    };
    let coverage = if order_value > 0.0 {
        (provider.free() / order_value).clamp(0.0, 1.0)
    } else {
        1.0
    };
    config.weight_success * provider.success_rate
        + config.weight_latency * latency_factor
        + config.weight_capacity * coverage
}

fn snapshot_of(provider: &ProviderState) -> ProviderSnapshot {
    ProviderSnapshot {
        id: provider.id,
        name: provider.name.clone(),
        total_capacity: provider.total_capacity,
        reserved: provider.reserved,
        allocated: provider.allocated,
        free_capacity: provider.free(),
        inventory: provider.inventory.clone(),
        connectivity: provider.connectivity,
        success_rate: provider.success_rate,
        avg_latency_ms: provider.avg_latency_ms,
    }
}

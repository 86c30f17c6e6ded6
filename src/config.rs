//! Config manager - stores engine configuration settings
//!
//! Runtime-configurable routing and settlement policy. Values are seeded
//! from the environment at startup and can be updated through the API.

use crate::types::EngineConfig;
use parking_lot::RwLock;
use tracing::info;

/// Manages engine configuration
pub struct ConfigManager {
    config: RwLock<EngineConfig>,
}

impl ConfigManager {
    pub fn new(config: EngineConfig) -> Self {
        info!(
            "Initialized config manager: min_margin={:.2}, retries={}, rebalance every {}ms",
            config.min_margin_ratio, config.max_retries, config.rebalance_interval_ms
        );
        Self {
            config: RwLock::new(config),
        }
    }

    /// Build configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();

        if let Some(v) = env_f64("MIN_MARGIN_RATIO") {
            config.min_margin_ratio = v;
        }
        if let Some(v) = env_f64("MIN_ORDER_VALUE") {
            config.min_order_value = v;
        }
        if let Some(v) = env_f64("MAX_ORDER_VALUE") {
            config.max_order_value = v;
        }
        if let Some(v) = env_u64("MAX_RETRIES") {
            config.max_retries = v as u32;
        }
        if let Some(v) = env_f64("SPREAD_BPS") {
            config.spread_bps = v;
        }
        if let Some(v) = env_u64("REBALANCE_INTERVAL_MS") {
            config.rebalance_interval_ms = v;
        }

        Self::new(config)
    }

    /// Get a copy of the current configuration
    pub fn get(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Update routing policy from the API
    pub fn update_policy(
        &self,
        min_margin_ratio: Option<f64>,
        min_order_value: Option<f64>,
        max_order_value: Option<f64>,
        max_retries: Option<u32>,
    ) {
        let mut config = self.config.write();

        if let Some(ratio) = min_margin_ratio {
            config.min_margin_ratio = ratio;
            info!("Updated min margin ratio to {:.2}", ratio);
        }
        if let Some(min) = min_order_value {
            config.min_order_value = min;
            info!("Updated min order value to {:.0}", min);
        }
        if let Some(max) = max_order_value {
            config.max_order_value = max;
            info!("Updated max order value to {:.0}", max);
        }
        if let Some(retries) = max_retries {
            config.max_retries = retries;
            info!("Updated max retries to {}", retries);
        }
    }

    /// Update rebalancer settings
    pub fn update_rebalancer(
        &self,
        interval_ms: Option<u64>,
        floor_ratio: Option<f64>,
        target_ratio: Option<f64>,
    ) {
        let mut config = self.config.write();

        if let Some(interval) = interval_ms {
            config.rebalance_interval_ms = interval;
            info!("Updated rebalance interval to {}ms", interval);
        }
        if let Some(floor) = floor_ratio {
            config.rebalance_floor_ratio = floor;
            info!("Updated rebalance floor ratio to {:.2}", floor);
        }
        if let Some(target) = target_ratio {
            config.rebalance_target_ratio = target;
            info!("Updated rebalance target ratio to {:.2}", target);
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

//! Gold settlement engine - order routing and settlement server
//!
//! Closed positions come in over HTTP, get routed to a liquidity provider
//! under capacity constraints, execute asynchronously and settle into
//! scheduled physical deliveries.

mod api;
mod config;
mod engine;
mod events;
mod ledger;
mod pool;
mod rebalancer;
mod router;
mod scheduler;
mod settlement;
mod types;

use crate::api::create_router;
use crate::config::ConfigManager;
use crate::engine::SettlementEngine;
use crate::types::Commodity;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across all handlers
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
    pub config: Arc<ConfigManager>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Gold Settlement Engine - Routing Server v1.0      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8000".to_string())
        .parse()
        .unwrap_or(8000);

    let config = Arc::new(ConfigManager::from_env());
    let engine = SettlementEngine::new(Arc::clone(&config));

    if std::env::var("SKIP_SEED_PROVIDERS").is_err() {
        seed_providers(&engine);
    }

    info!("Starting settlement engine...");
    engine.start();

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        config,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting API server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.stop();
    info!("Server shutdown complete");
    Ok(())
}

/// Default liquidity providers: major institutions with gold trading desks
fn seed_providers(engine: &SettlementEngine) {
    let seeds: [(&str, f64, [(Commodity, f64); 3], f64, f64); 3] = [
        (
            "Vietcombank Gold Trading",
            50_000_000_000.0,
            [
                (Commodity::Gold9999, 10_000.0),
                (Commodity::GoldCoin, 5_000.0),
                (Commodity::GoldBar, 2_000.0),
            ],
            0.985,
            1200.0,
        ),
        (
            "BIDV Gold Services",
            30_000_000_000.0,
            [
                (Commodity::Gold9999, 8_000.0),
                (Commodity::GoldCoin, 3_000.0),
                (Commodity::GoldBar, 1_500.0),
            ],
            0.972,
            1500.0,
        ),
        (
            "Techcombank Precious Metals",
            25_000_000_000.0,
            [
                (Commodity::Gold9999, 6_000.0),
                (Commodity::GoldCoin, 2_500.0),
                (Commodity::GoldBar, 1_200.0),
            ],
            0.988,
            1100.0,
        ),
    ];

    let count = seeds.len();
    for (name, capacity, inventory, success_rate, latency) in seeds {
        let inventory: HashMap<Commodity, f64> = inventory.into_iter().collect();
        engine.register_provider(name, capacity, inventory, success_rate, latency);
    }
    info!("🏦 Seeded {} liquidity providers", count);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}

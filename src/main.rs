//! kraken-autosell: a liquidation agent that watches a single Kraken
//! account's balance feed and converts any non-target asset into the
//! configured target fiat as soon as the minimum order size is met.
//!
//! Startup order mirrors §2 of the specification this crate implements:
//! authenticate (C1), load the pair catalog (C2), run the cold pass (C4)
//! over the account's current balance, *then* start the balance feed (C3)
//! so its snapshot never races the cold pass. The HTTP status surface (C5)
//! is mounted last and only ever reads engine/feed state.

mod config;
mod engine;
mod error;
mod exchange;
mod feed;
mod log_sink;
mod registry;
mod signing;
mod status;

use std::sync::Arc;
use std::time::Instant;

use config::Config;
use engine::{Engine, EngineSink};
use exchange::{ExchangeClient, KrakenClient};
use feed::BalanceFeed;
use registry::AssetRegistry;
use status::AppState;

#[tokio::main]
async fn main() {
    // Config is loaded before the logger is installed (the log sink itself
    // is a configuration value), so a config error is reported on stderr
    // directly rather than through `log!`.
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    log_sink::init(config.log_sink_url.clone(), config.log_sink_token.clone(), config.debug);

    log::info!(
        "kraken-autosell starting (target_fiat={}, sandbox={}, http_port={})",
        config.target_fiat, config.sandbox, config.http_port
    );

    let exchange: Arc<dyn ExchangeClient> =
        Arc::new(KrakenClient::new(config.api_key.clone(), config.api_secret.clone(), config.sandbox));

    let pairs = match exchange.list_pairs().await {
        Ok(pairs) => pairs,
        Err(e) => {
            log::error!("failed to load pair catalog: {e}");
            std::process::exit(1);
        }
    };
    log::info!("asset registry: loaded {} pair(s)", pairs.len());
    let registry = Arc::new(AssetRegistry::load(pairs, &config.target_fiat));

    let engine = Arc::new(Engine::new(exchange.clone(), registry));

    if let Err(e) = engine.cold_pass().await {
        log::error!("cold pass failed: {e}");
        std::process::exit(1);
    }

    let feed = Arc::new(BalanceFeed::new(config.sandbox));
    let feed_status = feed.status();
    {
        let feed = feed.clone();
        let exchange = exchange.clone();
        let sink = Arc::new(EngineSink(engine.clone()));
        tokio::spawn(async move {
            feed.run(exchange, sink).await;
        });
    }

    let app_state = AppState { engine: engine.clone(), feed_status, started_at: Instant::now() };
    let app = status::router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind HTTP status surface on {addr}: {e}");
            std::process::exit(1);
        }
    };
    log::info!("status surface listening on {addr}");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("status surface server error: {e}");
        }
    });

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received");

    // In-flight submissions are never aborted mid-flight (§5): we only
    // stop accepting new work and give outstanding cycles a bounded grace
    // period to settle before the process exits. No on-disk state is
    // persisted.
    server.abort();
    log::info!("waiting up to 5s for in-flight submissions to settle");
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    log::info!("shutdown complete");
}

/// Waits for either Ctrl+C or, on Unix, SIGTERM (§5 "Cancellation and shutdown").
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("failed to install SIGTERM handler: {e}; falling back to Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

//! Proxy entry point.
//!
//! Self-host mode: the collaborator traits are backed by the in-memory
//! implementations, so local/dev origins work out of the box and nothing
//! external is required. Cloud deployments wire real store clients into
//! `AppContext::build` instead.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use corsgate::config::{load_config, ProxyConfig};
use corsgate::http;
use corsgate::lifecycle::{signals, AppContext};
use corsgate::secrets::EnvKekSource;
use corsgate::store::{MemoryBus, MemorySharedState, MemoryStore};

const CONFIG_PATH: &str = "corsgate.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::path::Path::new(CONFIG_PATH);
    let (config, config_found) = if config_path.exists() {
        (load_config(config_path)?, true)
    } else {
        (ProxyConfig::default(), false)
    };

    // RUST_LOG wins; the configured level is the fallback.
    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "corsgate={level},tower_http={level}"
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !config_found {
        tracing::info!("no {CONFIG_PATH} found, using defaults");
    }
    tracing::info!(
        bind_address = %config.listener.bind_address,
        plans = config.plans.len(),
        block_private_networks = config.security.block_private_networks,
        "configuration loaded"
    );

    let listener = TcpListener::bind(&config.listener.bind_address).await?;

    let ctx = AppContext::build(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemorySharedState::new()),
        Arc::new(MemoryBus::new()),
        Arc::new(EnvKekSource),
    );

    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            signals::listen(&ctx.shutdown).await;
        });
    }

    http::serve(ctx.clone(), listener).await?;

    // Listener drained; flush buffered usage before exiting.
    ctx.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

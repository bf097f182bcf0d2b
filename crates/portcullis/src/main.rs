//! # Portcullis - login guard sidecar
//!
//! Serves the policy gate over HTTP so a host's login pipeline can ask
//! whether an attempt may proceed and report how it went.
//!
//! ## Architecture
//! ```text
//! Login form → Host app → Portcullis → Store (memory | Redis)
//!                              ↓
//!                         Notifier (log | webhook)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use portcullis::config::{AppConfig, CliOverrides};
use portcullis::routes;
use portcullis::state::AppState;

/// Portcullis - brute-force login guard
#[derive(Parser, Debug)]
#[command(name = "portcullis")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/portcullis.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Portcullis v{}", env!("CARGO_PKG_VERSION"));

    let overrides = CliOverrides {
        redis_url: args.redis_url.clone(),
        listen_addr: args.listen.clone(),
    };
    let config = AppConfig::load(&args.config, &overrides)?;
    info!(
        path = %args.config,
        backend = ?config.backend,
        fail_mode = ?config.fail_mode,
        max_attempts = config.policy.max_attempts,
        lockout_minutes = config.policy.lockout_minutes,
        "Configuration loaded"
    );

    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(config).await?;
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("Portcullis listening on {}", listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Portcullis shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}

//! tcprelay - transparent TCP relay
//!
//! Accepts client connections and splices each one onto a new connection to
//! a fixed backend.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcprelay::{config::ConfigManager, ConnectionManager, ShutdownCoordinator};

/// CLI arguments for tcprelay
#[derive(Parser, Debug)]
#[command(name = "tcprelay")]
#[command(about = "tcprelay - transparent TCP relay")]
#[command(version)]
#[command(long_about = "
tcprelay - transparent TCP relay

Every accepted client connection is paired with a new connection to the
backend, and bytes are forwarded both ways until either side closes.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TCPRELAY_BIND_ADDR        - Bind address (e.g., 127.0.0.1:2000)
  TCPRELAY_BACKEND_ADDR     - Backend address (e.g., 127.0.0.1:3000)
  TCPRELAY_MAX_CONNECTIONS  - Maximum concurrent sessions
  TCPRELAY_HIGH_WATER_MARK  - Unsent bytes per leg before the session is cut
  TCPRELAY_CONNECT_TIMEOUT  - Backend connect timeout (e.g., 10s)
  TCPRELAY_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 127.0.0.1:2000)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Backend address (overrides config file)
    #[arg(long, help = "Backend address as host:port")]
    pub backend: Option<String>,

    #[arg(long, help = "Unsent bytes per leg before the session is terminated")]
    pub high_water_mark: Option<usize>,

    #[arg(long, help = "Backend connect timeout in seconds")]
    pub connect_timeout: Option<u64>,

    #[arg(long, help = "Maximum number of concurrent sessions")]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Priority: CLI args > config file > environment > defaults
    let mut config = ConfigManager::load(&args.config)?;

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.backend.as_deref(),
        args.max_connections,
        args.high_water_mark,
        args.connect_timeout,
    );
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    init_tracing(&args, &config.logging.level)?;
    info!("Starting tcprelay v{}", env!("CARGO_PKG_VERSION"));

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Backend: {}", config.relay.backend_addr);
        info!("  Max connections: {}", config.server.max_connections);
        info!("  High-water mark: {} bytes ({:?})",
              config.relay.high_water_mark, config.relay.on_high_water_mark);
        info!("  Connect timeout: {:?}", config.relay.connect_timeout);
        info!("  Shutdown timeout: {:?}", config.server.shutdown_timeout);
        return Ok(());
    }

    info!("Relaying {} -> {}", config.server.bind_addr, config.relay.backend_addr);

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let mut manager = ConnectionManager::with_shutdown(Arc::new(config), shutdown_coordinator.sender());
    manager.bind().await?;
    let stats = manager.stats();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = manager.start().await {
            error!("Server error: {}", e);
        }
    });

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    info!("Initiating graceful shutdown...");
    shutdown_coordinator.shutdown_connections(&stats).await?;

    if let Err(e) = server_handle.await {
        if !e.is_cancelled() {
            error!("Server task failed: {}", e);
        }
    }

    let snapshot = stats.snapshot();
    info!(
        total_sessions = snapshot.total_sessions,
        rejected = snapshot.rejected_connections,
        backpressure_trips = snapshot.backpressure_trips,
        bytes_up = snapshot.bytes_up,
        bytes_down = snapshot.bytes_down,
        "Server shutdown complete"
    );

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, level: &str) -> Result<()> {
    let log_level = if args.verbose { "debug" } else { level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}

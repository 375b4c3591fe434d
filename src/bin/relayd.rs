//! relayd - development pub/sub broker for training logs

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trainrelay::server::{RelayServer, RelayServerConfig};
use trainrelay::storage::MemoryHistoryStore;

#[derive(Parser)]
#[command(name = "relayd")]
#[command(about = "Development WebSocket broker for trainrelay")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8000", env = "RELAYD_BIND")]
    bind: String,

    /// Token signing secret, shared with the token issuer
    #[arg(long, env = "RELAY_SECRET", default_value = "secret")]
    secret: String,

    /// Publications kept per channel
    #[arg(long, env = "RELAYD_HISTORY_SIZE", default_value_t = 1000)]
    history_size: usize,

    /// Seconds between server pings
    #[arg(long, env = "RELAYD_PING_INTERVAL", default_value_t = 25)]
    ping_interval: u64,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    run_server(args).await
}

async fn run_server(args: Args) -> Result<()> {
    let bind_addr = args.bind.parse().context("Invalid bind address")?;

    let mut config = RelayServerConfig::new(bind_addr, args.secret.into_bytes());
    config.history_size = args.history_size.max(1);
    config.ping_interval = Duration::from_secs(args.ping_interval.max(1));

    let history = Arc::new(MemoryHistoryStore::new(config.history_size));
    let server = RelayServer::new(config, history);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    info!(addr = %args.bind, "relayd starting");

    if let Err(e) = server.serve_with_shutdown(listener, shutdown_signal()).await {
        error!(error = %e, "Broker failed");
        return Err(e);
    }

    info!("relayd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping broker");
}

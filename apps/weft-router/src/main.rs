//! weft-router — the routing matrix process.
//!
//! Accepts worker registrations and browser sessions on one control
//! endpoint, hands each worker a shared-memory region, and composites every
//! connected (input, output) pair at 25 fps on a dedicated tick thread.
//!
//! ## Usage
//!
//! ```bash
//! # Start the router (control plane on port 8080)
//! weft-router
//!
//! # Custom bind address
//! WEFT_BIND=0.0.0.0:9090 weft-router
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use weft::server::{spawn_tick, Matrix};
use weft::web::{serve, WebState};

/// Router configuration from environment
struct Config {
    bind: SocketAddr,
}

impl Config {
    fn from_env() -> Self {
        let bind = std::env::var("WEFT_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));
        Self { bind }
    }
}

// Four handler threads alongside the dedicated tick thread.
#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();
    info!("weft router starting");
    info!("  Bind: {}", config.bind);

    let matrix = Arc::new(Matrix::new());
    let cancel = CancellationToken::new();

    // Bind before spawning anything so a bad address is a startup failure.
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind control plane to {}", config.bind))?;

    let tick_thread = spawn_tick(Arc::clone(&matrix), cancel.clone())
        .context("spawn compositor tick thread")?;

    let tracker = TaskTracker::new();
    let state = Arc::new(WebState {
        matrix,
        cancel: cancel.clone(),
    });
    tracker.spawn(async move {
        if let Err(e) = serve(state, listener).await {
            tracing::error!(error = %e, "control plane error");
        }
    });
    tracker.close();

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("Received shutdown signal");
    cancel.cancel();

    // Sessions drop their devices as they drain, unlinking every region.
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after 5s");
    }
    if tick_thread.join().is_err() {
        warn!("Tick thread panicked during shutdown");
    }

    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("weft=info".parse().unwrap()),
        )
        .init();
}

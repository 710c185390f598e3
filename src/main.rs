use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::WardenConfig;
use ratewarden::http::{router, HttpServer};
use ratewarden::ratelimit::{Governor, LimiterRegistry};

/// Adaptive request-rate governor.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = WardenConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        limiters = config.limiters.len(),
        "Configuration loaded"
    );
    if config.limiters.is_empty() {
        warn!("No limiters configured; every admission request will return 404");
    }

    let governor = Arc::new(Governor::in_memory(&config.governor));
    let registry = Arc::new(LimiterRegistry::from_config(
        &config.limiters,
        Arc::clone(&governor),
    )?);
    info!("Governor initialized");

    let sweeper = tokio::spawn(retention_sweep(
        Arc::clone(&governor),
        Arc::clone(&registry),
        Duration::from_secs(config.server.sweep_interval_secs.max(1)),
    ));

    let server = HttpServer::new(config.server.listen_addr, router(registry));
    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.abort();
    governor.flush_events().await;
    info!("Ratewarden stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Periodically delete counter records older than two of the longest
/// configured windows. Limiters share one governor, so a shorter window
/// must not evict records a longer one still counts.
async fn retention_sweep(
    governor: Arc<Governor>,
    registry: Arc<LimiterRegistry>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(window_ms) = registry.all().iter().map(|l| l.rule().window_ms).max() else {
            continue;
        };
        match governor.sweep(window_ms).await {
            Ok(removed) if removed > 0 => info!(removed = removed, "Swept expired counters"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Retention sweep failed"),
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

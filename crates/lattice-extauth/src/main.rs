//! Lattice ExtAuth - Envoy external authorization sidecar

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lattice_extauth::telemetry::{init_telemetry, LogFormat};
use lattice_extauth::{ExtAuthServer, HostCache, Reconciler};

/// Envoy ext_authz server running phased evaluator pipelines per host
#[derive(Parser, Debug)]
#[command(name = "lattice-extauth", version, about, long_about = None)]
struct Cli {
    /// gRPC listen address
    #[arg(long, env = "EXTAUTH_LISTEN_ADDR", default_value = "0.0.0.0:50051")]
    listen: SocketAddr,

    /// Path to the auth configuration file (YAML list of AuthConfig)
    #[arg(long, env = "EXTAUTH_CONFIG")]
    config: PathBuf,

    /// Seconds between configuration file checks
    #[arg(long, env = "EXTAUTH_RELOAD_INTERVAL_SECS", default_value_t = 10)]
    reload_interval_secs: u64,

    /// Per-check evaluation deadline in milliseconds
    #[arg(long, env = "EXTAUTH_TIMEOUT_MS", default_value_t = 2000)]
    timeout_ms: u64,

    /// Log format: json or text
    #[arg(long, env = "EXTAUTH_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(cli.log_format)?;

    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let cache = Arc::new(HostCache::new());
    let reconciler = Arc::new(Reconciler::new(cache.clone(), http_client));

    let report = reconciler
        .load_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    info!(
        path = %cli.config.display(),
        configs = report.updated,
        rejected = report.rejected,
        hosts = cache.len(),
        "Loaded auth configuration"
    );

    let shutdown = CancellationToken::new();

    let watcher = {
        let reconciler = reconciler.clone();
        let path = cli.config.clone();
        let interval = Duration::from_secs(cli.reload_interval_secs.max(1));
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.watch(path, interval, shutdown).await })
    };

    let server = ExtAuthServer::new(cache, cli.listen, Duration::from_millis(cli.timeout_ms));
    let metrics = server.metrics();

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    };

    server.run(signal).await?;

    shutdown.cancel();
    watcher.await.context("configuration watcher panicked")?;

    info!(
        requests = metrics.requests(),
        allowed = metrics.allowed(),
        denied = metrics.denied(),
        not_found = metrics.not_found(),
        avg_evaluation_time_us = metrics.avg_evaluation_time_us(),
        "ExtAuth server stopped"
    );

    Ok(())
}

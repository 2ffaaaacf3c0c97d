//! CidCheck daemon entry point
//!
//! Builds the shared probe host, waits for the DHT client to warm up,
//! and serves the check endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cidcheck_daemon::config::DaemonConfig;
use cidcheck_daemon::http::{router, AppState};
use cidcheck_daemon::metrics::Metrics;
use cidcheck_engine::{CheckEngine, HostConfig, ProbeHost};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cidcheck", about = "Diagnostic probe for content routing and retrieval")]
struct Cli {
    /// HTTP listen address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Use the widened-parallelism DHT client (longer warm-up, faster
    /// lookups)
    #[arg(long)]
    accelerated_dht: bool,

    /// Basic-auth username protecting /metrics
    #[arg(long, env = "CIDCHECK_METRICS_USERNAME")]
    metrics_username: Option<String>,

    /// Basic-auth password protecting /metrics
    #[arg(long, env = "CIDCHECK_METRICS_PASSWORD")]
    metrics_password: Option<String>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load_from(path),
        None => DaemonConfig::from_env(),
    };
    if let Some(addr) = cli.listen_addr {
        config.listen_addr = addr;
    }
    if cli.accelerated_dht {
        config.accelerated_dht = true;
    }
    if cli.metrics_username.is_some() {
        config.metrics_username = cli.metrics_username;
    }
    if cli.metrics_password.is_some() {
        config.metrics_password = cli.metrics_password;
    }

    let host = ProbeHost::new(HostConfig {
        accelerated_dht: config.accelerated_dht,
        ..HostConfig::default()
    })
    .context("building probe host")?;
    info!(peer_id = %host.local_peer_id(), "probe host started");

    if config.accelerated_dht {
        info!("initializing accelerated DHT client, this can take a while...");
    }
    host.await_ready().await;
    info!("DHT client ready");

    let state = AppState {
        engine: CheckEngine::new(host),
        metrics: Arc::new(Metrics::default()),
        metrics_auth: config.metrics_auth(),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("listening on http://{}", config.listen_addr);

    axum::serve(listener, router(state))
        .await
        .context("http server")?;
    Ok(())
}

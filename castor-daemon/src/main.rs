use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use castor_config::DaemonConfig;
use castor_daemon::probe::CapabilityProbe;
use castor_daemon::runtime::WorkerRuntime;
use castor_daemon::stats::SystemSampler;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Castor worker daemon: runs encoder processes on behalf of the
/// coordinator.
#[derive(Parser, Debug)]
#[command(name = "castor-daemon")]
#[command(about = "Castor transcoding worker daemon")]
struct Args {
    /// Path to the daemon TOML config.
    #[arg(short, long, env = "CASTOR_DAEMON_CONFIG")]
    config: Option<PathBuf>,

    /// Coordinator websocket URL (overrides config).
    #[arg(long, env = "CASTOR_COORDINATOR_URL")]
    coordinator_url: Option<String>,

    /// Human-readable daemon name (overrides config).
    #[arg(long, env = "CASTOR_DAEMON_NAME")]
    daemon_name: Option<String>,

    /// Registration auth token (overrides config).
    #[arg(long, env = "CASTOR_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config =
        DaemonConfig::load(args.config.as_deref()).context("failed to load daemon config")?;
    if let Some(url) = args.coordinator_url {
        config.coordinator_url = url;
    }
    if let Some(name) = args.daemon_name {
        config.daemon_name = name;
    }
    if let Some(token) = args.auth_token {
        config.auth_token = Some(token);
    }
    config.validate()?;

    let cpu_count = SystemSampler::new().cpu_count();
    let probe = CapabilityProbe::new(&config, cpu_count);
    let capabilities = probe.run().await.context("capability probe failed")?;

    let runtime = WorkerRuntime::new(Arc::new(config), capabilities);
    info!(daemon_id = %runtime.daemon_id(), "castor daemon starting");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    runtime.run(shutdown).await
}

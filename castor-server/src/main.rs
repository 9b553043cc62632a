use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use castor_config::CoordinatorConfig;
use castor_server::Coordinator;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Castor coordinator: schedules live transcode jobs across worker daemons.
#[derive(Parser, Debug)]
#[command(name = "castor-server")]
#[command(about = "Castor transcoding fabric coordinator")]
struct Args {
    /// Path to the coordinator TOML config.
    #[arg(short, long, env = "CASTOR_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides config).
    #[arg(long, env = "CASTOR_LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,

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
        CoordinatorConfig::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(token) = args.auth_token {
        config.auth_token = Some(token);
    }
    config.validate()?;

    let listen_addr = config.listen_addr;
    let coordinator = Coordinator::new(config);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(%listen_addr, "castor coordinator listening");

    let shutdown_coordinator = coordinator.clone();
    axum::serve(
        listener,
        coordinator
            .router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_coordinator.shutdown().await;
        }
    })
    .await
    .context("server error")?;

    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tunnel_agent::{admin, connector, sync, AgentConfig, AgentService, ConfigStore, RouteSyncConfig};

/// Local agent for the reverse HTTP tunnel.
#[derive(Parser, Debug)]
#[command(name = "tunnel-agent", version)]
struct Cli {
    /// WebSocket control-channel URL, e.g. ws://your-server:9000/connect
    #[arg(long, default_value = "ws://127.0.0.1:9000/connect")]
    server: String,

    /// Token used to connect to the tunnel server
    #[arg(long, env = "TUNNEL_TOKEN")]
    token: String,

    /// Local admin API address
    #[arg(long, default_value = "127.0.0.1:7000")]
    admin_addr: String,

    /// Route config file path (defaults to ~/.tunnel-agent/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control-plane pull endpoint, e.g. http://your-server:18100/agent/routes.
    /// Setting this puts the agent in managed mode.
    #[arg(long)]
    route_sync_url: Option<String>,

    /// Tunnel id for route sync
    #[arg(long)]
    tunnel_id: Option<String>,

    /// Tunnel token for route sync auth
    #[arg(long, env = "TUNNEL_SYNC_TOKEN")]
    tunnel_token: Option<String>,

    /// Route sync polling interval in seconds
    #[arg(long, default_value_t = 5)]
    route_sync_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let route_sync = match cli.route_sync_url {
        Some(url) => {
            let Some(tunnel_id) = cli.tunnel_id else {
                bail!("--tunnel-id is required when --route-sync-url is set");
            };
            let Some(tunnel_token) = cli.tunnel_token else {
                bail!("--tunnel-token is required when --route-sync-url is set");
            };
            let interval_secs = if cli.route_sync_interval_secs == 0 {
                5
            } else {
                cli.route_sync_interval_secs
            };
            Some(RouteSyncConfig {
                url,
                tunnel_id,
                tunnel_token,
                interval: Duration::from_secs(interval_secs),
            })
        }
        None => None,
    };

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let store = ConfigStore::open(config_path.clone()).context("load config")?;

    let service = Arc::new(AgentService::new(
        AgentConfig {
            server_url: cli.server,
            token: cli.token,
            admin_addr: cli.admin_addr.clone(),
            route_sync,
        },
        store,
    )?);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let admin_listener = tokio::net::TcpListener::bind(&cli.admin_addr)
        .await
        .with_context(|| format!("bind admin address {}", cli.admin_addr))?;
    info!("agent admin api listening on http://{}", cli.admin_addr);
    let admin_router = admin::router(service.clone());
    let admin_cancel = cancel.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(admin_cancel.cancelled_owned())
            .await
        {
            error!("admin server error: {}", err);
        }
    });

    tokio::spawn(sync::run(service.clone(), cancel.clone()));

    info!("agent started config={}", config_path.display());
    connector::run(service, cancel.clone()).await;

    // Give the admin server a short window to drain before exit.
    let _ = tokio::time::timeout(Duration::from_secs(5), admin_task).await;
    info!("agent exited");
    Ok(())
}

fn default_config_path() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".tunnel-agent").join("config.json"),
        None => PathBuf::from("./agent-config.json"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

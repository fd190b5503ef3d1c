use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunnel_server::{control_router, public_router, serve, unified_router, Gateway};

/// Public gateway for the reverse HTTP tunnel.
#[derive(Parser, Debug)]
#[command(name = "tunnel-server", version)]
struct Cli {
    /// Serve public traffic and the agent control channel from one
    /// address (e.g. ":80" deployments behind a front proxy)
    #[arg(long)]
    addr: Option<String>,

    /// Public HTTP address
    #[arg(long, default_value = "0.0.0.0:8080")]
    public_addr: String,

    /// Agent WebSocket control address
    #[arg(long, default_value = "0.0.0.0:9000")]
    control_addr: String,

    /// Seconds to wait for an agent response before answering 504
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let gateway = Arc::new(Gateway::new(Duration::from_secs(cli.request_timeout_secs)));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    if let Some(addr) = cli.addr {
        info!("unified gateway starting on {}", addr);
        serve(&addr, unified_router(gateway), cancel).await?;
        return Ok(());
    }

    info!(
        "gateway starting public={} control={}",
        cli.public_addr, cli.control_addr
    );
    tokio::try_join!(
        serve(&cli.public_addr, public_router(gateway.clone()), cancel.clone()),
        serve(&cli.control_addr, control_router(gateway), cancel),
    )?;
    Ok(())
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

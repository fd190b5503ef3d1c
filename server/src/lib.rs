//! # Tunnel Gateway
//!
//! The public side of the reverse tunnel:
//! - Accepts agent control channels at `GET /connect?token=…` (WebSocket)
//! - Keeps the session registry (one live session per token) and the
//!   hostname routing table
//! - Forwards public HTTP requests through the matching session and
//!   multiplexes responses back by request id
//!
//! All shared structures live inside a single [`Gateway`] value; tests
//! instantiate independent gateways in-process.

pub mod api;
pub mod handlers;
pub mod proxy;
pub mod session;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use session::AgentSession;
pub use state::{Gateway, RouteBinding};

fn control_routes() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/connect", get(handlers::ws_connect))
        .route("/healthz", get(api::healthz))
        .route("/debug/state", get(api::debug_state))
}

/// Router for the agent-facing control listener.
pub fn control_router(gateway: Arc<Gateway>) -> Router {
    control_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Router for the public listener: every method, every path, routed by
/// `Host` header.
pub fn public_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .fallback(proxy::handle_public)
        .with_state(gateway)
}

/// Single-listener mode: control endpoints plus the public proxy fallback
/// on one socket, for one-port deployments behind a front proxy.
pub fn unified_router(gateway: Arc<Gateway>) -> Router {
    control_routes()
        .fallback(proxy::handle_public)
        .with_state(gateway)
}

/// Binds `addr` and serves `app` until the cancellation token fires.
pub async fn serve(addr: &str, app: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await?;
    Ok(())
}

//! # Control-Channel Handlers
//!
//! The agent-facing WebSocket logic:
//! - Upgrading `GET /connect?token=…` to a control channel
//! - Swapping the new session into the registry (and retiring a
//!   predecessor holding the same token)
//! - The per-session reader that dispatches inbound envelopes
//! - Cleanup on disconnect: deregistration, route purge, slot failure
//!
//! ## Flow
//! 1. Validate the token (400 when absent)
//! 2. Upgrade; origins are not checked, agents dial in from anywhere on
//!    the public internet
//! 3. Swap the session in, then close the predecessor (never the reverse,
//!    so the registry has no gap for the token)
//! 4. Read envelopes until error, close, or replacement
//! 5. Deregister if still current, purge this token's routes, fail every
//!    outstanding response slot

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitStream;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};
use tunnel_proto::{Envelope, MAX_MESSAGE_BYTES};

use crate::session::AgentSession;
use crate::state::Gateway;

#[derive(Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    token: String,
}

/// `GET /connect?token=…` — upgrades the connection to an agent control
/// channel.
pub async fn ws_connect(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let token = params.token.trim().to_string();
    if token.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing token").into_response();
    }

    ws.max_message_size(MAX_MESSAGE_BYTES)
        .max_frame_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_session(gateway, token, socket, peer))
        .into_response()
}

// ─── Session Lifecycle ──────────────────────────────────────────

async fn handle_session(
    gateway: Arc<Gateway>,
    token: String,
    socket: WebSocket,
    peer: SocketAddr,
) {
    let (sink, stream) = socket.split();
    let session = Arc::new(AgentSession::new(token, sink));

    // Swap-then-close: the registry points at the new session before the
    // predecessor is told to go away.
    if let Some(previous) = gateway.register_session(session.clone()) {
        info!(
            "replacing session token={} (new remote={})",
            session.token(),
            peer
        );
        previous.close();
    }
    info!("agent connected token={} remote={}", session.token(), peer);

    read_loop(&gateway, &session, stream).await;

    // Cleanup. A session that was replaced must not tear down its
    // successor's registration or routes; its own slots die either way.
    gateway.remove_session_if_current(&session);
    session.fail_all_pending();
    info!("agent disconnected token={}", session.token());
}

/// Owns inbound decoding for one session. Returns on read error, close
/// frame, socket end, or replacement by a successor.
async fn read_loop(
    gateway: &Arc<Gateway>,
    session: &Arc<AgentSession>,
    mut stream: SplitStream<WebSocket>,
) {
    loop {
        tokio::select! {
            _ = session.closed() => return,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let env = match serde_json::from_str::<Envelope>(&text) {
                        Ok(env) => env,
                        Err(err) => {
                            warn!(
                                "bad envelope token={} err={}",
                                session.token(),
                                err
                            );
                            return;
                        }
                    };
                    dispatch(gateway, session, env);
                }
                Some(Ok(Message::Close(_))) | None => return,
                // Binary frames are not part of the protocol; ping/pong is
                // handled by the transport.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("read agent message failed token={} err={}", session.token(), err);
                    return;
                }
            },
        }
    }
}

fn dispatch(gateway: &Arc<Gateway>, session: &Arc<AgentSession>, env: Envelope) {
    match env {
        Envelope::RegisterRoutes { routes } => {
            gateway.apply_routes(session.token(), &routes);
        }
        Envelope::ProxyResponse { ref request_id, .. } => {
            if request_id.is_empty() {
                return;
            }
            let request_id = request_id.clone();
            if !session.complete_pending(&request_id, env) {
                // The waiter already timed out or went away.
                debug!(
                    "dropping response token={} request_id={}",
                    session.token(),
                    request_id
                );
            }
        }
        Envelope::Error { message } => {
            warn!("agent error token={} msg={}", session.token(), message);
        }
        other => {
            debug!("ignoring message token={} env={:?}", session.token(), other);
        }
    }
}

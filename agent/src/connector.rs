//! # Gateway Connector
//!
//! Keeps one live control channel to the gateway:
//! `Disconnected → Dialing → Connected → Disconnected`, forever, until the
//! host cancellation token fires.
//!
//! On connect the agent immediately publishes its current route set, then
//! splits the socket: an outbound task drains the envelope queue (and
//! interleaves a transport-level ping every 30 s), while this task reads
//! inbound envelopes. Each `proxy_request` is handled in its own task so a
//! slow local target cannot head-of-line-block the session.
//!
//! Dial failures and read errors restart the loop with exponential backoff
//! doubling from 1 s to a 10 s cap; the backoff resets once a connection
//! succeeds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunnel_proto::{Envelope, MAX_MESSAGE_BYTES};

use crate::executor;
use crate::state::AgentService;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Runs the connect/reconnect loop until `cancel` fires.
pub async fn run(service: Arc<AgentService>, cancel: CancellationToken) {
    let mut backoff = Backoff::new();
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match connect_once(&service, &cancel, &mut backoff).await {
            Ok(()) => return, // cancelled while connected
            Err(err) => {
                service.set_last_error(Some(format!("{err:#}"))).await;
                warn!("agent disconnected: {err:#}");
            }
        }

        let delay = backoff.next_delay();
        debug!("reconnecting in {}s", delay.as_secs());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One connection lifetime. Returns `Ok(())` only on cancellation; every
/// other exit is an error that triggers a reconnect.
async fn connect_once(
    service: &Arc<AgentService>,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> anyhow::Result<()> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_MESSAGE_BYTES);
    ws_config.max_frame_size = Some(MAX_MESSAGE_BYTES);

    let (socket, _) = connect_async_with_config(service.connect_url(), Some(ws_config), false)
        .await
        .context("connect server")?;
    backoff.reset();
    info!("agent connected to {}", service.config().server_url);

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Envelope>();

    service.set_sender(Some(tx.clone())).await;
    service.set_connected(true).await;
    service.set_last_error(None).await;

    let outbound = tokio::spawn(outbound_loop(sink, rx));

    // Restore bindings before anything else happens on this session.
    let publish = service.publish_routes().await;

    let result = match publish {
        Ok(()) => read_loop(service, &tx, &mut stream, cancel).await,
        Err(err) => Err(err).context("sync routes on connect"),
    };

    service.set_connected(false).await;
    service.set_sender(None).await;
    outbound.abort();
    result
}

// ─── Outbound Task ──────────────────────────────────────────────

/// Drains the envelope queue into the socket, serializing each message as
/// one JSON text frame, and keeps the channel alive with periodic pings.
async fn outbound_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(env) = msg else { break };
                let text = match serde_json::to_string(&env) {
                    Ok(text) => text,
                    Err(err) => {
                        error!("serialize envelope: {}", err);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ─── Inbound Loop ───────────────────────────────────────────────

async fn read_loop(
    service: &Arc<AgentService>,
    tx: &mpsc::UnboundedSender<Envelope>,
    stream: &mut SplitStream<WsStream>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Envelope>(&text) {
                        Ok(env) => dispatch(service, tx, env),
                        Err(err) => bail!("bad envelope from server: {err}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => bail!("control channel closed"),
                // Transport ping/pong; tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("read server message"),
            },
        }
    }
}

fn dispatch(service: &Arc<AgentService>, tx: &mpsc::UnboundedSender<Envelope>, env: Envelope) {
    match env {
        Envelope::ProxyRequest { .. } => {
            tokio::spawn(executor::handle(service.clone(), env, tx.clone()));
        }
        Envelope::Error { message } => {
            warn!("server error: {}", message);
        }
        other => {
            debug!("ignoring server message: {:?}", other);
        }
    }
}

// ─── Backoff ────────────────────────────────────────────────────

/// Exponential reconnect backoff: 1 s doubling to a 10 s cap, reset after
/// a successful connection.
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}

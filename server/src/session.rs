//! # Agent Session
//!
//! Per-connection state for one agent control channel:
//! - The write half of the socket behind a lock, so any task can send an
//!   envelope and contention resolves FIFO
//! - The pending-slot map from request id to the one-shot channel a public
//!   handler is waiting on
//! - A close signal the registry uses to retire a superseded session
//!
//! The read half stays with the reader task in [`crate::handlers`]; it is
//! never shared.

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::SinkExt;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify};
use tunnel_proto::Envelope;

/// Failure to put an envelope on the wire. Callers treat this as the
/// session being effectively dead.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("write websocket: {0}")]
    Send(#[from] axum::Error),
}

/// One live agent control channel, keyed by its token in the registry.
pub struct AgentSession {
    token: String,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    pending: DashMap<String, oneshot::Sender<Envelope>>,
    closed: Notify,
}

impl AgentSession {
    pub fn new(token: String, sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            token,
            sink: Mutex::new(sink),
            pending: DashMap::new(),
            closed: Notify::new(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Serializes and sends one envelope under the session write lock.
    pub async fn write(&self, env: &Envelope) -> Result<(), WriteError> {
        let text = serde_json::to_string(env)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Registers a response slot for `request_id` and returns the receiver
    /// the public handler will wait on. Must be called before the request
    /// envelope is written.
    pub fn register_pending(&self, request_id: String) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        rx
    }

    /// Delivers a response into its slot, consuming the slot. Returns false
    /// when no slot exists (the request already timed out) or the waiter is
    /// gone; either way the response is dropped.
    pub fn complete_pending(&self, request_id: &str, response: Envelope) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drops the slot for `request_id`, if it still exists.
    pub fn cancel_pending(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    /// Drops every outstanding slot. Each waiter observes the cancellation
    /// immediately. Called exactly once, by session teardown.
    pub fn fail_all_pending(&self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Asks the reader task to stop. Used when a newer connection for the
    /// same token replaces this session.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    pub(crate) async fn closed(&self) {
        self.closed.notified().await;
    }
}

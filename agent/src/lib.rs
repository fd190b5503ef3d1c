//! # Tunnel Agent
//!
//! The local side of the reverse tunnel. The agent dials out to the
//! gateway's control channel, publishes its `hostname → target` routes,
//! and replays each `proxy_request` it receives against the configured
//! local service:
//! - [`connector`] — dial, reconnect with backoff, heartbeat, dispatch
//! - [`executor`] — envelope → local HTTP call → response envelope
//! - [`store`] — the durable route config file
//! - [`sync`] — optional periodic pull from an external control plane
//! - [`admin`] — local JSON API for status and route management

pub mod admin;
pub mod connector;
pub mod executor;
pub mod state;
pub mod store;
pub mod sync;

pub use state::{AgentConfig, AgentService, RouteSyncConfig, Status};
pub use store::ConfigStore;

//! # Tunnel Wire Protocol
//!
//! The shared contract between the tunnel gateway and the tunnel agent:
//! - [`Envelope`] — the single framed message type exchanged over the
//!   control channel, serialized as one JSON object per WebSocket text frame
//! - [`Route`] — a `hostname → target` mapping published by an agent
//! - Normalization rules for hostnames, targets, and `Host` headers
//! - Message size caps enforced by both ends of the channel

pub mod envelope;
pub mod route;

pub use envelope::{
    strip_hop_headers, Envelope, Headers, HOP_HEADERS, MAX_BODY_BYTES, MAX_MESSAGE_BYTES,
};
pub use route::{normalize_host_header, normalize_hostname, normalize_target, Route, RouteError};

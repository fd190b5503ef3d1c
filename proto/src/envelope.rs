//! # Control-Channel Envelope
//!
//! Defines the message type exchanged between the gateway and agents over
//! the control channel. Every message is a single JSON text frame using
//! serde's internally-tagged representation (`"type": "..."` field), so
//! `Envelope::RegisterRoutes` serializes to `{"type": "register_routes", ...}`.
//!
//! The decoder is deliberately permissive: unknown fields are ignored,
//! missing fields fall back to their defaults, and a message with an
//! unrecognized `type` decodes to [`Envelope::Unknown`] instead of failing,
//! so newer peers can add message types without breaking older ones.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::route::Route;

/// Maximum request/response body size carried through the tunnel.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Maximum inbound control-channel message size: a full body plus
/// headroom for base64 expansion and envelope fields.
pub const MAX_MESSAGE_BYTES: usize = MAX_BODY_BYTES + 2 * 1024 * 1024;

/// HTTP header multi-map as carried on the wire. Names are lowercase.
pub type Headers = HashMap<String, Vec<String>>;

/// All messages in the tunnel protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Agent → gateway. Replaces the full set of routes bound to the
    /// session's token with the carried set.
    RegisterRoutes {
        #[serde(default)]
        routes: Vec<Route>,
    },

    /// Gateway → agent. One public HTTP request to replay against the
    /// agent's local target. The body is base64-encoded.
    ProxyRequest {
        #[serde(default)]
        request_id: String,
        #[serde(default)]
        method: String,
        #[serde(default)]
        path: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        query: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: Headers,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        body: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        hostname: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        target: String,
    },

    /// Agent → gateway. The local target's reply for a specific
    /// `request_id`. The body is base64-encoded.
    ProxyResponse {
        #[serde(default)]
        request_id: String,
        #[serde(default)]
        status: u16,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: Headers,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        body: String,
    },

    /// Either direction. Informational only; carries no state change.
    Error {
        #[serde(default)]
        message: String,
    },

    /// Catch-all for message types this build does not know about.
    /// Receivers log and ignore these.
    #[serde(other)]
    Unknown,
}

/// Hop-by-hop headers, stripped from every message crossing the tunnel.
pub const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes all hop-by-hop headers from a header map, case-insensitively.
pub fn strip_hop_headers(headers: &mut Headers) {
    headers.retain(|name, _| !HOP_HEADERS.iter().any(|hop| name.eq_ignore_ascii_case(hop)));
}

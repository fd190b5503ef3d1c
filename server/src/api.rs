//! # Operational Endpoints
//!
//! Small plaintext endpoints on the control listener, for load balancers
//! and humans poking at a running gateway.

use std::sync::Arc;

use axum::extract::State;

use crate::state::Gateway;

/// `GET /healthz` — liveness probe.
pub async fn healthz() -> &'static str {
    "ok"
}

/// `GET /debug/state` — `agents=N routes=M` snapshot.
pub async fn debug_state(State(gateway): State<Arc<Gateway>>) -> String {
    gateway.debug_state()
}

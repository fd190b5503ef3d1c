//! # Gateway State
//!
//! Holds the shared state for the gateway process:
//! - **Session registry**: token → live [`AgentSession`], at most one per token
//! - **Routing table**: hostname → [`RouteBinding`]
//! - The request-id sequence and the per-request response timeout
//!
//! Both tables sit behind their own `std::sync::RwLock`; the table locks
//! guard pure in-memory updates only, never I/O. Route replacement for a
//! token holds the table lock exclusively across the remove-then-insert
//! sequence, so observers see the old set or the new set, nothing in
//! between.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::info;
use tunnel_proto::{normalize_host_header, normalize_hostname, normalize_target, Route};

use crate::session::AgentSession;

/// A routing-table entry: which token serves a hostname, and the local
/// target the agent should replay against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub token: String,
    pub target: String,
}

/// The gateway's shared state. One per process; tests build their own.
pub struct Gateway {
    agents: RwLock<HashMap<String, Arc<AgentSession>>>,
    routes: RwLock<HashMap<String, RouteBinding>>,
    request_seq: AtomicU64,
    request_timeout: Duration,
}

impl Gateway {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            request_seq: AtomicU64::new(0),
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Swaps `session` into the registry under its token and returns the
    /// predecessor, if any. The caller closes the predecessor AFTER the
    /// swap, so the registry never has a gap for the token.
    pub fn register_session(&self, session: Arc<AgentSession>) -> Option<Arc<AgentSession>> {
        let mut agents = self.agents.write().unwrap();
        agents.insert(session.token().to_string(), session)
    }

    /// Removes `session` from the registry and purges its bindings, but
    /// only if the registry still points at this exact session. A session
    /// replaced by a successor leaves the successor and its routes alone.
    pub fn remove_session_if_current(&self, session: &Arc<AgentSession>) -> bool {
        let removed = {
            let mut agents = self.agents.write().unwrap();
            match agents.get(session.token()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    agents.remove(session.token());
                    true
                }
                _ => false,
            }
        };

        if removed {
            let mut routes = self.routes.write().unwrap();
            routes.retain(|_, binding| binding.token != session.token());
        }
        removed
    }

    pub fn session(&self, token: &str) -> Option<Arc<AgentSession>> {
        self.agents.read().unwrap().get(token).cloned()
    }

    /// Replaces the binding set owned by `token` with `routes`, atomically
    /// with respect to lookups. Malformed entries are skipped. If two
    /// tokens publish the same hostname, the later publication wins.
    pub fn apply_routes(&self, token: &str, routes: &[Route]) {
        let mut table = self.routes.write().unwrap();
        table.retain(|_, binding| binding.token != token);

        for route in routes {
            let Ok(hostname) = normalize_hostname(&route.hostname) else {
                continue;
            };
            let Ok(target) = normalize_target(&route.target) else {
                continue;
            };
            table.insert(
                hostname,
                RouteBinding {
                    token: token.to_string(),
                    target,
                },
            );
        }
        drop(table);

        info!("routes updated token={} count={}", token, routes.len());
    }

    /// Looks up the binding for a raw `Host` header value.
    pub fn lookup_route(&self, host: &str) -> Option<RouteBinding> {
        let host = normalize_host_header(host);
        self.routes.read().unwrap().get(&host).cloned()
    }

    /// Allocates the next request id: a process-wide counter serialized as
    /// decimal. Restarts from 1 with the process.
    pub fn next_request_id(&self) -> String {
        (self.request_seq.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub fn debug_state(&self) -> String {
        let agents = self.agents.read().unwrap().len();
        let routes = self.routes.read().unwrap().len();
        format!("agents={agents} routes={routes}")
    }
}

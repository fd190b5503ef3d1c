//! # Route Sync
//!
//! Managed-mode polling: every interval, pull the route set from the
//! external control plane, and on change persist it and re-publish to the
//! gateway. Any failure (transport, non-200, bad payload) is logged and
//! skipped without touching local state, so the agent keeps serving its
//! last good set.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_proto::Route;

use crate::state::{AgentService, RouteSyncConfig};

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(12);

/// Pull payload from `GET {url}?tunnel_id=…&token=…`.
#[derive(Debug, Deserialize)]
struct SyncedRoutes {
    #[serde(default)]
    routes: Vec<Route>,
}

/// Runs the poll loop until `cancel` fires. No-op when the agent is not
/// in managed mode. The first pull happens immediately.
pub async fn run(service: Arc<AgentService>, cancel: CancellationToken) {
    let Some(cfg) = service.config().route_sync.clone() else {
        return;
    };
    info!(
        "route sync enabled tunnel_id={} source={} interval={}s",
        cfg.tunnel_id,
        cfg.url,
        cfg.interval.as_secs()
    );

    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        sync_once(&service, &cfg).await;
    }
}

async fn sync_once(service: &AgentService, cfg: &RouteSyncConfig) {
    let response = service
        .http_client()
        .get(&cfg.url)
        .query(&[
            ("tunnel_id", cfg.tunnel_id.as_str()),
            ("token", cfg.tunnel_token.as_str()),
        ])
        .timeout(ATTEMPT_TIMEOUT)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            warn!("route sync request failed: {}", err);
            return;
        }
    };

    if response.status() != reqwest::StatusCode::OK {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(
            "route sync failed status={} body={}",
            status,
            truncated(body.trim(), 512)
        );
        return;
    }

    let payload = match response.json::<SyncedRoutes>().await {
        Ok(payload) => payload,
        Err(err) => {
            warn!("route sync decode failed: {}", err);
            return;
        }
    };

    let changed = match service.store().replace_all(&payload.routes) {
        Ok(changed) => changed,
        Err(err) => {
            warn!("route sync apply failed: {}", err);
            return;
        }
    };
    if !changed {
        return;
    }

    info!("route sync applied {} routes", payload.routes.len());
    if let Err(err) = service.publish_routes().await {
        debug!("route sync publish deferred: {}", err);
    }
}

fn truncated(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

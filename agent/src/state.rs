//! # Agent Service State
//!
//! [`AgentService`] is the one shared object behind the connector, the
//! proxy executor, the route-sync loop, and the admin API. It owns the
//! validated configuration, the route store, the shared HTTP client, the
//! connection status, and the outbound envelope channel for the currently
//! live control channel (if any).

use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tunnel_proto::Envelope;
use url::Url;

use crate::store::ConfigStore;

/// Client-level timeout for calls against local targets.
pub const LOCAL_CALL_TIMEOUT: Duration = Duration::from_secs(45);

/// Managed-mode settings: where to pull routes from, and how often.
#[derive(Debug, Clone)]
pub struct RouteSyncConfig {
    pub url: String,
    pub tunnel_id: String,
    pub tunnel_token: String,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub token: String,
    pub admin_addr: String,
    pub route_sync: Option<RouteSyncConfig>,
}

/// Connection status report, served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub server_url: String,
    pub admin_addr: String,
    pub token_hint: String,
    pub managed_by_control: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_sync_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_sync_interval: Option<String>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("tunnel is offline")]
    Offline,
}

pub struct AgentService {
    config: AgentConfig,
    connect_url: String,
    store: ConfigStore,
    http_client: reqwest::Client,

    ws_tx: RwLock<Option<mpsc::UnboundedSender<Envelope>>>,
    connected: RwLock<bool>,
    last_error: RwLock<Option<String>>,
}

impl AgentService {
    pub fn new(config: AgentConfig, store: ConfigStore) -> anyhow::Result<Self> {
        let mut connect_url = Url::parse(&config.server_url).context("invalid server url")?;
        if connect_url.scheme() != "ws" && connect_url.scheme() != "wss" {
            bail!("server url must start with ws:// or wss://");
        }
        connect_url
            .query_pairs_mut()
            .append_pair("token", &config.token);

        if let Some(sync) = &config.route_sync {
            let sync_url = Url::parse(&sync.url).context("invalid route sync url")?;
            if sync_url.scheme() != "http" && sync_url.scheme() != "https" {
                bail!("route sync url must start with http:// or https://");
            }
        }

        let http_client = reqwest::Client::builder()
            .timeout(LOCAL_CALL_TIMEOUT)
            .build()
            .context("build http client")?;

        Ok(Self {
            config,
            connect_url: connect_url.into(),
            store,
            http_client,
            ws_tx: RwLock::new(None),
            connected: RwLock::new(false),
            last_error: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// The configured server URL with the `token` query parameter attached.
    pub fn connect_url(&self) -> &str {
        &self.connect_url
    }

    pub fn managed(&self) -> bool {
        self.config.route_sync.is_some()
    }

    pub async fn set_sender(&self, tx: Option<mpsc::UnboundedSender<Envelope>>) {
        *self.ws_tx.write().await = tx;
    }

    pub async fn set_connected(&self, connected: bool) {
        *self.connected.write().await = connected;
    }

    pub async fn set_last_error(&self, err: Option<String>) {
        *self.last_error.write().await = err;
    }

    /// Queues the current route set for the gateway as a `register_routes`
    /// envelope. Fails only when no control channel is live.
    pub async fn publish_routes(&self) -> Result<(), PublishError> {
        let guard = self.ws_tx.read().await;
        let tx = guard.as_ref().ok_or(PublishError::Offline)?;
        tx.send(Envelope::RegisterRoutes {
            routes: self.store.list(),
        })
        .map_err(|_| PublishError::Offline)
    }

    pub async fn status(&self) -> Status {
        let sync = self.config.route_sync.as_ref();
        Status {
            connected: *self.connected.read().await,
            last_error: self.last_error.read().await.clone(),
            server_url: self.config.server_url.clone(),
            admin_addr: self.config.admin_addr.clone(),
            token_hint: token_hint(&self.config.token),
            managed_by_control: sync.is_some(),
            route_sync_url: sync.map(|s| s.url.clone()),
            tunnel_id: sync.map(|s| s.tunnel_id.clone()),
            route_sync_interval: sync.map(|s| format!("{}s", s.interval.as_secs())),
        }
    }
}

/// A token fragment safe to show in status output.
fn token_hint(token: &str) -> String {
    if token.len() <= 8 {
        return token.to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

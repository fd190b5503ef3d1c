//! # Route Config Store
//!
//! The agent's durable `hostname → target` map. Backed by a JSON file
//! (`{"routes": [...]}`) replaced atomically via write-to-temp + rename.
//! Entries are normalized on every path in; entries that fail validation
//! while loading are dropped silently.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;
use tunnel_proto::{normalize_hostname, normalize_target, Route, RouteError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Route(#[from] RouteError),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileConfig {
    #[serde(default)]
    routes: Vec<Route>,
}

/// Durable route map. Single writer (this process); reads are cheap
/// snapshots. The map is keyed and ordered by hostname so the persisted
/// file and every listing come out sorted.
pub struct ConfigStore {
    path: PathBuf,
    routes: RwLock<BTreeMap<String, Route>>,
}

impl ConfigStore {
    /// Loads the store from `path`. A missing file is an empty store;
    /// malformed JSON is an error; individually invalid routes are skipped.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut routes = BTreeMap::new();
        if path.exists() {
            let data = fs::read(&path)?;
            let cfg: FileConfig = serde_json::from_slice(&data)?;
            for route in cfg.routes {
                let Ok(hostname) = normalize_hostname(&route.hostname) else {
                    continue;
                };
                let Ok(target) = normalize_target(&route.target) else {
                    continue;
                };
                routes.insert(hostname.clone(), Route { hostname, target });
            }
        }
        Ok(Self {
            path,
            routes: RwLock::new(routes),
        })
    }

    /// Current routes, sorted by hostname.
    pub fn list(&self) -> Vec<Route> {
        self.routes.read().unwrap().values().cloned().collect()
    }

    pub fn upsert(&self, hostname: &str, target: &str) -> Result<(), StoreError> {
        let hostname = normalize_hostname(hostname)?;
        let target = normalize_target(target)?;

        let mut routes = self.routes.write().unwrap();
        routes.insert(hostname.clone(), Route { hostname, target });
        self.save(&routes)
    }

    pub fn delete(&self, hostname: &str) -> Result<(), StoreError> {
        let hostname = normalize_hostname(hostname)?;

        let mut routes = self.routes.write().unwrap();
        routes.remove(&hostname);
        self.save(&routes)
    }

    /// Replaces the whole set. Returns `Ok(false)` when the incoming set is
    /// identical to the current one, in which case nothing is written.
    pub fn replace_all(&self, incoming: &[Route]) -> Result<bool, StoreError> {
        let mut next = BTreeMap::new();
        for route in incoming {
            let hostname = normalize_hostname(&route.hostname)?;
            let target = normalize_target(&route.target)?;
            next.insert(hostname.clone(), Route { hostname, target });
        }

        let mut routes = self.routes.write().unwrap();
        if *routes == next {
            return Ok(false);
        }
        *routes = next;
        self.save(&routes)?;
        Ok(true)
    }

    fn save(&self, routes: &BTreeMap<String, Route>) -> Result<(), StoreError> {
        let cfg = FileConfig {
            routes: routes.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&cfg)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

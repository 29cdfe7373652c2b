use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::write_atomic;
use crate::error::ConfigError;

const STORE_FILE: &str = "relays.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredRelay {
    pub url: String,
    pub last_seen: i64,
}

#[derive(Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    discovered: Vec<DiscoveredRelay>,
}

/// Relays that passed verification, persisted in `relays.json`.
pub struct DiscoveredRelayStore {
    path: PathBuf,
    relays: RwLock<BTreeMap<String, DiscoveredRelay>>,
}

impl DiscoveredRelayStore {
    /// Load from `dir`. A missing or unreadable file yields an empty store.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(STORE_FILE);
        let relays = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoreDocument>(&raw) {
                Ok(doc) => doc
                    .discovered
                    .into_iter()
                    .map(|r| (r.url.clone(), r))
                    .collect(),
                Err(err) => {
                    tracing::warn!(path = %path.display(), "ignoring corrupt relay store: {err}");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        tracing::debug!(count = relays.len(), "loaded discovered relays");
        Self {
            path,
            relays: RwLock::new(relays),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, url: &str) -> bool {
        self.relays.read().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.relays.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn urls(&self) -> Vec<String> {
        self.relays.read().keys().cloned().collect()
    }

    /// Record `url` as verified now.
    pub fn add(&self, url: &str) {
        self.relays.write().insert(
            url.to_string(),
            DiscoveredRelay {
                url: url.to_string(),
                last_seen: chrono::Utc::now().timestamp(),
            },
        );
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let doc = StoreDocument {
            discovered: self.relays.read().values().cloned().collect(),
        };
        let json = serde_json::to_vec(&doc)?;
        write_atomic(&self.path, &json)
    }
}

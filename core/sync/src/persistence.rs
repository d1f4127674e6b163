//! Durable storage of engine state, manifest and configuration.
//!
//! Each of the three blobs lives under its own stable key, wrapped in a
//! versioned JSON envelope. Anything missing, unreadable or written by an
//! unknown format version falls back to defaults instead of failing startup.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use fieldsync_common::Result;
use fieldsync_storage::KeyValueStore;

use crate::config::SyncConfig;
use crate::manifest::EntityManifest;
use crate::state::SyncEngineState;

pub const ENGINE_STATE_KEY: &str = "sync.engine_state";
pub const MANIFEST_KEY: &str = "sync.manifest";
pub const CONFIG_KEY: &str = "sync.config";

const ENGINE_STATE_FORMAT: u32 = 1;
const MANIFEST_FORMAT: u32 = 1;
const CONFIG_FORMAT: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

/// Everything the engine restores at startup.
#[derive(Debug, Clone, Default)]
pub struct LoadedState {
    pub state: SyncEngineState,
    pub manifest: EntityManifest,
    pub config: SyncConfig,
}

/// Typed access to the engine's three blobs.
#[derive(Clone)]
pub struct EngineStore {
    store: Arc<dyn KeyValueStore>,
}

impl EngineStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load all blobs, substituting defaults for anything unusable.
    ///
    /// A persisted in-progress flag can only come from a pass that never
    /// finished, so it is cleared here.
    pub async fn load(&self) -> LoadedState {
        debug!("Loading sync state from {} store", self.store.name());
        let mut state: SyncEngineState = self
            .load_blob(ENGINE_STATE_KEY, ENGINE_STATE_FORMAT)
            .await
            .unwrap_or_default();
        if state.sync_in_progress {
            warn!("Clearing stale sync lock left by an interrupted pass");
            state.sync_in_progress = false;
        }

        let manifest = self
            .load_blob(MANIFEST_KEY, MANIFEST_FORMAT)
            .await
            .unwrap_or_default();

        let config = match self.load_blob::<SyncConfig>(CONFIG_KEY, CONFIG_FORMAT).await {
            Some(config) => match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    warn!("Persisted sync config rejected ({}), using defaults", e);
                    SyncConfig::default()
                }
            },
            None => SyncConfig::default(),
        };

        LoadedState {
            state,
            manifest,
            config,
        }
    }

    pub async fn save_state(&self, state: &SyncEngineState) -> Result<()> {
        self.save_blob(ENGINE_STATE_KEY, ENGINE_STATE_FORMAT, state).await
    }

    pub async fn save_manifest(&self, manifest: &EntityManifest) -> Result<()> {
        self.save_blob(MANIFEST_KEY, MANIFEST_FORMAT, manifest).await
    }

    pub async fn save_config(&self, config: &SyncConfig) -> Result<()> {
        self.save_blob(CONFIG_KEY, CONFIG_FORMAT, config).await
    }

    async fn save_blob<T: Serialize>(&self, key: &str, version: u32, data: &T) -> Result<()> {
        let json = serde_json::to_string(&Envelope { version, data })?;
        self.store.set(key, json).await
    }

    async fn load_blob<T: DeserializeOwned>(&self, key: &str, expected: u32) -> Option<T> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("No persisted blob under {}, using defaults", key);
                return None;
            }
            Err(e) => {
                warn!("Failed to read {}: {}, using defaults", key, e);
                return None;
            }
        };

        match serde_json::from_str::<Envelope<T>>(&raw) {
            Ok(envelope) if envelope.version == expected => Some(envelope.data),
            Ok(envelope) => {
                warn!(
                    "Blob {} has unsupported format version {}, using defaults",
                    key, envelope.version
                );
                None
            }
            Err(e) => {
                warn!("Corrupt blob under {}: {}, using defaults", key, e);
                None
            }
        }
    }
}

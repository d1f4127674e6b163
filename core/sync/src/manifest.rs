//! Entity version manifest.
//!
//! Tracks, per entity, which version this device believes the entity is at.
//! Versions follow a two-phase pattern: `version` is bumped provisionally on
//! every local enqueue, and `confirmed_version` follows only once the remote
//! authority has acknowledged a version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fieldsync_common::{EntityId, EntityType};

/// Which side produced the latest known version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifiedBy {
    Local,
    Remote,
}

/// Version record for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub entity_type: EntityType,
    /// Latest version known locally, possibly provisional.
    pub version: u64,
    /// Latest version acknowledged by the remote authority.
    pub confirmed_version: Option<u64>,
    pub last_modified: DateTime<Utc>,
    pub modified_by: ModifiedBy,
}

impl ManifestEntry {
    /// Whether `version` still awaits remote confirmation.
    pub fn is_provisional(&self) -> bool {
        self.confirmed_version != Some(self.version)
    }
}

/// Mapping from entity to its version record.
///
/// Only entities this device has touched (locally or via pulled changes) have
/// entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityManifest {
    entries: BTreeMap<EntityId, ManifestEntry>,
}

impl EntityManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<&ManifestEntry> {
        self.entries.get(entity_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&EntityId, &ManifestEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Version the next local mutation of `entity_id` receives.
    pub fn next_version(&self, entity_id: &EntityId) -> u64 {
        self.entries.get(entity_id).map_or(1, |e| e.version + 1)
    }

    /// Last remote-acknowledged version of an entity.
    pub fn confirmed_version(&self, entity_id: &EntityId) -> Option<u64> {
        self.entries.get(entity_id).and_then(|e| e.confirmed_version)
    }

    /// Record a provisional local version.
    pub fn record_local(&mut self, entity_type: EntityType, entity_id: &EntityId, version: u64) {
        let now = Utc::now();
        self.entries
            .entry(entity_id.clone())
            .and_modify(|e| {
                e.version = e.version.max(version);
                e.last_modified = now;
                e.modified_by = ModifiedBy::Local;
            })
            .or_insert(ManifestEntry {
                entity_type,
                version,
                confirmed_version: None,
                last_modified: now,
                modified_by: ModifiedBy::Local,
            });
    }

    /// Record a version acknowledged by the remote authority.
    ///
    /// The local counter never moves backwards, so versions assigned to
    /// operations that are still queued stay unique.
    pub fn confirm(
        &mut self,
        entity_type: EntityType,
        entity_id: &EntityId,
        server_version: u64,
        modified_by: ModifiedBy,
    ) {
        let now = Utc::now();
        let entry = self
            .entries
            .entry(entity_id.clone())
            .or_insert(ManifestEntry {
                entity_type,
                version: server_version,
                confirmed_version: None,
                last_modified: now,
                modified_by,
            });
        entry.version = entry.version.max(server_version);
        entry.confirmed_version = Some(server_version);
        entry.last_modified = now;
        entry.modified_by = modified_by;
    }
}

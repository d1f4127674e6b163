//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use fieldsync_common::{EntityId, EntityType, Error, Result};

use crate::operation::PendingOperation;
use crate::transport::RemoteSnapshot;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Local payload always wins.
    LocalWins,
    /// Remote payload always wins.
    RemoteWins,
    /// Later timestamp wins; ties go to local.
    NewestWins,
    /// Leave the conflict for a person to resolve.
    Manual,
}

impl ConflictStrategy {
    /// Strategy implementation for this variant.
    pub fn strategy(&self) -> &'static dyn ResolutionStrategy {
        match self {
            ConflictStrategy::LocalWins => &LocalWins,
            ConflictStrategy::RemoteWins => &RemoteWins,
            ConflictStrategy::NewestWins => &NewestWins,
            ConflictStrategy::Manual => &ManualReview,
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local-wins" => Ok(ConflictStrategy::LocalWins),
            "remote-wins" => Ok(ConflictStrategy::RemoteWins),
            "newest-wins" => Ok(ConflictStrategy::NewestWins),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict strategy: {}",
                other
            ))),
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merged,
    /// Settled by an explicit user decision.
    Manual,
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedData {
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

/// A detected divergence between local and remote state for one entity.
///
/// Once `resolved` is set the record is immutable; it is retained for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub detected_at: DateTime<Utc>,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Queued operation that ran into the conflict.
    pub operation_id: String,
    pub local: VersionedData,
    pub remote: VersionedData,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_data: Option<Value>,
}

impl SyncConflict {
    /// Materialize a conflict between a queued operation and the remote state.
    pub fn new(op: &PendingOperation, remote: &RemoteSnapshot) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            detected_at: Utc::now(),
            entity_type: op.entity_type,
            entity_id: op.entity_id.clone(),
            operation_id: op.id.clone(),
            local: VersionedData {
                data: op.payload.clone(),
                timestamp: op.timestamp,
                version: op.local_version,
            },
            remote: VersionedData {
                data: remote.data.clone(),
                timestamp: remote.timestamp,
                version: remote.version,
            },
            resolved: false,
            resolution: None,
            resolved_at: None,
            resolved_data: None,
        }
    }

    /// Whether the conflict still awaits a decision.
    pub fn is_active(&self) -> bool {
        !self.resolved
    }

    /// Settle the conflict.
    ///
    /// # Errors
    /// - `NotPermitted` if the conflict is already resolved
    pub fn resolve(&mut self, resolution: Resolution, data: Value) -> Result<()> {
        if self.resolved {
            return Err(Error::NotPermitted(format!(
                "Conflict {} is already resolved",
                self.id
            )));
        }
        self.resolved = true;
        self.resolution = Some(resolution);
        self.resolved_at = Some(Utc::now());
        self.resolved_data = Some(data);
        Ok(())
    }

    /// Replace the local/remote sides with a newer detection for the same
    /// entity, keeping this record's identity.
    ///
    /// # Errors
    /// - `NotPermitted` if the conflict is already resolved
    /// - `InvalidInput` if `newer` concerns a different entity
    pub fn supersede(&mut self, newer: SyncConflict) -> Result<()> {
        if self.resolved {
            return Err(Error::NotPermitted(format!(
                "Conflict {} is already resolved",
                self.id
            )));
        }
        if newer.entity_id != self.entity_id {
            return Err(Error::InvalidInput(format!(
                "Cannot supersede conflict for {} with one for {}",
                self.entity_id, newer.entity_id
            )));
        }
        self.detected_at = newer.detected_at;
        self.operation_id = newer.operation_id;
        self.local = newer.local;
        self.remote = newer.remote;
        Ok(())
    }
}

/// Outcome proposed by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    pub resolution: Resolution,
    pub data: Value,
}

impl ResolvedValue {
    fn local(conflict: &SyncConflict) -> Self {
        Self {
            resolution: Resolution::LocalWins,
            data: conflict.local.data.clone(),
        }
    }

    fn remote(conflict: &SyncConflict) -> Self {
        Self {
            resolution: Resolution::RemoteWins,
            data: conflict.remote.data.clone(),
        }
    }
}

/// A deterministic conflict resolution policy.
///
/// Returning `None` defers the decision to a person.
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, conflict: &SyncConflict) -> Option<ResolvedValue>;
}

pub struct LocalWins;

impl ResolutionStrategy for LocalWins {
    fn name(&self) -> &'static str {
        "local-wins"
    }

    fn resolve(&self, conflict: &SyncConflict) -> Option<ResolvedValue> {
        Some(ResolvedValue::local(conflict))
    }
}

pub struct RemoteWins;

impl ResolutionStrategy for RemoteWins {
    fn name(&self) -> &'static str {
        "remote-wins"
    }

    fn resolve(&self, conflict: &SyncConflict) -> Option<ResolvedValue> {
        Some(ResolvedValue::remote(conflict))
    }
}

/// Later timestamp wins. Equal timestamps favor the local side.
pub struct NewestWins;

impl ResolutionStrategy for NewestWins {
    fn name(&self) -> &'static str {
        "newest-wins"
    }

    fn resolve(&self, conflict: &SyncConflict) -> Option<ResolvedValue> {
        if conflict.remote.timestamp > conflict.local.timestamp {
            Some(ResolvedValue::remote(conflict))
        } else {
            Some(ResolvedValue::local(conflict))
        }
    }
}

/// Never auto-resolves.
pub struct ManualReview;

impl ResolutionStrategy for ManualReview {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn resolve(&self, _conflict: &SyncConflict) -> Option<ResolvedValue> {
        None
    }
}

/// Conflict detector and resolver.
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    /// Create a new conflict resolver for the given strategy.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    /// Whether a mutation based on `base_version` collides with the remote
    /// entity at `remote_version`.
    ///
    /// `None` for either side means the entity is unknown on that side.
    pub fn detect_conflict(base_version: Option<u64>, remote_version: Option<u64>) -> bool {
        match (base_version, remote_version) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(base), Some(remote)) => base != remote,
        }
    }

    /// Get the configured strategy.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Apply the configured strategy to a conflict.
    pub fn resolve(&self, conflict: &SyncConflict) -> Option<ResolvedValue> {
        self.strategy.strategy().resolve(conflict)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::NewestWins)
    }
}

//! Engine state and sync pass results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use fieldsync_common::{EntityId, Result};

use crate::conflict::SyncConflict;
use crate::operation::PendingOperation;
use crate::retry::RetryPolicy;

/// Process-wide sync state owned by one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncEngineState {
    pub online: bool,
    pub last_online_time: Option<DateTime<Utc>>,
    /// Single-flight guard for sync passes.
    pub sync_in_progress: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Remote timestamp up to which pulled changes have been settled.
    pub pull_cursor: Option<DateTime<Utc>>,
    /// Passes in a row that ended with at least one error.
    pub consecutive_failures: u32,
    /// Queue in enqueue order.
    pub pending_operations: Vec<PendingOperation>,
    /// Active and resolved conflicts, oldest first.
    pub conflicts: Vec<SyncConflict>,
}

impl Default for SyncEngineState {
    fn default() -> Self {
        Self {
            online: true,
            last_online_time: None,
            sync_in_progress: false,
            last_sync_time: None,
            pull_cursor: None,
            consecutive_failures: 0,
            pending_operations: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

impl SyncEngineState {
    /// Create a new empty state.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_operations.len()
    }

    pub fn operation(&self, id: &str) -> Option<&PendingOperation> {
        self.pending_operations.iter().find(|op| op.id == id)
    }

    pub fn operation_mut(&mut self, id: &str) -> Option<&mut PendingOperation> {
        self.pending_operations.iter_mut().find(|op| op.id == id)
    }

    pub fn contains_operation(&self, id: &str) -> bool {
        self.operation(id).is_some()
    }

    /// Remove an operation from the queue.
    pub fn remove_operation(&mut self, id: &str) -> Option<PendingOperation> {
        let index = self.pending_operations.iter().position(|op| op.id == id)?;
        Some(self.pending_operations.remove(index))
    }

    /// Whether any queued operation targets the entity.
    pub fn has_pending_for(&self, entity_id: &EntityId) -> bool {
        self.pending_operations
            .iter()
            .any(|op| &op.entity_id == entity_id)
    }

    /// Whether any queued operation lists `id` as a dependency.
    pub fn has_dependents(&self, id: &str) -> bool {
        self.pending_operations
            .iter()
            .any(|op| op.depends_on.contains(id))
    }

    /// Point every queued operation for the entity at a new remote version.
    pub fn rebase_entity(&mut self, entity_id: &EntityId, server_version: u64) {
        for op in self
            .pending_operations
            .iter_mut()
            .filter(|op| &op.entity_id == entity_id)
        {
            op.server_version = Some(server_version);
        }
    }

    /// Operations that have used up their retries.
    pub fn stalled_operations(&self, policy: &RetryPolicy) -> Vec<&PendingOperation> {
        self.pending_operations
            .iter()
            .filter(|op| policy.is_exhausted(op.attempts))
            .collect()
    }

    /// Unresolved conflicts.
    pub fn active_conflicts(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.iter().filter(|c| c.is_active())
    }

    pub fn active_conflict_for(&self, entity_id: &EntityId) -> Option<&SyncConflict> {
        self.active_conflicts().find(|c| &c.entity_id == entity_id)
    }

    pub fn conflict_mut(&mut self, id: &str) -> Option<&mut SyncConflict> {
        self.conflicts.iter_mut().find(|c| c.id == id)
    }

    /// Store a conflict, superseding any unresolved one for the same entity.
    ///
    /// Returns the ID of the stored record.
    pub fn record_conflict(&mut self, conflict: SyncConflict) -> Result<String> {
        if let Some(existing) = self
            .conflicts
            .iter_mut()
            .find(|c| c.is_active() && c.entity_id == conflict.entity_id)
        {
            existing.supersede(conflict)?;
            return Ok(existing.id.clone());
        }
        let id = conflict.id.clone();
        self.conflicts.push(conflict);
        Ok(id)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Failure of one operation, or of the pass as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    /// `None` for pass-level errors (skips, pull failures, persistence).
    pub operation_id: Option<String>,
    pub message: String,
    /// Whether a later pass may still succeed: the operation is not exhausted,
    /// i.e. `attempts <= max_retries` after the increment. This is one more
    /// than a strict `attempts < max_retries` reading and matches the retry
    /// selection rule, so a recoverable operation is always selected again.
    pub recoverable: bool,
}

impl OperationError {
    pub fn for_operation(id: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            operation_id: Some(id.into()),
            message: message.into(),
            recoverable,
        }
    }

    pub fn pass(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            operation_id: None,
            message: message.into(),
            recoverable,
        }
    }
}

/// Summary of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// `false` when the pass was skipped or hit any error.
    pub success: bool,
    /// Set when the pass was skipped without doing any work.
    pub skipped: Option<String>,
    pub operations_attempted: usize,
    pub operations_completed: usize,
    pub operations_failed: usize,
    /// Operations left for a later pass because a predecessor did not finish.
    pub operations_deferred: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub changes_pulled: usize,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub errors: Vec<OperationError>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl SyncResult {
    /// Result for a pass that was refused before touching any state.
    pub fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            skipped: Some(reason.clone()),
            errors: vec![OperationError::pass(reason, true)],
            ..Default::default()
        }
    }

    pub fn was_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

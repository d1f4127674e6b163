//! Queued local mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use fieldsync_common::{EntityId, EntityType, Error, OperationKind, Result};

/// A queued, not-yet-confirmed local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique ID, derived from kind, entity and creation time.
    pub id: String,
    /// When the mutation was requested.
    pub timestamp: DateTime<Utc>,
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Opaque domain payload.
    pub payload: Value,
    /// Provisional version assigned at enqueue time.
    pub local_version: u64,
    /// Remote version this mutation is based on, once known.
    pub server_version: Option<u64>,
    /// Failed attempts so far.
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Operations that must complete before this one may run.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

impl PendingOperation {
    /// Create a fresh operation with zero attempts.
    pub fn new(
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: EntityId,
        payload: Value,
        local_version: u64,
        depends_on: BTreeSet<String>,
    ) -> Self {
        let timestamp = Utc::now();
        Self {
            id: Self::derive_id(kind, &entity_id, timestamp),
            timestamp,
            kind,
            entity_type,
            entity_id,
            payload,
            local_version,
            server_version: None,
            attempts: 0,
            last_attempt: None,
            last_error: None,
            depends_on,
        }
    }

    /// Build an ID such as `update-log1-1718000000000-3f2a9c1d`.
    ///
    /// The random suffix keeps IDs unique when two mutations of the same
    /// entity land in the same millisecond.
    fn derive_id(kind: OperationKind, entity_id: &EntityId, timestamp: DateTime<Utc>) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}-{}",
            kind,
            entity_id,
            timestamp.timestamp_millis(),
            &suffix[..8]
        )
    }

    /// Record a failed attempt.
    pub fn mark_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt = Some(at);
        self.last_error = Some(error.into());
    }

    /// Forget previous failures so the operation is immediately eligible.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
        self.last_error = None;
    }

    /// Re-point the mutation at a newer remote version.
    ///
    /// Attempts are kept, so an operation whose remote keeps moving still
    /// runs out of retries.
    pub fn rebase(&mut self, server_version: u64, payload: Value) {
        self.server_version = Some(server_version);
        self.payload = payload;
    }

    /// Approximate wire size of the payload.
    pub fn payload_size(&self) -> u64 {
        serde_json::to_vec(&self.payload)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }
}

/// Reject payloads the remote authority could never accept.
///
/// Create and update carry a JSON object; delete carries an object or null.
pub fn validate_payload(kind: OperationKind, payload: &Value) -> Result<()> {
    match (kind, payload) {
        (_, Value::Object(_)) => Ok(()),
        (OperationKind::Delete, Value::Null) => Ok(()),
        (kind, other) => Err(Error::InvalidInput(format!(
            "{} payload must be a JSON object, got {}",
            kind,
            json_type_name(other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

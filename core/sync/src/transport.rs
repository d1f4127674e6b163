//! Transport contract towards the remote authority.
//!
//! The engine only ever talks to the remote side through [`SyncTransport`].
//! Real implementations (HTTP, WebSocket, ...) live outside this crate and are
//! responsible for their own per-request timeouts. [`MemoryTransport`] is an
//! in-process authority used by tests and demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use fieldsync_common::{EntityId, EntityType, Error, OperationKind, Result};

use crate::conflict::ConflictResolver;
use crate::operation::PendingOperation;

/// Remote state of an entity, as reported alongside a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub data: Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Result of sending one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The remote applied the mutation and assigned this version.
    Accepted { server_version: u64 },
    /// The remote holds a different version than the mutation was based on.
    Conflict(RemoteSnapshot),
}

/// A remote-originated change reported by `pull`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub kind: OperationKind,
    pub data: Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl RemoteChange {
    /// Approximate wire size of the change payload.
    pub fn payload_size(&self) -> u64 {
        serde_json::to_vec(&self.data)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }
}

/// Channel to the remote authority.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Get the transport name (e.g., "memory", "https").
    fn name(&self) -> &str;

    /// Send a single queued mutation.
    ///
    /// # Errors
    /// - `Error::Transport` for network or server failures (retryable)
    async fn send(&self, operation: &PendingOperation) -> Result<SendOutcome>;

    /// Fetch changes made remotely after `since` (all known changes if `None`).
    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>>;
}

/// Remote copy of an entity.
#[derive(Debug, Clone)]
struct RemoteEntity {
    entity_type: EntityType,
    data: Value,
    version: u64,
    timestamp: DateTime<Utc>,
}

/// In-process remote authority.
///
/// Accepts a mutation only when it is based on the version the authority
/// currently holds, and reports a conflict otherwise. Supports fault
/// injection for exercising retry paths.
#[derive(Default)]
pub struct MemoryTransport {
    entities: Mutex<HashMap<EntityId, RemoteEntity>>,
    changes: Mutex<Vec<RemoteChange>>,
    sent: Mutex<Vec<String>>,
    send_delay: Mutex<Option<Duration>>,
    send_count: AtomicUsize,
    failures_pending: AtomicU32,
    offline: AtomicBool,
}

impl MemoryTransport {
    /// Create an empty authority.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Simulate the network being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every send, so tests can observe a pass in flight.
    pub async fn set_send_delay(&self, delay: Option<Duration>) {
        *self.send_delay.lock().await = delay;
    }

    /// Number of `send` calls received.
    pub fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }

    /// Operation IDs in the order they were sent.
    pub async fn sent_operations(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }

    /// Write an entity directly on the remote side, as another device would.
    pub async fn seed_remote(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        data: Value,
        version: u64,
        timestamp: DateTime<Utc>,
    ) {
        let entity = RemoteEntity {
            entity_type,
            data: data.clone(),
            version,
            timestamp,
        };
        self.entities.lock().await.insert(entity_id.clone(), entity);
        self.changes.lock().await.push(RemoteChange {
            entity_type,
            entity_id,
            kind: OperationKind::Update,
            data,
            version,
            timestamp,
        });
    }

    /// Delete an entity on the remote side, as another device would.
    ///
    /// Returns `false` if the authority does not hold the entity.
    pub async fn remove_remote(&self, entity_id: &EntityId, timestamp: DateTime<Utc>) -> bool {
        let Some(entity) = self.entities.lock().await.remove(entity_id) else {
            return false;
        };
        self.changes.lock().await.push(RemoteChange {
            entity_type: entity.entity_type,
            entity_id: entity_id.clone(),
            kind: OperationKind::Delete,
            data: Value::Null,
            version: entity.version + 1,
            timestamp,
        });
        true
    }

    /// Current remote version and data of an entity.
    pub async fn remote_record(&self, entity_id: &EntityId) -> Option<(u64, Value)> {
        self.entities
            .lock()
            .await
            .get(entity_id)
            .map(|e| (e.version, e.data.clone()))
    }
}

#[async_trait]
impl SyncTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, operation: &PendingOperation) -> Result<SendOutcome> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().await.push(operation.id.clone());

        let delay = *self.send_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Transport("Network unreachable".to_string()));
        }
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Transport("Server error (injected)".to_string()));
        }

        let mut entities = self.entities.lock().await;
        let current = entities.get(&operation.entity_id);

        if ConflictResolver::detect_conflict(operation.server_version, current.map(|e| e.version)) {
            if let Some(entity) = current {
                debug!(
                    "Rejecting {}: based on {:?}, remote at {}",
                    operation.id, operation.server_version, entity.version
                );
                return Ok(SendOutcome::Conflict(RemoteSnapshot {
                    data: entity.data.clone(),
                    version: entity.version,
                    timestamp: entity.timestamp,
                }));
            }
        }

        let version = current.map_or(1, |e| e.version + 1);
        let now = Utc::now();
        entities.insert(
            operation.entity_id.clone(),
            RemoteEntity {
                entity_type: operation.entity_type,
                data: operation.payload.clone(),
                version,
                timestamp: now,
            },
        );
        drop(entities);

        self.changes.lock().await.push(RemoteChange {
            entity_type: operation.entity_type,
            entity_id: operation.entity_id.clone(),
            kind: operation.kind,
            data: operation.payload.clone(),
            version,
            timestamp: now,
        });

        Ok(SendOutcome::Accepted {
            server_version: version,
        })
    }

    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Transport("Network unreachable".to_string()));
        }
        let changes = self.changes.lock().await;
        Ok(changes
            .iter()
            .filter(|c| since.map_or(true, |s| c.timestamp > s))
            .cloned()
            .collect())
    }
}

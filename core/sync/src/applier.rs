//! Hook for writing reconciled data back into local domain state.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use fieldsync_common::{EntityId, EntityType, Result};

/// Applies data that the engine has decided is authoritative locally.
///
/// Called for conflict resolutions that keep remote data and for
/// remote-originated changes pulled during a pass. `None` data means the
/// entity was deleted remotely.
#[async_trait]
pub trait ChangeApplier: Send + Sync {
    async fn apply(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        data: Option<&Value>,
    ) -> Result<()>;
}

/// Applier that discards everything, for hosts that re-read remote state
/// themselves.
pub struct NoopApplier;

#[async_trait]
impl ChangeApplier for NoopApplier {
    async fn apply(&self, _: EntityType, _: &EntityId, _: Option<&Value>) -> Result<()> {
        Ok(())
    }
}

/// Applier keeping the latest applied data per entity in memory.
#[derive(Default)]
pub struct MemoryApplier {
    records: RwLock<HashMap<EntityId, (EntityType, Value)>>,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Data last applied for an entity, if it exists locally.
    pub async fn get(&self, entity_id: &EntityId) -> Option<Value> {
        self.records
            .read()
            .await
            .get(entity_id)
            .map(|(_, data)| data.clone())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ChangeApplier for MemoryApplier {
    async fn apply(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        data: Option<&Value>,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        match data {
            Some(data) => {
                records.insert(entity_id.clone(), (entity_type, data.clone()));
            }
            None => {
                records.remove(entity_id);
            }
        }
        Ok(())
    }
}

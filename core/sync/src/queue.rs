//! Eligibility selection over the pending-operation queue.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use fieldsync_common::EntityId;

use crate::config::SyncConfig;
use crate::operation::PendingOperation;
use crate::retry::RetryPolicy;

/// Decides which queued operations may run in the current pass.
///
/// An operation is eligible when:
/// - it has retries left and its backoff has elapsed,
/// - its entity has no unresolved conflict,
/// - no earlier queued operation for the same entity is being held back,
/// - every dependency is either gone from the queue or selected earlier in
///   this same pass.
///
/// Output keeps enqueue order.
pub struct DependencyResolver {
    policy: RetryPolicy,
    now: DateTime<Utc>,
    blocked_entities: HashSet<EntityId>,
}

impl DependencyResolver {
    pub fn new(config: &SyncConfig, now: DateTime<Utc>) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            now,
            blocked_entities: HashSet::new(),
        }
    }

    /// Hold back every operation for these entities.
    pub fn with_blocked_entities(mut self, entities: impl IntoIterator<Item = EntityId>) -> Self {
        self.blocked_entities.extend(entities);
        self
    }

    pub fn select_eligible<'q>(&self, queue: &'q [PendingOperation]) -> Vec<&'q PendingOperation> {
        let queued: HashSet<&str> = queue.iter().map(|op| op.id.as_str()).collect();
        let mut selected: HashSet<&str> = HashSet::new();
        let mut held_entities: HashSet<&EntityId> = HashSet::new();
        let mut eligible = Vec::new();

        for op in queue {
            let ready = !held_entities.contains(&op.entity_id)
                && !self.blocked_entities.contains(&op.entity_id)
                && self.policy.is_ready(op, self.now)
                && op
                    .depends_on
                    .iter()
                    .all(|dep| !queued.contains(dep.as_str()) || selected.contains(dep.as_str()));

            if ready {
                selected.insert(op.id.as_str());
                eligible.push(op);
            } else {
                held_entities.insert(&op.entity_id);
            }
        }

        eligible
    }
}

/// Select the operations eligible to run at `now`.
pub fn select_eligible<'q>(
    queue: &'q [PendingOperation],
    config: &SyncConfig,
    now: DateTime<Utc>,
) -> Vec<&'q PendingOperation> {
    DependencyResolver::new(config, now).select_eligible(queue)
}

//! Core sync engine that orchestrates all sync operations.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use fieldsync_common::{EntityId, EntityType, Error, OperationKind, Result};
use fieldsync_storage::KeyValueStore;

use crate::applier::{ChangeApplier, NoopApplier};
use crate::config::{schedule_changed, SyncConfig, SyncConfigUpdate};
use crate::conflict::{ConflictResolver, Resolution, SyncConflict};
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::manifest::{EntityManifest, ModifiedBy};
use crate::operation::{validate_payload, PendingOperation};
use crate::persistence::EngineStore;
use crate::queue::DependencyResolver;
use crate::retry::RetryPolicy;
use crate::scheduler::AutoSyncTimer;
use crate::state::{OperationError, SyncEngineState, SyncResult};
use crate::transport::{RemoteSnapshot, SendOutcome, SyncTransport};

/// How a person settled a conflict.
enum Settlement {
    KeepLocal,
    KeepRemote,
    Merge(Value),
}

struct EngineInner<T: ?Sized> {
    store: EngineStore,
    applier: Arc<dyn ChangeApplier>,
    state: RwLock<SyncEngineState>,
    manifest: RwLock<EntityManifest>,
    config: RwLock<SyncConfig>,
    events: EventBus,
    timer: Mutex<Option<AutoSyncTimer>>,
    transport: Arc<T>,
}

/// Offline-first sync engine.
///
/// Cheap to clone; clones share the same state, queue and collaborators.
/// Every instance is independent of every other, so tests can run several
/// side by side.
pub struct SyncEngine<T: SyncTransport + ?Sized> {
    inner: Arc<EngineInner<T>>,
}

impl<T: SyncTransport + ?Sized> Clone for SyncEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning handle used by background tasks.
pub struct WeakSyncEngine<T: SyncTransport + ?Sized> {
    inner: Weak<EngineInner<T>>,
}

impl<T: SyncTransport + ?Sized> WeakSyncEngine<T> {
    pub fn upgrade(&self) -> Option<SyncEngine<T>> {
        self.inner.upgrade().map(|inner| SyncEngine { inner })
    }
}

impl<T: SyncTransport + ?Sized> Clone for WeakSyncEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: SyncTransport + ?Sized + 'static> SyncEngine<T> {
    /// Create an engine that discards applied remote data.
    pub async fn new(transport: Arc<T>, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::with_applier(transport, store, Arc::new(NoopApplier)).await
    }

    /// Create an engine, restoring any state persisted in `store`.
    pub async fn with_applier(
        transport: Arc<T>,
        store: Arc<dyn KeyValueStore>,
        applier: Arc<dyn ChangeApplier>,
    ) -> Result<Self> {
        let store = EngineStore::new(store);
        let loaded = store.load().await;
        store.save_state(&loaded.state).await?;

        info!(
            "Sync engine ready: {} pending, {} active conflicts, transport {}",
            loaded.state.pending_count(),
            loaded.state.active_conflicts().count(),
            transport.name()
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                applier,
                state: RwLock::new(loaded.state),
                manifest: RwLock::new(loaded.manifest),
                config: RwLock::new(loaded.config),
                events: EventBus::new(),
                timer: Mutex::new(None),
                transport,
            }),
        })
    }

    pub fn downgrade(&self) -> WeakSyncEngine<T> {
        WeakSyncEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    /// Queue a local mutation.
    ///
    /// The operation gets the next provisional version for its entity and is
    /// durable once this returns. No sync pass is started here.
    ///
    /// # Errors
    /// - `InvalidInput` for a malformed payload or an unknown dependency
    /// - Storage errors; the queue is left unchanged in that case
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: EntityId,
        payload: Value,
        depends_on: impl IntoIterator<Item = String>,
    ) -> Result<PendingOperation> {
        validate_payload(kind, &payload)?;
        let depends_on: BTreeSet<String> = depends_on.into_iter().collect();

        let mut state = self.inner.state.write().await;
        if let Some(missing) = depends_on.iter().find(|d| !state.contains_operation(d)) {
            return Err(Error::InvalidInput(format!(
                "Dependency {} is not a queued operation",
                missing
            )));
        }

        let mut manifest = self.inner.manifest.write().await;
        let version = manifest.next_version(&entity_id);
        let mut op = PendingOperation::new(
            kind,
            entity_type,
            entity_id.clone(),
            payload,
            version,
            depends_on,
        );
        op.server_version = manifest.confirmed_version(&entity_id);

        let mut next_manifest = manifest.clone();
        next_manifest.record_local(entity_type, &entity_id, version);
        let mut next_state = state.clone();
        next_state.pending_operations.push(op.clone());

        self.inner.store.save_manifest(&next_manifest).await?;
        self.inner.store.save_state(&next_state).await?;
        *manifest = next_manifest;
        *state = next_state;
        let pending = state.pending_count();
        drop(manifest);
        drop(state);

        debug!(
            "Queued {} {} {} v{} ({} pending)",
            kind, entity_type, entity_id, version, pending
        );
        self.inner.events.emit(SyncEvent::QueueChanged { pending });
        Ok(op)
    }

    /// Run one sync pass.
    ///
    /// Returns a skipped result without side effects when a pass is already
    /// running, the device is offline, or the previous pass finished less
    /// than `throttle_ms` ago.
    pub async fn sync(&self) -> SyncResult {
        let config = self.inner.config.read().await.clone();
        let started = Instant::now();
        let now = Utc::now();

        let (eligible, since) = {
            let mut state = self.inner.state.write().await;
            if state.sync_in_progress {
                debug!("Sync skipped: pass already in progress");
                return SyncResult::skipped("Sync already in progress");
            }
            if !state.online {
                debug!("Sync skipped: offline");
                return SyncResult::skipped("Device is offline");
            }
            if let Some(last) = state.last_sync_time {
                let elapsed = now.signed_duration_since(last).num_milliseconds();
                if elapsed < config.throttle_ms as i64 {
                    debug!("Sync skipped: throttled ({}ms since last pass)", elapsed);
                    return SyncResult::skipped(format!(
                        "Sync throttled: last pass finished {}ms ago, minimum interval is {}ms",
                        elapsed.max(0),
                        config.throttle_ms
                    ));
                }
            }

            // The lock must be durable before the first await on the transport.
            state.sync_in_progress = true;
            if let Err(e) = self.inner.store.save_state(&state).await {
                state.sync_in_progress = false;
                error!("Failed to persist sync lock: {}", e);
                return SyncResult {
                    errors: vec![OperationError::pass(
                        format!("Failed to persist sync lock: {}", e),
                        true,
                    )],
                    ..Default::default()
                };
            }

            let blocked = state.active_conflicts().map(|c| c.entity_id.clone());
            let eligible: Vec<PendingOperation> = DependencyResolver::new(&config, now)
                .with_blocked_entities(blocked)
                .select_eligible(&state.pending_operations)
                .into_iter()
                .cloned()
                .collect();
            info!(
                "Starting sync pass: {} eligible of {} pending",
                eligible.len(),
                state.pending_count()
            );
            (eligible, state.pull_cursor)
        };

        let mut result = SyncResult::default();
        let resolver = ConflictResolver::new(config.conflict_strategy);
        let policy = RetryPolicy::from_config(&config);
        let mut halted: HashSet<EntityId> = HashSet::new();

        for batch in eligible.chunks(config.batch_size.max(1)) {
            debug!("Processing batch of {} operations", batch.len());
            for op in batch {
                self.process_operation(op, &resolver, &policy, &mut halted, &mut result)
                    .await;
            }
            if let Err(e) = self.persist().await {
                error!("Failed to persist after batch: {}", e);
                result
                    .errors
                    .push(OperationError::pass(format!("Persistence failed: {}", e), true));
            }
        }

        let cursor = self.pull_remote_changes(since, &mut result).await;

        {
            let mut state = self.inner.state.write().await;
            state.last_sync_time = Some(Utc::now());
            state.pull_cursor = cursor;
            if result.errors.is_empty() {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures += 1;
            }
            state.sync_in_progress = false;
            if let Err(e) = self.inner.store.save_state(&state).await {
                error!("Failed to persist sync result: {}", e);
                result
                    .errors
                    .push(OperationError::pass(format!("Persistence failed: {}", e), true));
            }
        }

        result.success = result.errors.is_empty();
        result.duration = started.elapsed();
        info!(
            "Sync pass finished in {:?}: {} attempted, {} completed, {} failed, {} conflicts ({} resolved), {} pulled",
            result.duration,
            result.operations_attempted,
            result.operations_completed,
            result.operations_failed,
            result.conflicts_detected,
            result.conflicts_resolved,
            result.changes_pulled
        );
        self.inner.events.emit(SyncEvent::SyncCompleted(result.clone()));
        result
    }

    /// Send one operation from the pass snapshot.
    async fn process_operation(
        &self,
        snapshot: &PendingOperation,
        resolver: &ConflictResolver,
        policy: &RetryPolicy,
        halted: &mut HashSet<EntityId>,
        result: &mut SyncResult,
    ) {
        // Re-read the live copy: earlier operations in this pass may have
        // rebased it, or it may have been discarded meanwhile.
        let op = {
            let state = self.inner.state.read().await;
            let Some(op) = state.operation(&snapshot.id).cloned() else {
                return;
            };
            let waiting = op.depends_on.iter().any(|d| state.contains_operation(d));
            if halted.contains(&op.entity_id) || waiting {
                debug!("Deferring {}: predecessor did not complete", op.id);
                halted.insert(op.entity_id.clone());
                result.operations_deferred += 1;
                return;
            }
            op
        };

        result.operations_attempted += 1;
        match self.inner.transport.send(&op).await {
            Ok(SendOutcome::Accepted { server_version }) => {
                self.complete_operation(&op, server_version).await;
                result.operations_completed += 1;
                result.bytes_uploaded += op.payload_size();
            }
            Ok(SendOutcome::Conflict(remote)) => {
                result.conflicts_detected += 1;
                result.bytes_downloaded += payload_size(&remote.data);
                self.handle_conflict(op, remote, resolver, policy, halted, result)
                    .await;
            }
            Err(e) => {
                self.fail_operation(&op, &e.to_string(), policy, result).await;
                halted.insert(op.entity_id.clone());
            }
        }
    }

    async fn complete_operation(&self, op: &PendingOperation, server_version: u64) {
        let mut state = self.inner.state.write().await;
        state.remove_operation(&op.id);
        state.rebase_entity(&op.entity_id, server_version);
        self.inner.manifest.write().await.confirm(
            op.entity_type,
            &op.entity_id,
            server_version,
            ModifiedBy::Local,
        );
        debug!("Completed {} at remote v{}", op.id, server_version);
    }

    async fn fail_operation(
        &self,
        op: &PendingOperation,
        message: &str,
        policy: &RetryPolicy,
        result: &mut SyncResult,
    ) {
        let mut state = self.inner.state.write().await;
        let attempts = match state.operation_mut(&op.id) {
            Some(live) => {
                live.mark_failed(message, Utc::now());
                live.attempts
            }
            None => op.attempts + 1,
        };
        let recoverable = !policy.is_exhausted(attempts);
        if recoverable {
            warn!("Operation {} failed (attempt {}): {}", op.id, attempts, message);
        } else {
            warn!(
                "Operation {} stalled after {} attempts: {}",
                op.id, attempts, message
            );
        }
        result.operations_failed += 1;
        result
            .errors
            .push(OperationError::for_operation(&op.id, message, recoverable));
    }

    async fn handle_conflict(
        &self,
        op: PendingOperation,
        remote: RemoteSnapshot,
        resolver: &ConflictResolver,
        policy: &RetryPolicy,
        halted: &mut HashSet<EntityId>,
        result: &mut SyncResult,
    ) {
        let mut conflict = SyncConflict::new(&op, &remote);
        warn!(
            "Conflict on {} {}: local v{} based on {:?}, remote at v{}",
            op.entity_type, op.entity_id, op.local_version, op.server_version, remote.version
        );

        let Some(resolved) = resolver.resolve(&conflict) else {
            let mut state = self.inner.state.write().await;
            match state.record_conflict(conflict) {
                Ok(id) => info!("Conflict {} awaits manual resolution", id),
                Err(e) => result.errors.push(OperationError::for_operation(
                    &op.id,
                    e.to_string(),
                    true,
                )),
            }
            halted.insert(op.entity_id.clone());
            return;
        };

        if let Err(e) = conflict.resolve(resolved.resolution, resolved.data.clone()) {
            result
                .errors
                .push(OperationError::for_operation(&op.id, e.to_string(), true));
            halted.insert(op.entity_id.clone());
            return;
        }

        if resolved.resolution == Resolution::RemoteWins {
            // Null remote data means the entity was deleted remotely.
            let data = (!resolved.data.is_null()).then_some(&resolved.data);
            if let Err(e) = self
                .inner
                .applier
                .apply(op.entity_type, &op.entity_id, data)
                .await
            {
                self.fail_operation(&op, &format!("Applying remote data failed: {}", e), policy, result)
                    .await;
                halted.insert(op.entity_id.clone());
                return;
            }

            let mut state = self.inner.state.write().await;
            state.conflicts.push(conflict);
            state.remove_operation(&op.id);
            state.rebase_entity(&op.entity_id, remote.version);
            self.inner.manifest.write().await.confirm(
                op.entity_type,
                &op.entity_id,
                remote.version,
                ModifiedBy::Remote,
            );
            result.conflicts_resolved += 1;
            info!("Conflict on {} resolved: remote wins", op.entity_id);
            return;
        }

        // Local data wins: rebase onto the remote version and push it now.
        let rebased = {
            let mut state = self.inner.state.write().await;
            state.conflicts.push(conflict);
            state.rebase_entity(&op.entity_id, remote.version);
            match state.operation_mut(&op.id) {
                Some(live) => {
                    live.rebase(remote.version, resolved.data);
                    live.clone()
                }
                None => return,
            }
        };
        result.conflicts_resolved += 1;
        info!("Conflict on {} resolved: local wins, re-sending", op.entity_id);

        result.operations_attempted += 1;
        match self.inner.transport.send(&rebased).await {
            Ok(SendOutcome::Accepted { server_version }) => {
                self.complete_operation(&rebased, server_version).await;
                result.operations_completed += 1;
                result.bytes_uploaded += rebased.payload_size();
            }
            Ok(SendOutcome::Conflict(newer)) => {
                let message = format!(
                    "Remote moved to v{} while resolving conflict",
                    newer.version
                );
                self.fail_operation(&rebased, &message, policy, result).await;
                halted.insert(op.entity_id.clone());
            }
            Err(e) => {
                self.fail_operation(&rebased, &e.to_string(), policy, result)
                    .await;
                halted.insert(op.entity_id.clone());
            }
        }
    }

    /// Apply remote-originated changes for entities with nothing queued locally.
    ///
    /// Entities with queued operations are left alone; their next send runs
    /// into the conflict path instead. Returns the next pull cursor, which
    /// never moves past a change that was held back or failed to apply, so it
    /// is fetched again once the entity's queue drains or is discarded.
    async fn pull_remote_changes(
        &self,
        since: Option<DateTime<Utc>>,
        result: &mut SyncResult,
    ) -> Option<DateTime<Utc>> {
        let changes = match self.inner.transport.pull(since).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!("Pulling remote changes failed: {}", e);
                result
                    .errors
                    .push(OperationError::pass(format!("Pull failed: {}", e), true));
                return since;
            }
        };

        let mut latest = since;
        let mut earliest_skipped: Option<DateTime<Utc>> = None;
        for change in changes {
            latest = latest.max(Some(change.timestamp));
            let is_newer = self
                .inner
                .manifest
                .read()
                .await
                .confirmed_version(&change.entity_id)
                .map_or(true, |known| change.version > known);
            if !is_newer {
                continue;
            }
            if self.inner.state.read().await.has_pending_for(&change.entity_id) {
                debug!(
                    "Deferring remote v{} of {}: local operations queued",
                    change.version, change.entity_id
                );
                earliest_skipped = Some(hold_back(earliest_skipped, change.timestamp));
                continue;
            }

            let data = (change.kind != OperationKind::Delete).then_some(&change.data);
            if let Err(e) = self
                .inner
                .applier
                .apply(change.entity_type, &change.entity_id, data)
                .await
            {
                warn!("Applying remote change to {} failed: {}", change.entity_id, e);
                result.errors.push(OperationError::pass(
                    format!("Applying remote change to {} failed: {}", change.entity_id, e),
                    true,
                ));
                earliest_skipped = Some(hold_back(earliest_skipped, change.timestamp));
                continue;
            }

            self.inner.manifest.write().await.confirm(
                change.entity_type,
                &change.entity_id,
                change.version,
                ModifiedBy::Remote,
            );
            result.changes_pulled += 1;
            result.bytes_downloaded += change.payload_size();
        }

        if result.changes_pulled > 0 {
            debug!("Applied {} remote changes", result.changes_pulled);
            let manifest = self.inner.manifest.read().await;
            if let Err(e) = self.inner.store.save_manifest(&manifest).await {
                result
                    .errors
                    .push(OperationError::pass(format!("Persistence failed: {}", e), true));
            }
        }

        match earliest_skipped {
            // Pulls return changes strictly after the cursor.
            Some(at) => Some(at - chrono::Duration::nanoseconds(1)),
            None => latest,
        }
    }

    async fn persist(&self) -> Result<()> {
        {
            let manifest = self.inner.manifest.read().await;
            self.inner.store.save_manifest(&manifest).await?;
        }
        let state = self.inner.state.read().await;
        self.inner.store.save_state(&state).await
    }

    /// Read-only snapshot of the engine state.
    pub async fn get_state(&self) -> SyncEngineState {
        self.inner.state.read().await.clone()
    }

    /// Snapshot of the entity version manifest.
    pub async fn manifest(&self) -> EntityManifest {
        self.inner.manifest.read().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.state.read().await.pending_count()
    }

    pub async fn is_online(&self) -> bool {
        self.inner.state.read().await.online
    }

    /// Conflicts awaiting a decision.
    pub async fn conflicts(&self) -> Vec<SyncConflict> {
        self.inner
            .state
            .read()
            .await
            .active_conflicts()
            .cloned()
            .collect()
    }

    /// Every conflict ever recorded, resolved ones included.
    pub async fn conflict_history(&self) -> Vec<SyncConflict> {
        self.inner.state.read().await.conflicts.clone()
    }

    /// Settle a conflict by keeping either the local or the remote side.
    ///
    /// Keeping local re-queues the originating operation on top of the remote
    /// version; keeping remote applies the remote data and drops it.
    pub async fn resolve_conflict_manually(&self, conflict_id: &str, use_local: bool) -> Result<()> {
        let settlement = if use_local {
            Settlement::KeepLocal
        } else {
            Settlement::KeepRemote
        };
        self.settle_conflict(conflict_id, settlement).await
    }

    /// Settle a conflict with data merged by the caller; the merge is pushed
    /// on the next pass.
    pub async fn resolve_conflict_merged(&self, conflict_id: &str, merged: Value) -> Result<()> {
        self.settle_conflict(conflict_id, Settlement::Merge(merged)).await
    }

    async fn settle_conflict(&self, conflict_id: &str, settlement: Settlement) -> Result<()> {
        let conflict = {
            let state = self.inner.state.read().await;
            state
                .conflicts
                .iter()
                .find(|c| c.id == conflict_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("No conflict with id {}", conflict_id)))?
        };
        if conflict.resolved {
            return Err(Error::NotPermitted(format!(
                "Conflict {} is already resolved",
                conflict_id
            )));
        }

        let keep_remote = matches!(settlement, Settlement::KeepRemote);
        let (resolution, data) = match settlement {
            Settlement::KeepLocal => (Resolution::Manual, conflict.local.data.clone()),
            Settlement::KeepRemote => (Resolution::Manual, conflict.remote.data.clone()),
            Settlement::Merge(merged) => (Resolution::Merged, merged),
        };

        if keep_remote {
            self.inner
                .applier
                .apply(
                    conflict.entity_type,
                    &conflict.entity_id,
                    (!data.is_null()).then_some(&data),
                )
                .await?;
        }

        let mut state = self.inner.state.write().await;
        let record = state
            .conflict_mut(conflict_id)
            .ok_or_else(|| Error::NotFound(format!("No conflict with id {}", conflict_id)))?;
        record.resolve(resolution, data.clone())?;

        let remote_version = conflict.remote.version;
        state.rebase_entity(&conflict.entity_id, remote_version);
        if keep_remote {
            state.remove_operation(&conflict.operation_id);
            self.inner.manifest.write().await.confirm(
                conflict.entity_type,
                &conflict.entity_id,
                remote_version,
                ModifiedBy::Remote,
            );
        } else {
            match state.operation_mut(&conflict.operation_id) {
                Some(op) => {
                    op.rebase(remote_version, data);
                    op.reset_attempts();
                }
                None => warn!(
                    "Operation {} for conflict {} is gone; nothing to re-send",
                    conflict.operation_id, conflict_id
                ),
            }
        }

        {
            let manifest = self.inner.manifest.read().await;
            self.inner.store.save_manifest(&manifest).await?;
        }
        self.inner.store.save_state(&state).await?;
        drop(state);

        info!("Conflict {} on {} resolved manually", conflict_id, conflict.entity_id);
        self.inner.events.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
        });
        Ok(())
    }

    /// Operations that have used up their retries and are no longer selected.
    pub async fn stalled_operations(&self) -> Vec<PendingOperation> {
        let policy = RetryPolicy::from_config(&*self.inner.config.read().await);
        self.inner
            .state
            .read()
            .await
            .stalled_operations(&policy)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Give an operation a fresh set of retries.
    pub async fn retry_stalled(&self, operation_id: &str) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let op = state
            .operation_mut(operation_id)
            .ok_or_else(|| Error::NotFound(format!("No queued operation {}", operation_id)))?;
        op.reset_attempts();
        self.inner.store.save_state(&state).await?;
        let pending = state.pending_count();
        drop(state);

        info!("Operation {} re-armed for retry", operation_id);
        self.inner.events.emit(SyncEvent::QueueChanged { pending });
        Ok(())
    }

    /// Remove a queued operation without sending it.
    ///
    /// # Errors
    /// - `NotFound` if the operation is not queued
    /// - `NotPermitted` while other queued operations depend on it
    pub async fn discard_operation(&self, operation_id: &str) -> Result<PendingOperation> {
        let mut state = self.inner.state.write().await;
        if !state.contains_operation(operation_id) {
            return Err(Error::NotFound(format!("No queued operation {}", operation_id)));
        }
        if state.has_dependents(operation_id) {
            return Err(Error::NotPermitted(format!(
                "Operation {} has queued dependents",
                operation_id
            )));
        }

        let mut next_state = state.clone();
        let removed = next_state
            .remove_operation(operation_id)
            .ok_or_else(|| Error::NotFound(format!("No queued operation {}", operation_id)))?;
        self.inner.store.save_state(&next_state).await?;
        *state = next_state;
        let pending = state.pending_count();
        drop(state);

        warn!(
            "Discarded operation {} ({} {})",
            removed.id, removed.kind, removed.entity_id
        );
        self.inner.events.emit(SyncEvent::QueueChanged { pending });
        Ok(removed)
    }

    /// Current configuration.
    pub async fn config(&self) -> SyncConfig {
        self.inner.config.read().await.clone()
    }

    /// Merge a partial configuration, persist it, and reschedule the
    /// periodic timer if its settings changed.
    pub async fn update_config(&self, update: SyncConfigUpdate) -> Result<SyncConfig> {
        let (old, new) = {
            let mut config = self.inner.config.write().await;
            let merged = update.apply_to(&config);
            merged.validate()?;
            self.inner.store.save_config(&merged).await?;
            let old = std::mem::replace(&mut *config, merged.clone());
            (old, merged)
        };

        if schedule_changed(&old, &new) {
            self.reschedule(&new).await;
        }

        debug!("Sync config updated: {:?}", new);
        self.inner.events.emit(SyncEvent::ConfigChanged);
        Ok(new)
    }

    /// Start the periodic timer if `auto_sync` is enabled.
    pub async fn start_auto_sync(&self) {
        let config = self.config().await;
        self.reschedule(&config).await;
    }

    /// Stop the periodic timer. A pass already running is not interrupted.
    pub async fn stop_auto_sync(&self) {
        if self.inner.timer.lock().await.take().is_some() {
            info!("Auto-sync timer stopped");
        }
    }

    pub async fn is_auto_sync_running(&self) -> bool {
        self.inner
            .timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| t.is_running())
    }

    async fn reschedule(&self, config: &SyncConfig) {
        let mut timer = self.inner.timer.lock().await;
        // Dropping the old timer stops it once any running pass finishes.
        *timer = None;
        if config.auto_sync {
            *timer = Some(AutoSyncTimer::spawn(
                self.downgrade(),
                config.sync_interval(),
            ));
        }
    }

    /// Record a reachability transition.
    ///
    /// Coming online stamps `last_online_time` and, with `sync_on_connect`,
    /// runs a pass whose result is returned.
    pub async fn set_online(&self, online: bool) -> Result<Option<SyncResult>> {
        {
            let mut state = self.inner.state.write().await;
            if state.online == online {
                return Ok(None);
            }
            state.online = online;
            if online {
                state.last_online_time = Some(Utc::now());
            }
            self.inner.store.save_state(&state).await?;
        }

        info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        self.inner
            .events
            .emit(SyncEvent::ConnectivityChanged { online });

        if online && self.inner.config.read().await.sync_on_connect {
            return Ok(Some(self.sync().await));
        }
        Ok(None)
    }

    /// Receive engine events by polling.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.receiver()
    }

    /// Invoke `listener` after every state-mutating step.
    ///
    /// Delivery happens on a separate task, so a slow listener never holds up
    /// the engine.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }
}

fn hold_back(cursor: Option<DateTime<Utc>>, at: DateTime<Utc>) -> DateTime<Utc> {
    cursor.map_or(at, |current| current.min(at))
}

fn payload_size(data: &Value) -> u64 {
    serde_json::to_vec(data)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MemoryApplier;
    use crate::conflict::ConflictStrategy;
    use crate::transport::MemoryTransport;
    use fieldsync_storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        engine: SyncEngine<MemoryTransport>,
        transport: Arc<MemoryTransport>,
        applier: Arc<MemoryApplier>,
        store: Arc<MemoryStore>,
    }

    async fn harness(strategy: ConflictStrategy) -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_on(store, strategy).await
    }

    async fn harness_on(store: Arc<MemoryStore>, strategy: ConflictStrategy) -> Harness {
        let transport = Arc::new(MemoryTransport::new());
        let applier = Arc::new(MemoryApplier::new());
        let engine = SyncEngine::with_applier(transport.clone(), store.clone(), applier.clone())
            .await
            .unwrap();
        engine
            .update_config(SyncConfigUpdate {
                throttle_ms: Some(0),
                conflict_strategy: Some(strategy),
                ..Default::default()
            })
            .await
            .unwrap();
        Harness {
            engine,
            transport,
            applier,
            store,
        }
    }

    fn id(raw: &str) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    async fn create(
        engine: &SyncEngine<MemoryTransport>,
        entity_type: EntityType,
        entity: &str,
        depends_on: &[&PendingOperation],
    ) -> PendingOperation {
        engine
            .enqueue(
                OperationKind::Create,
                entity_type,
                id(entity),
                json!({"name": entity}),
                depends_on.iter().map(|op| op.id.clone()),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_first_operation() {
        let h = harness(ConflictStrategy::NewestWins).await;
        let op = h
            .engine
            .enqueue(
                OperationKind::Create,
                EntityType::DailyLog,
                id("log1"),
                json!({"weather": "rain"}),
                [],
            )
            .await
            .unwrap();

        assert_eq!(op.local_version, 1);
        assert_eq!(op.attempts, 0);
        assert_eq!(h.engine.pending_count().await, 1);

        let manifest = h.engine.manifest().await;
        let entry = manifest.get(&id("log1")).unwrap();
        assert!(entry.is_provisional());
        assert_eq!(entry.modified_by, ModifiedBy::Local);
    }

    #[tokio::test]
    async fn test_local_versions_increase_per_entity() {
        let h = harness(ConflictStrategy::NewestWins).await;
        let mut versions = Vec::new();
        for entity in ["a", "b", "a", "a", "b"] {
            let op = create(&h.engine, EntityType::Observation, entity, &[]).await;
            versions.push((entity, op.local_version));
        }

        assert_eq!(
            versions,
            vec![("a", 1), ("b", 1), ("a", 2), ("a", 3), ("b", 2)]
        );
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_input() {
        let h = harness(ConflictStrategy::NewestWins).await;

        let bad_payload = h
            .engine
            .enqueue(OperationKind::Update, EntityType::Report, id("r1"), json!([1, 2]), [])
            .await;
        assert!(matches!(bad_payload, Err(Error::InvalidInput(_))));

        let unknown_dep = h
            .engine
            .enqueue(
                OperationKind::Update,
                EntityType::Report,
                id("r1"),
                json!({}),
                ["missing".to_string()],
            )
            .await;
        assert!(matches!(unknown_dep, Err(Error::InvalidInput(_))));

        assert_eq!(h.engine.pending_count().await, 0);
        assert!(h.engine.manifest().await.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_storage_failure_leaves_queue_unchanged() {
        let h = harness(ConflictStrategy::NewestWins).await;
        h.store.set_fail_writes(true);

        let result = h
            .engine
            .enqueue(OperationKind::Create, EntityType::Project, id("p1"), json!({}), [])
            .await;

        assert!(result.is_err());
        assert_eq!(h.engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_sync_sends_and_is_idempotent() {
        let h = harness(ConflictStrategy::NewestWins).await;
        create(&h.engine, EntityType::Project, "p1", &[]).await;
        create(&h.engine, EntityType::DailyLog, "log1", &[]).await;

        let first = h.engine.sync().await;
        assert!(first.success);
        assert_eq!(first.operations_attempted, 2);
        assert_eq!(first.operations_completed, 2);
        assert!(first.bytes_uploaded > 0);
        assert_eq!(h.engine.pending_count().await, 0);

        let second = h.engine.sync().await;
        assert!(second.success);
        assert_eq!(second.operations_attempted, 0);
        assert_eq!(h.transport.send_count(), 2);

        let manifest = h.engine.manifest().await;
        let entry = manifest.get(&id("p1")).unwrap();
        assert_eq!(entry.confirmed_version, Some(1));
        assert!(!entry.is_provisional());

        let state = h.engine.get_state().await;
        assert!(!state.sync_in_progress);
        assert!(state.last_sync_time.is_some());
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_batches_cover_whole_queue() {
        let h = harness(ConflictStrategy::NewestWins).await;
        h.engine
            .update_config(SyncConfigUpdate {
                batch_size: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        for i in 0..5 {
            create(&h.engine, EntityType::Observation, &format!("obs{}", i), &[]).await;
        }

        let result = h.engine.sync().await;
        assert_eq!(result.operations_completed, 5);
        assert_eq!(h.engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_manual_conflict_holds_back_dependents() {
        let h = harness(ConflictStrategy::Manual).await;
        h.transport
            .seed_remote(EntityType::Project, id("p1"), json!({"name": "remote"}), 2, Utc::now())
            .await;
        let a = create(&h.engine, EntityType::Project, "p1", &[]).await;
        let b = create(&h.engine, EntityType::DailyLog, "log1", &[&a]).await;

        let first = h.engine.sync().await;
        assert_eq!(first.conflicts_detected, 1);
        assert_eq!(first.conflicts_resolved, 0);
        assert_eq!(first.operations_deferred, 1);
        assert_eq!(h.transport.sent_operations().await, vec![a.id.clone()]);

        let conflicts = h.engine.conflicts().await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].operation_id, a.id);
        assert_eq!(h.engine.pending_count().await, 2);

        // Still blocked on the next pass.
        let second = h.engine.sync().await;
        assert_eq!(second.operations_attempted, 0);
        assert_eq!(h.transport.send_count(), 1);

        h.engine
            .resolve_conflict_manually(&conflicts[0].id, true)
            .await
            .unwrap();
        assert!(h.engine.conflicts().await.is_empty());

        let third = h.engine.sync().await;
        assert_eq!(third.operations_completed, 2);
        assert_eq!(h.transport.sent_operations().await, vec![a.id.clone(), a.id, b.id]);
        assert_eq!(
            h.transport.remote_record(&id("p1")).await,
            Some((3, json!({"name": "p1"})))
        );

        let history = h.engine.conflict_history().await;
        assert_eq!(history[0].resolution, Some(Resolution::Manual));
    }

    #[tokio::test]
    async fn test_conflict_per_entity() {
        let h = harness(ConflictStrategy::Manual).await;
        for entity in ["i1", "i2"] {
            h.transport
                .seed_remote(EntityType::Inspection, id(entity), json!({}), 2, Utc::now())
                .await;
            create(&h.engine, EntityType::Inspection, entity, &[]).await;
        }

        let result = h.engine.sync().await;
        assert_eq!(result.conflicts_detected, 2);

        let conflicts = h.engine.conflicts().await;
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.iter().all(|c| c.local.version == 1 && c.remote.version == 2));
    }

    #[tokio::test]
    async fn test_manual_keep_remote_applies_and_drops_operation() {
        let h = harness(ConflictStrategy::Manual).await;
        h.transport
            .seed_remote(EntityType::Report, id("r1"), json!({"title": "theirs"}), 5, Utc::now())
            .await;
        create(&h.engine, EntityType::Report, "r1", &[]).await;
        h.engine.sync().await;

        let conflict_id = h.engine.conflicts().await[0].id.clone();
        h.engine
            .resolve_conflict_manually(&conflict_id, false)
            .await
            .unwrap();

        assert_eq!(h.engine.pending_count().await, 0);
        assert_eq!(h.applier.get(&id("r1")).await, Some(json!({"title": "theirs"})));
        let manifest = h.engine.manifest().await;
        let entry = manifest.get(&id("r1")).unwrap();
        assert_eq!(entry.confirmed_version, Some(5));
        assert_eq!(entry.modified_by, ModifiedBy::Remote);

        let again = h.engine.resolve_conflict_manually(&conflict_id, true).await;
        assert!(matches!(again, Err(Error::NotPermitted(_))));
        let unknown = h.engine.resolve_conflict_manually("nope", true).await;
        assert!(matches!(unknown, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_merged_resolution_is_pushed() {
        let h = harness(ConflictStrategy::Manual).await;
        h.transport
            .seed_remote(EntityType::Report, id("r1"), json!({"a": 1}), 1, Utc::now())
            .await;
        create(&h.engine, EntityType::Report, "r1", &[]).await;
        h.engine.sync().await;

        let conflict_id = h.engine.conflicts().await[0].id.clone();
        h.engine
            .resolve_conflict_merged(&conflict_id, json!({"a": 1, "name": "r1"}))
            .await
            .unwrap();
        h.engine.sync().await;

        assert_eq!(
            h.transport.remote_record(&id("r1")).await,
            Some((2, json!({"a": 1, "name": "r1"})))
        );
    }

    #[tokio::test]
    async fn test_newest_wins_keeps_newer_local() {
        let h = harness(ConflictStrategy::NewestWins).await;
        let earlier = Utc::now() - chrono::Duration::hours(1);
        h.transport
            .seed_remote(EntityType::Project, id("p1"), json!({"name": "old"}), 2, earlier)
            .await;
        create(&h.engine, EntityType::Project, "p1", &[]).await;

        let result = h.engine.sync().await;
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(result.operations_completed, 1);
        assert!(result.success);

        assert_eq!(h.engine.pending_count().await, 0);
        assert_eq!(
            h.transport.remote_record(&id("p1")).await,
            Some((3, json!({"name": "p1"})))
        );
        let history = h.engine.conflict_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resolution, Some(Resolution::LocalWins));
        assert!(h.engine.conflicts().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_wins_applies_remote_data() {
        let h = harness(ConflictStrategy::RemoteWins).await;
        h.transport
            .seed_remote(EntityType::Project, id("p1"), json!({"name": "server"}), 2, Utc::now())
            .await;
        create(&h.engine, EntityType::Project, "p1", &[]).await;

        let result = h.engine.sync().await;
        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(result.operations_completed, 0);

        assert_eq!(h.engine.pending_count().await, 0);
        assert_eq!(h.applier.get(&id("p1")).await, Some(json!({"name": "server"})));
        assert_eq!(
            h.engine.manifest().await.confirmed_version(&id("p1")),
            Some(2)
        );
        assert_eq!(
            h.transport.remote_record(&id("p1")).await,
            Some((2, json!({"name": "server"})))
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_retried() {
        let h = harness(ConflictStrategy::NewestWins).await;
        let op = create(&h.engine, EntityType::DailyLog, "log1", &[]).await;
        h.transport.fail_next(1);

        let failed = h.engine.sync().await;
        assert!(!failed.success);
        assert_eq!(failed.operations_failed, 1);
        assert_eq!(failed.errors[0].operation_id.as_deref(), Some(op.id.as_str()));
        assert!(failed.errors[0].recoverable);

        let state = h.engine.get_state().await;
        assert_eq!(state.consecutive_failures, 1);
        let queued = state.operation(&op.id).unwrap();
        assert_eq!(queued.attempts, 1);
        assert!(queued.last_error.is_some());

        let retried = h.engine.sync().await;
        assert!(retried.success);
        assert_eq!(retried.operations_completed, 1);
        assert_eq!(h.engine.get_state().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_failed_operation_holds_back_same_entity() {
        let h = harness(ConflictStrategy::NewestWins).await;
        let first = create(&h.engine, EntityType::DailyLog, "log1", &[]).await;
        let second = h
            .engine
            .enqueue(
                OperationKind::Update,
                EntityType::DailyLog,
                id("log1"),
                json!({"weather": "sun"}),
                [],
            )
            .await
            .unwrap();
        create(&h.engine, EntityType::DailyLog, "log2", &[]).await;
        h.transport.fail_next(1);

        let result = h.engine.sync().await;
        assert_eq!(result.operations_failed, 1);
        assert_eq!(result.operations_deferred, 1);
        assert_eq!(result.operations_completed, 1);

        let result = h.engine.sync().await;
        assert_eq!(result.operations_completed, 2);
        let sent = h.transport.sent_operations().await;
        assert_eq!(&sent[sent.len() - 2..], &[first.id, second.id]);
        assert_eq!(
            h.transport.remote_record(&id("log1")).await,
            Some((2, json!({"weather": "sun"})))
        );
    }

    #[tokio::test]
    async fn test_exhausted_operation_stalls_until_rearmed() {
        let h = harness(ConflictStrategy::NewestWins).await;
        h.engine
            .update_config(SyncConfigUpdate {
                max_retries: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        let op = create(&h.engine, EntityType::Observation, "obs1", &[]).await;
        h.transport.fail_next(10);

        assert!(h.engine.sync().await.errors[0].recoverable);
        assert!(!h.engine.sync().await.errors[0].recoverable);

        let stalled = h.engine.stalled_operations().await;
        assert_eq!(stalled.len(), 1);
        assert_eq!(h.engine.sync().await.operations_attempted, 0);
        assert_eq!(h.engine.pending_count().await, 1);

        h.transport.fail_next(0);
        h.engine.retry_stalled(&op.id).await.unwrap();
        assert!(h.engine.stalled_operations().await.is_empty());
        assert_eq!(h.engine.sync().await.operations_completed, 1);

        let missing = h.engine.retry_stalled(&op.id).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_discard_operation() {
        let h = harness(ConflictStrategy::NewestWins).await;
        let a = create(&h.engine, EntityType::Project, "p1", &[]).await;
        let b = create(&h.engine, EntityType::DailyLog, "log1", &[&a]).await;

        let refused = h.engine.discard_operation(&a.id).await;
        assert!(matches!(refused, Err(Error::NotPermitted(_))));

        assert_eq!(h.engine.discard_operation(&b.id).await.unwrap().id, b.id);
        h.engine.discard_operation(&a.id).await.unwrap();
        assert_eq!(h.engine.pending_count().await, 0);

        // Versions keep increasing after a discard.
        let next = create(&h.engine, EntityType::Project, "p1", &[]).await;
        assert_eq!(next.local_version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_rejected() {
        let h = harness(ConflictStrategy::NewestWins).await;
        create(&h.engine, EntityType::Project, "p1", &[]).await;
        h.transport
            .set_send_delay(Some(Duration::from_millis(200)))
            .await;

        let engine = h.engine.clone();
        let running = tokio::spawn(async move { engine.sync().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let before = h.engine.get_state().await;
        assert!(before.sync_in_progress);
        let rejected = h.engine.sync().await;
        assert!(rejected.was_skipped());
        assert!(!rejected.success);
        assert_eq!(rejected.operations_attempted, 0);
        assert!(rejected.errors[0].recoverable);

        let after = h.engine.get_state().await;
        assert_eq!(after.pending_operations, before.pending_operations);
        assert_eq!(after.last_sync_time, before.last_sync_time);

        let finished = running.await.unwrap();
        assert_eq!(finished.operations_completed, 1);
        assert_eq!(h.transport.send_count(), 1);
    }

    #[tokio::test]
    async fn test_throttled_sync() {
        let h = harness(ConflictStrategy::NewestWins).await;
        h.engine
            .update_config(SyncConfigUpdate {
                throttle_ms: Some(60_000),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(h.engine.sync().await.success);
        create(&h.engine, EntityType::Project, "p1", &[]).await;

        let throttled = h.engine.sync().await;
        assert!(!throttled.success);
        assert_eq!(throttled.operations_attempted, 0);
        assert!(throttled.skipped.unwrap().contains("throttled"));
        assert_eq!(h.engine.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_offline_then_reconnect() {
        let h = harness(ConflictStrategy::NewestWins).await;
        assert!(h.engine.set_online(false).await.unwrap().is_none());
        create(&h.engine, EntityType::Project, "p1", &[]).await;

        let offline = h.engine.sync().await;
        assert!(offline.was_skipped());
        assert_eq!(h.transport.send_count(), 0);

        let result = h.engine.set_online(true).await.unwrap().unwrap();
        assert_eq!(result.operations_completed, 1);

        let state = h.engine.get_state().await;
        assert!(state.online);
        assert!(state.last_online_time.is_some());

        // Repeating the same state is not a transition.
        assert!(h.engine.set_online(true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_without_sync_on_connect() {
        let h = harness(ConflictStrategy::NewestWins).await;
        h.engine
            .update_config(SyncConfigUpdate {
                sync_on_connect: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        h.engine.set_online(false).await.unwrap();
        create(&h.engine, EntityType::Project, "p1", &[]).await;

        assert!(h.engine.set_online(true).await.unwrap().is_none());
        assert_eq!(h.engine.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_pull_applies_remote_changes() {
        let h = harness(ConflictStrategy::NewestWins).await;
        h.transport
            .seed_remote(
                EntityType::Inspection,
                id("i9"),
                json!({"score": 4}),
                4,
                Utc::now() - chrono::Duration::seconds(1),
            )
            .await;

        let result = h.engine.sync().await;
        assert_eq!(result.changes_pulled, 1);
        assert!(result.bytes_downloaded > 0);
        assert_eq!(h.applier.get(&id("i9")).await, Some(json!({"score": 4})));

        let manifest = h.engine.manifest().await;
        let entry = manifest.get(&id("i9")).unwrap();
        assert_eq!(entry.confirmed_version, Some(4));
        assert_eq!(entry.modified_by, ModifiedBy::Remote);

        // The next local edit builds on the pulled version.
        let op = create(&h.engine, EntityType::Inspection, "i9", &[]).await;
        assert_eq!(op.local_version, 5);
        assert_eq!(op.server_version, Some(4));
        assert_eq!(h.engine.sync().await.operations_completed, 1);
    }

    #[tokio::test]
    async fn test_pull_skips_entities_with_queued_operations() {
        let h = harness(ConflictStrategy::Manual).await;
        h.transport.set_offline(true);
        create(&h.engine, EntityType::Project, "p1", &[]).await;
        h.engine.sync().await;

        h.transport.set_offline(false);
        h.transport
            .seed_remote(EntityType::Project, id("p1"), json!({"name": "x"}), 1, Utc::now())
            .await;
        h.transport.fail_next(1);

        let result = h.engine.sync().await;
        assert_eq!(result.changes_pulled, 0);
        assert!(h.applier.is_empty().await);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let h = harness(ConflictStrategy::Manual).await;
        create(&h.engine, EntityType::DailyLog, "log1", &[]).await;
        create(&h.engine, EntityType::DailyLog, "log1", &[]).await;
        h.engine
            .update_config(SyncConfigUpdate {
                batch_size: Some(9),
                ..Default::default()
            })
            .await
            .unwrap();
        h.engine.stop_auto_sync().await;

        let reopened = harness_on(h.store.clone(), ConflictStrategy::Manual).await;
        assert_eq!(reopened.engine.pending_count().await, 2);
        assert_eq!(reopened.engine.config().await.batch_size, 9);

        let op = create(&reopened.engine, EntityType::DailyLog, "log1", &[]).await;
        assert_eq!(op.local_version, 3);
    }

    #[tokio::test]
    async fn test_update_config() {
        let h = harness(ConflictStrategy::NewestWins).await;

        let invalid = h
            .engine
            .update_config(SyncConfigUpdate {
                batch_size: Some(0),
                ..Default::default()
            })
            .await;
        assert!(matches!(invalid, Err(Error::InvalidInput(_))));
        assert_eq!(h.engine.config().await.batch_size, 50);

        h.engine.start_auto_sync().await;
        assert!(h.engine.is_auto_sync_running().await);

        let updated = h
            .engine
            .update_config(SyncConfigUpdate {
                auto_sync: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!updated.auto_sync);
        assert!(!h.engine.is_auto_sync_running().await);

        h.engine
            .update_config(SyncConfigUpdate {
                auto_sync: Some(true),
                sync_interval_minutes: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(h.engine.is_auto_sync_running().await);

        h.engine.stop_auto_sync().await;
        assert!(!h.engine.is_auto_sync_running().await);
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let h = harness(ConflictStrategy::NewestWins).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = h.engine.subscribe(move |event| {
            let _ = tx.send(event);
        });

        create(&h.engine, EntityType::Project, "p1", &[]).await;
        h.engine.sync().await;
        h.engine.set_online(false).await.unwrap();

        assert_eq!(rx.recv().await, Some(SyncEvent::QueueChanged { pending: 1 }));
        match rx.recv().await {
            Some(SyncEvent::SyncCompleted(result)) => assert_eq!(result.operations_completed, 1),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            rx.recv().await,
            Some(SyncEvent::ConnectivityChanged { online: false })
        );

        subscription.unsubscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.engine.set_online(true).await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_engines_are_independent() {
        let first = harness(ConflictStrategy::NewestWins).await;
        let second = harness(ConflictStrategy::NewestWins).await;

        create(&first.engine, EntityType::Project, "p1", &[]).await;

        assert_eq!(first.engine.pending_count().await, 1);
        assert_eq!(second.engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_sync_lock_is_persisted_before_sending() {
        let h = harness(ConflictStrategy::NewestWins).await;
        create(&h.engine, EntityType::Project, "p1", &[]).await;
        h.transport
            .set_send_delay(Some(Duration::from_millis(200)))
            .await;

        let engine = h.engine.clone();
        let running = tokio::spawn(async move { engine.sync().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.transport.send_count(), 1);

        assert!(persisted_lock(&h.store).await);

        running.await.unwrap();
        assert!(!persisted_lock(&h.store).await);
    }

    async fn persisted_lock(store: &MemoryStore) -> bool {
        let raw = store.get("sync.engine_state").await.unwrap().unwrap();
        let blob: Value = serde_json::from_str(&raw).unwrap();
        blob["data"]["sync_in_progress"].as_bool().unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_during_pass_waits_for_next_pass() {
        let h = harness(ConflictStrategy::NewestWins).await;
        let first = create(&h.engine, EntityType::Project, "p1", &[]).await;
        h.transport
            .set_send_delay(Some(Duration::from_millis(200)))
            .await;

        let engine = h.engine.clone();
        let running = tokio::spawn(async move { engine.sync().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = create(&h.engine, EntityType::Project, "p2", &[]).await;

        let pass = running.await.unwrap();
        assert_eq!(pass.operations_attempted, 1);
        assert_eq!(pass.operations_completed, 1);
        assert_eq!(h.engine.pending_count().await, 1);
        assert!(h.engine.get_state().await.operation(&second.id).is_some());

        h.transport.set_send_delay(None).await;
        let next = h.engine.sync().await;
        assert_eq!(next.operations_completed, 1);
        assert_eq!(
            h.transport.sent_operations().await,
            vec![first.id, second.id]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_auto_sync_keeps_running_pass() {
        let h = harness(ConflictStrategy::NewestWins).await;
        create(&h.engine, EntityType::DailyLog, "log1", &[]).await;
        h.transport
            .set_send_delay(Some(Duration::from_secs(10)))
            .await;

        h.engine.start_auto_sync().await;
        assert!(h.engine.is_auto_sync_running().await);
        tokio::time::sleep(Duration::from_secs(15 * 60 + 1)).await;
        assert!(h.engine.get_state().await.sync_in_progress);

        h.engine.stop_auto_sync().await;
        assert!(!h.engine.is_auto_sync_running().await);
        tokio::time::sleep(Duration::from_secs(60)).await;

        let state = h.engine.get_state().await;
        assert!(!state.sync_in_progress);
        assert_eq!(state.pending_count(), 0);
        assert_eq!(h.transport.send_count(), 1);

        let next = h.engine.sync().await;
        assert!(!next.was_skipped());
        assert!(next.success);
    }

    /// Remote that has always moved on by the time anything arrives.
    struct MovingRemote {
        version: std::sync::atomic::AtomicU64,
    }

    #[async_trait::async_trait]
    impl SyncTransport for MovingRemote {
        fn name(&self) -> &str {
            "moving"
        }

        async fn send(&self, _operation: &PendingOperation) -> Result<SendOutcome> {
            let version = self
                .version
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 1;
            Ok(SendOutcome::Conflict(RemoteSnapshot {
                data: json!({"name": "remote"}),
                version,
                timestamp: Utc::now(),
            }))
        }

        async fn pull(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<crate::transport::RemoteChange>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_repeated_local_wins_conflicts_exhaust_retries() {
        let transport = Arc::new(MovingRemote {
            version: std::sync::atomic::AtomicU64::new(1),
        });
        let engine = SyncEngine::new(transport, Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        engine
            .update_config(SyncConfigUpdate {
                throttle_ms: Some(0),
                max_retries: Some(1),
                conflict_strategy: Some(ConflictStrategy::LocalWins),
                ..Default::default()
            })
            .await
            .unwrap();
        let op = engine
            .enqueue(
                OperationKind::Update,
                EntityType::Project,
                id("p1"),
                json!({"name": "local"}),
                [],
            )
            .await
            .unwrap();

        let first = engine.sync().await;
        assert_eq!(first.conflicts_resolved, 1);
        assert!(first.errors[0].recoverable);
        let second = engine.sync().await;
        assert!(!second.errors[0].recoverable);

        for _ in 0..8 {
            assert_eq!(engine.sync().await.operations_attempted, 0);
        }

        let stalled = engine.stalled_operations().await;
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, op.id);
        assert_eq!(stalled[0].attempts, 2);
        assert_eq!(engine.conflict_history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_manual_keep_local_gets_fresh_retries() {
        let h = harness(ConflictStrategy::Manual).await;
        h.transport
            .seed_remote(EntityType::Project, id("p1"), json!({"name": "server"}), 2, Utc::now())
            .await;
        let op = create(&h.engine, EntityType::Project, "p1", &[]).await;
        h.transport.fail_next(1);
        h.engine.sync().await;
        assert_eq!(h.engine.get_state().await.operation(&op.id).unwrap().attempts, 1);

        h.engine.sync().await;
        let conflict = h.engine.conflicts().await.remove(0);
        h.engine
            .resolve_conflict_manually(&conflict.id, true)
            .await
            .unwrap();

        let queued = h.engine.get_state().await.operation(&op.id).cloned().unwrap();
        assert_eq!(queued.attempts, 0);
        assert_eq!(queued.server_version, Some(2));
        assert_eq!(h.engine.sync().await.operations_completed, 1);
    }

    #[tokio::test]
    async fn test_discard_releases_held_back_remote_change() {
        let h = harness(ConflictStrategy::Manual).await;
        h.transport.set_offline(true);
        let op = create(&h.engine, EntityType::Project, "p1", &[]).await;
        h.engine.sync().await;

        h.transport.set_offline(false);
        h.transport
            .seed_remote(EntityType::Project, id("p1"), json!({"name": "x"}), 1, Utc::now())
            .await;
        h.transport.fail_next(1);
        assert_eq!(h.engine.sync().await.changes_pulled, 0);

        h.engine.discard_operation(&op.id).await.unwrap();
        let result = h.engine.sync().await;
        assert_eq!(result.changes_pulled, 1);
        assert_eq!(h.applier.get(&id("p1")).await, Some(json!({"name": "x"})));
        assert_eq!(
            h.engine.manifest().await.confirmed_version(&id("p1")),
            Some(1)
        );

        // Settled changes are not applied twice.
        assert_eq!(h.engine.sync().await.changes_pulled, 0);
    }

    #[tokio::test]
    async fn test_pull_applies_remote_delete() {
        let h = harness(ConflictStrategy::NewestWins).await;
        h.transport
            .seed_remote(
                EntityType::Report,
                id("r1"),
                json!({"title": "Weekly"}),
                3,
                Utc::now() - chrono::Duration::seconds(2),
            )
            .await;
        assert_eq!(h.engine.sync().await.changes_pulled, 1);

        assert!(h.transport.remove_remote(&id("r1"), Utc::now()).await);
        let result = h.engine.sync().await;
        assert_eq!(result.changes_pulled, 1);
        assert_eq!(h.applier.get(&id("r1")).await, None);

        let manifest = h.engine.manifest().await;
        let entry = manifest.get(&id("r1")).unwrap();
        assert_eq!(entry.confirmed_version, Some(4));
        assert_eq!(entry.entity_type, EntityType::Report);
    }
}

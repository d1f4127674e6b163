//! FieldSync offline-first sync engine.
//!
//! This crate queues local mutations while a device is disconnected and
//! reconciles them with a remote authority once it is reachable again:
//! - Pending-operation queue with per-entity versions and dependencies
//! - Conflict detection with pluggable resolution strategies
//! - Retry with exponential backoff and a stalled state for exhausted work
//! - Connectivity tracking, periodic sync and change notifications

pub mod applier;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod events;
pub mod manifest;
pub mod operation;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod transport;

// Re-export main types
pub use applier::{ChangeApplier, MemoryApplier, NoopApplier};
pub use config::{SyncConfig, SyncConfigUpdate};
pub use conflict::{
    ConflictResolver, ConflictStrategy, Resolution, ResolutionStrategy, SyncConflict,
    VersionedData,
};
pub use connectivity::{ConnectivityMonitor, ManualReachability, Reachability};
pub use engine::{SyncEngine, WeakSyncEngine};
pub use events::{Subscription, SyncEvent};
pub use manifest::{EntityManifest, ManifestEntry, ModifiedBy};
pub use operation::PendingOperation;
pub use queue::{select_eligible, DependencyResolver};
pub use retry::RetryPolicy;
pub use state::{OperationError, SyncEngineState, SyncResult};
pub use transport::{MemoryTransport, RemoteChange, RemoteSnapshot, SendOutcome, SyncTransport};

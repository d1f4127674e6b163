//! Durable key-value storage for FieldSync.
//!
//! The sync engine persists its queue, version manifest and configuration as
//! opaque string blobs under stable keys. This module provides the trait those
//! blobs are written through and two backends:
//! - [`MemoryStore`]: process-local, for tests and ephemeral sessions
//! - [`LocalStore`]: one file per key inside a directory
//!
//! # Design Principles
//! - Backend isolation: the engine never sees where a blob lives
//! - Async operations: all I/O is async
//! - Unified error semantics: failures surface as `Error::Storage` or `Error::Io`

pub mod local;
pub mod memory;
pub mod store;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use store::{validate_key, KeyValueStore};

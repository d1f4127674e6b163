//! Key-value store trait definition.

use async_trait::async_trait;

use fieldsync_common::{Error, Result};

/// Durable string-keyed blob store.
///
/// Implementations must make `set` durable before returning; the engine treats
/// a completed `set` as the commit point for a state transition.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read the blob stored under `key`.
    ///
    /// Returns `Ok(None)` when nothing has been written under the key yet.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous blob.
    ///
    /// # Errors
    /// - Invalid key
    /// - Backend I/O failure
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove the blob under `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Check that a key is usable by every backend.
///
/// Keys are restricted to ASCII alphanumerics plus `.`, `_` and `-` so they
/// map directly onto file names.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput("Storage key cannot be empty".to_string()));
    }
    if key.starts_with('.') {
        return Err(Error::InvalidInput(format!(
            "Storage key cannot start with '.': {}",
            key
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::InvalidInput(format!("Invalid storage key: {}", key)));
    }
    Ok(())
}

//! Durable key/value store trait definition.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use skysync_common::{Error, Result};

/// Persisted key layout. Each component owns its key or prefix exclusively.
pub mod keys {
    /// Merged preferences document.
    pub const USER_PREFERENCES: &str = "user_preferences";
    /// Read/unread map.
    pub const READ_STATES: &str = "read_states";
    /// Pending offline actions.
    pub const OFFLINE_QUEUE: &str = "offline_queue";
    /// Prefix for TTL cache records.
    pub const CACHE_PREFIX: &str = "cache_";

    /// Durable key for a cache entry.
    pub fn cache_key(key: &str) -> String {
        format!("{}{}", CACHE_PREFIX, key)
    }
}

/// Durable string key/value storage.
///
/// Values are opaque strings; callers serialize JSON into them. Implementations
/// must be safe to share across tasks.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Get the store name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read a value. Returns `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Delete a value. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List every key currently stored.
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Read several values at once, preserving the order of `keys`.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<String>)>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push((key.clone(), self.get(key).await?));
        }
        Ok(results)
    }

    /// Delete several keys at once.
    async fn multi_remove(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}

/// JSON helpers layered over any [`DurableStore`].
#[async_trait]
pub trait JsonStoreExt: DurableStore {
    /// Load and parse a JSON value.
    ///
    /// # Errors
    /// - `Serialization` if the stored record does not parse as `T`
    async fn load_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::Serialization(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    /// Serialize and store a JSON value.
    async fn save_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, raw).await
    }
}

impl<S: DurableStore + ?Sized> JsonStoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_prefix() {
        assert_eq!(keys::cache_key("feed"), "cache_feed");
    }
}

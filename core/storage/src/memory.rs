//! In-memory durable store for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::store::DurableStore;
use skysync_common::{Error, Result};

/// In-memory store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    storage: Arc<RwLock<BTreeMap<String, String>>>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `set` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read a raw value without going through the async trait.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.storage
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Insert a raw value, bypassing failure injection.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.storage
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("write rejected: {}", key)));
        }
        self.storage
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.storage
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<String>)>> {
        let storage = self.storage.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys
            .iter()
            .map(|k| (k.clone(), storage.get(k).cloned()))
            .collect())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<()> {
        let mut storage = self.storage.write().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            storage.remove(key);
        }
        Ok(())
    }
}

//! Two-tier TTL cache: an in-memory map in front of the durable store.
//!
//! Expiry is lazy. An expired entry is only dropped when a read touches it
//! (or when [`TtlCache::purge_expired`] is called explicitly).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use skysync_common::{Clock, Result};
use skysync_storage::{keys, DurableStore};

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub expiry_timestamp: Option<DateTime<Utc>>,
    pub inserted_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    /// Whether the entry is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry_timestamp, Some(expiry) if now > expiry)
    }
}

/// Durable form of a cache entry. Timestamps are epoch milliseconds.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheRecord<V> {
    value: V,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry: Option<i64>,
    inserted_at: i64,
}

impl<V> CacheRecord<V> {
    fn into_entry(self, key: &str) -> CacheEntry<V> {
        CacheEntry {
            key: key.to_string(),
            value: self.value,
            expiry_timestamp: self.expiry.and_then(DateTime::from_timestamp_millis),
            inserted_at: DateTime::from_timestamp_millis(self.inserted_at).unwrap_or_default(),
        }
    }
}

/// Key/value cache with optional per-entry TTL.
///
/// Keys are stored durably under `cache_<key>`.
pub struct TtlCache<V = serde_json::Value> {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    memory: Mutex<HashMap<String, CacheEntry<V>>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> TtlCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            memory: Mutex::new(HashMap::new()),
            _value: PhantomData,
        }
    }

    /// Store `value`. Without a `ttl` the entry never expires, and neither
    /// does one whose expiry falls outside the representable date range.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now();
        let expiry = ttl.and_then(|ttl| {
            ChronoDuration::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
        });

        let record = CacheRecord {
            value: &value,
            expiry: expiry.map(|e| e.timestamp_millis()),
            inserted_at: now.timestamp_millis(),
        };
        let raw = serde_json::to_string(&record)?;

        self.lock_memory().insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                expiry_timestamp: expiry,
                inserted_at: now,
            },
        );

        self.store.set(&keys::cache_key(key), raw).await
    }

    /// Read a value, rehydrating from the durable store on a memory miss.
    ///
    /// Expired and corrupt records are deleted and reported as absent.
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value))
    }

    /// Like [`TtlCache::get`] but returns the full entry.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        let now = self.clock.now();

        let cached = self.lock_memory().get(key).cloned();
        if let Some(entry) = cached {
            if entry.is_expired(now) {
                debug!("Cache entry {} expired", key);
                self.remove(key).await?;
                return Ok(None);
            }
            return Ok(Some(entry));
        }

        let durable_key = keys::cache_key(key);
        let Some(raw) = self.store.get(&durable_key).await? else {
            return Ok(None);
        };

        let entry = match serde_json::from_str::<CacheRecord<V>>(&raw) {
            Ok(record) => record.into_entry(key),
            Err(e) => {
                warn!("Dropping corrupt cache record {}: {}", key, e);
                self.store.remove(&durable_key).await?;
                return Ok(None);
            }
        };

        if entry.is_expired(now) {
            debug!("Durable cache entry {} expired", key);
            self.store.remove(&durable_key).await?;
            return Ok(None);
        }

        // A `set` that landed while the store was being read wins.
        let entry = self
            .lock_memory()
            .entry(key.to_string())
            .or_insert(entry)
            .clone();
        Ok(Some(entry))
    }

    /// Whether a live value exists for `key`.
    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get_entry(key).await?.is_some())
    }

    /// Remove `key` from both tiers.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.lock_memory().remove(key);
        self.store.remove(&keys::cache_key(key)).await
    }

    /// Keys currently held in memory, expired or not.
    pub fn keys(&self) -> Vec<String> {
        self.lock_memory().keys().cloned().collect()
    }

    /// Remove every cache entry from memory and the durable store.
    ///
    /// Durable records that were never loaded into memory are found through
    /// the store's key listing.
    pub async fn clear(&self) -> Result<()> {
        let mut durable_keys: Vec<String> = self
            .lock_memory()
            .drain()
            .map(|(key, _)| keys::cache_key(&key))
            .collect();

        for key in self.store.list_keys().await? {
            if key.starts_with(keys::CACHE_PREFIX) && !durable_keys.contains(&key) {
                durable_keys.push(key);
            }
        }

        debug!("Clearing {} cache records", durable_keys.len());
        self.store.multi_remove(&durable_keys).await
    }

    /// Sweep both tiers for expired or corrupt entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();

        let durable_keys: Vec<String> = self
            .store
            .list_keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(keys::CACHE_PREFIX))
            .collect();

        let mut stale = Vec::new();
        for (durable_key, raw) in self.store.multi_get(&durable_keys).await? {
            let Some(raw) = raw else { continue };
            let expired = match serde_json::from_str::<CacheRecord<serde_json::Value>>(&raw) {
                Ok(record) => matches!(record.expiry, Some(e) if now.timestamp_millis() > e),
                Err(_) => true,
            };
            if expired {
                stale.push(durable_key);
            }
        }

        {
            let mut memory = self.lock_memory();
            memory.retain(|key, entry| {
                !entry.is_expired(now) && !stale.contains(&keys::cache_key(key))
            });
        }

        if !stale.is_empty() {
            self.store.multi_remove(&stale).await?;
        }
        Ok(stale.len())
    }

    fn lock_memory(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }
}

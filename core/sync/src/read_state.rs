//! Read/unread tracking with a debounced bulk flush to the remote.

use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use skysync_common::{Error, Result};
use skysync_storage::{keys, DurableStore, JsonStoreExt};

use crate::debounce::Debouncer;
use crate::remote::{ReadStateUpdate, RemoteApi};

/// Quiet period before dirty markers are flushed.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, Default)]
struct ReadStates {
    states: HashMap<String, bool>,
    /// Identifiers changed since the last flush.
    dirty: HashSet<String>,
}

struct Shared {
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteApi>,
    states: Mutex<ReadStates>,
    /// Serializes durable writes.
    writer: tokio::sync::Mutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ReadStates> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write the full map. The snapshot is taken after acquiring the writer,
    /// so a later write always carries state at least as new as an earlier one.
    async fn persist(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let snapshot: BTreeMap<String, bool> = self
            .lock()
            .states
            .iter()
            .map(|(uri, read)| (uri.clone(), *read))
            .collect();
        self.store.save_json(keys::READ_STATES, &snapshot).await
    }

    /// Send dirty markers to the remote. The dirty set is cleared whether or
    /// not the remote accepts them.
    async fn flush(&self) -> Result<usize> {
        let mut entries: Vec<ReadStateUpdate> = {
            let mut guard = self.lock();
            let ReadStates { states, dirty } = &mut *guard;
            dirty
                .drain()
                .map(|uri| {
                    let read = states.get(&uri).copied().unwrap_or(false);
                    ReadStateUpdate { uri, read }
                })
                .collect()
        };

        if entries.is_empty() {
            return Ok(0);
        }
        entries.sort_by(|a, b| a.uri.cmp(&b.uri));

        match self.remote.sync_read_states(&entries).await {
            Ok(()) => {
                debug!("Flushed {} read markers", entries.len());
                Ok(entries.len())
            }
            Err(e) => {
                warn!("Read marker flush failed, {} markers dropped: {}", entries.len(), e);
                Err(e)
            }
        }
    }
}

/// Tracks which posts the user has read.
///
/// Marks apply to memory immediately, then the whole map is persisted and a
/// debounced flush is (re)scheduled.
pub struct ReadStateSynchronizer {
    shared: Arc<Shared>,
    flusher: Debouncer,
}

impl ReadStateSynchronizer {
    /// Load persisted read state.
    ///
    /// A corrupt record yields an empty map.
    ///
    /// # Errors
    /// - Store read failure
    pub async fn load(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteApi>,
        flush_delay: Duration,
    ) -> Result<Self> {
        let states = match store.load_json::<HashMap<String, bool>>(keys::READ_STATES).await {
            Ok(states) => states.unwrap_or_default(),
            Err(Error::Serialization(e)) => {
                warn!("Discarding corrupt read state: {}", e);
                HashMap::new()
            }
            Err(e) => return Err(e),
        };

        debug!("Loaded {} read markers", states.len());

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                remote,
                states: Mutex::new(ReadStates {
                    states,
                    dirty: HashSet::new(),
                }),
                writer: tokio::sync::Mutex::new(()),
            }),
            flusher: Debouncer::new(flush_delay),
        })
    }

    pub async fn mark_as_read(&self, post_uri: &str) -> Result<()> {
        self.mark(vec![(post_uri.to_string(), true)]).await
    }

    pub async fn mark_as_unread(&self, post_uri: &str) -> Result<()> {
        self.mark(vec![(post_uri.to_string(), false)]).await
    }

    /// Mark several posts read with a single persist.
    pub async fn mark_many_as_read<S: AsRef<str>>(&self, post_uris: &[S]) -> Result<()> {
        let updates = post_uris
            .iter()
            .map(|uri| (uri.as_ref().to_string(), true))
            .collect();
        self.mark(updates).await
    }

    /// In-memory lookup; unknown posts are unread.
    pub fn is_read(&self, post_uri: &str) -> bool {
        self.shared
            .lock()
            .states
            .get(post_uri)
            .copied()
            .unwrap_or(false)
    }

    /// Number of markers waiting for the next flush.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().dirty.len()
    }

    /// Whether a debounced flush is scheduled.
    pub fn flush_scheduled(&self) -> bool {
        self.flusher.is_pending()
    }

    /// Cancel the pending timer and flush immediately. Returns how many
    /// markers were sent.
    pub async fn flush_now(&self) -> Result<usize> {
        self.flusher.cancel();
        self.shared.flush().await
    }

    /// Apply updates in memory, persist, then reschedule the flush.
    ///
    /// The in-memory change stands even if persisting fails.
    async fn mark(&self, updates: Vec<(String, bool)>) -> Result<()> {
        {
            let mut guard = self.shared.lock();
            for (uri, read) in updates {
                guard.states.insert(uri.clone(), read);
                guard.dirty.insert(uri);
            }
        }

        let persisted = self.shared.persist().await;
        if let Err(e) = &persisted {
            warn!("Persisting read state failed: {}", e);
        }

        self.schedule_flush();
        persisted
    }

    fn schedule_flush(&self) {
        let shared = self.shared.clone();
        self.flusher.schedule(
            async move {
                // failures are logged inside flush
                let _ = shared.flush().await;
            }
            .boxed(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_remote::{MemoryRemote, RemoteCall, RemoteOp};
    use skysync_storage::MemoryStore;
    use tokio::time::sleep;

    async fn setup() -> (MemoryStore, Arc<MemoryRemote>, ReadStateSynchronizer) {
        let store = MemoryStore::new();
        let remote = Arc::new(MemoryRemote::new());
        let sync = ReadStateSynchronizer::load(
            Arc::new(store.clone()),
            remote.clone(),
            DEFAULT_FLUSH_DELAY,
        )
        .await
        .unwrap();
        (store, remote, sync)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_state_round_trip() {
        let (store, remote, sync) = setup().await;

        sync.mark_as_read("at://x").await.unwrap();
        assert!(sync.is_read("at://x"));

        sync.mark_as_unread("at://x").await.unwrap();
        assert!(!sync.is_read("at://x"));

        sync.mark_as_read("at://x").await.unwrap();
        let reloaded = ReadStateSynchronizer::load(Arc::new(store), remote, DEFAULT_FLUSH_DELAY)
            .await
            .unwrap();
        assert!(reloaded.is_read("at://x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_post_is_unread() {
        let (_store, _remote, sync) = setup().await;
        assert!(!sync.is_read("at://never-seen"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_mark_rewrites_full_map() {
        let (store, _remote, sync) = setup().await;
        sync.mark_as_read("at://a").await.unwrap();
        sync.mark_as_read("at://b").await.unwrap();

        assert_eq!(store.write_count(), 2);
        let persisted: HashMap<String, bool> =
            serde_json::from_str(&store.raw(keys::READ_STATES).unwrap()).unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_flush_sends_dirty_once() {
        let (_store, remote, sync) = setup().await;

        sync.mark_as_read("at://a").await.unwrap();
        sleep(Duration::from_millis(1500)).await;
        sync.mark_as_read("at://b").await.unwrap();
        sync.mark_as_unread("at://a").await.unwrap();
        assert_eq!(sync.pending_count(), 2);
        assert!(sync.flush_scheduled());

        sleep(Duration::from_millis(1999)).await;
        assert_eq!(remote.call_count(RemoteOp::SyncReadStates), 0);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(sync.pending_count(), 0);
        assert_eq!(
            remote.calls(),
            vec![RemoteCall::SyncReadStates(vec![
                ReadStateUpdate {
                    uri: "at://a".to_string(),
                    read: false
                },
                ReadStateUpdate {
                    uri: "at://b".to_string(),
                    read: true
                },
            ])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_still_clears_dirty() {
        let (_store, remote, sync) = setup().await;
        remote.fail(RemoteOp::SyncReadStates);

        sync.mark_as_read("at://a").await.unwrap();
        sleep(Duration::from_millis(2100)).await;

        assert_eq!(remote.call_count(RemoteOp::SyncReadStates), 1);
        assert_eq!(sync.pending_count(), 0);
        assert!(sync.is_read("at://a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_cancels_timer() {
        let (_store, remote, sync) = setup().await;
        sync.mark_many_as_read(&["at://a", "at://b", "at://c"]).await.unwrap();

        assert_eq!(sync.flush_now().await.unwrap(), 3);
        assert!(!sync.flush_scheduled());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(remote.call_count(RemoteOp::SyncReadStates), 1);
        assert_eq!(sync.flush_now().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_marks_persist_latest_state() {
        let (store, remote, sync) = setup().await;

        let (a, b) = tokio::join!(sync.mark_as_read("at://a"), sync.mark_as_read("at://b"));
        a.unwrap();
        b.unwrap();

        let reloaded = ReadStateSynchronizer::load(Arc::new(store), remote, DEFAULT_FLUSH_DELAY)
            .await
            .unwrap();
        assert!(reloaded.is_read("at://a"));
        assert!(reloaded.is_read("at://b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_persisted_map_loads_empty() {
        let store = MemoryStore::new();
        store.insert_raw(keys::READ_STATES, "[not a map");
        let sync = ReadStateSynchronizer::load(
            Arc::new(store),
            Arc::new(MemoryRemote::new()),
            DEFAULT_FLUSH_DELAY,
        )
        .await
        .unwrap();
        assert!(!sync.is_read("at://x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_failure_keeps_memory_state() {
        let (store, _remote, sync) = setup().await;
        store.fail_writes(true);

        assert!(sync.mark_as_read("at://x").await.is_err());
        assert!(sync.is_read("at://x"));
        assert_eq!(sync.pending_count(), 1);
    }
}

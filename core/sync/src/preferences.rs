//! Preferences synchronization: one-shot, single-flight merge of the local and
//! remote preferences documents.
//!
//! Merging is a shallow last-writer-wins union: on key collision the remote
//! value replaces the local one, and `lastModified` never moves backwards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use skysync_common::{Clock, Error, Result};
use skysync_storage::{keys, DurableStore, JsonStoreExt};

use crate::remote::RemoteApi;
use crate::state::{SyncOptions, SyncResult};

/// User preferences: an opaque field map plus a modification timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferencesDocument {
    /// Preference fields, opaque to the sync layer.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "lastModified", default)]
    pub last_modified: i64,
}

impl PreferencesDocument {
    pub fn new(fields: Map<String, Value>, last_modified: i64) -> Self {
        Self {
            fields,
            last_modified,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.last_modified == 0
    }

    /// Canonical serialized form used for change detection.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Merge `remote` over `local`.
///
/// Remote fields override local ones on collision; fields present on one side
/// only are kept. `last_modified` is the max of both sides.
pub fn merge(local: &PreferencesDocument, remote: &PreferencesDocument) -> PreferencesDocument {
    let mut fields = local.fields.clone();
    for (key, value) in &remote.fields {
        fields.insert(key.clone(), value.clone());
    }

    PreferencesDocument {
        fields,
        last_modified: local.last_modified.max(remote.last_modified),
    }
}

/// Result of a completed preferences sync.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Document now stored locally.
    pub merged: PreferencesDocument,
    /// Whether the merged document was uploaded.
    pub uploaded: bool,
}

/// Counts in-flight syncs; released on drop.
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(counter: &'a AtomicUsize, force: bool) -> Option<Self> {
        if force {
            counter.fetch_add(1, Ordering::SeqCst);
        } else {
            counter
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .ok()?;
        }
        Some(Self { counter })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Merges local and remote preferences.
pub struct PreferencesSynchronizer {
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    in_flight: AtomicUsize,
    /// Set while the persisted merge has not been confirmed by the remote.
    upload_pending: AtomicBool,
}

impl PreferencesSynchronizer {
    pub fn new(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            in_flight: AtomicUsize::new(0),
            upload_pending: AtomicBool::new(false),
        }
    }

    /// Whether a sync is currently running.
    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Run one sync and report it as a [`SyncResult`].
    ///
    /// A second call while one is running returns immediately with
    /// `"Sync already in progress"` unless `options.force` is set.
    pub async fn sync_preferences(&self, options: &SyncOptions) -> SyncResult<PreferencesDocument> {
        let result = self.try_sync(options).await.map(|outcome| outcome.merged);
        SyncResult::from_result(result, self.clock.now())
    }

    /// Run one sync, returning errors instead of folding them into a result.
    ///
    /// # Errors
    /// - `SyncInProgress` when another sync is running and `force` is unset
    /// - Store failures while loading or persisting
    /// - Remote failures while uploading (the local document stays updated
    ///   and the next sync uploads it again)
    pub async fn try_sync(&self, options: &SyncOptions) -> Result<MergeOutcome> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, options.force) else {
            debug!("Preferences sync skipped, another sync is running");
            return Err(Error::SyncInProgress);
        };

        info!("Starting preferences sync (force: {})", options.force);

        let local = self.load_local().await?;

        let remote = match self.remote.get_preferences().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Fetching remote preferences failed, merging against empty: {}", e);
                PreferencesDocument::default()
            }
        };

        let merged = merge(&local, &remote);
        self.store.save_json(keys::USER_PREFERENCES, &merged).await?;

        let changed = merged.to_json()? != local.to_json()?;
        let retrying = self.upload_pending.load(Ordering::SeqCst);
        let uploaded = changed || retrying;
        if uploaded {
            debug!(changed, retrying, "Uploading merged preferences");
            self.upload_pending.store(true, Ordering::SeqCst);
            self.remote.put_preferences(&merged).await?;
            self.upload_pending.store(false, Ordering::SeqCst);
        }

        info!(
            "Preferences sync completed ({} fields, uploaded: {})",
            merged.fields.len(),
            uploaded
        );

        Ok(MergeOutcome { merged, uploaded })
    }

    /// Load the locally persisted document.
    ///
    /// Absent or unparseable records yield an empty document.
    pub async fn load_local(&self) -> Result<PreferencesDocument> {
        match self
            .store
            .load_json::<PreferencesDocument>(keys::USER_PREFERENCES)
            .await
        {
            Ok(doc) => Ok(doc.unwrap_or_default()),
            Err(Error::Serialization(e)) => {
                warn!("Discarding corrupt local preferences: {}", e);
                Ok(PreferencesDocument::default())
            }
            Err(e) => Err(e),
        }
    }
}

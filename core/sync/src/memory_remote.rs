//! In-memory remote API for testing.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::watch;

use skysync_common::{Error, Result};

use crate::preferences::PreferencesDocument;
use crate::remote::{ReadStateUpdate, RemoteApi};

/// Remote operation selector used for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    GetPreferences,
    PutPreferences,
    Like,
    DeleteLike,
    Repost,
    DeleteRepost,
    Follow,
    DeleteFollow,
    SyncReadStates,
}

/// A recorded remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    GetPreferences,
    PutPreferences(PreferencesDocument),
    Like { uri: String, cid: String },
    DeleteLike { like_uri: String },
    Repost { uri: String, cid: String },
    DeleteRepost { repost_uri: String },
    Follow { did: String },
    DeleteFollow { follow_uri: String },
    SyncReadStates(Vec<ReadStateUpdate>),
}

impl RemoteCall {
    pub fn op(&self) -> RemoteOp {
        match self {
            RemoteCall::GetPreferences => RemoteOp::GetPreferences,
            RemoteCall::PutPreferences(_) => RemoteOp::PutPreferences,
            RemoteCall::Like { .. } => RemoteOp::Like,
            RemoteCall::DeleteLike { .. } => RemoteOp::DeleteLike,
            RemoteCall::Repost { .. } => RemoteOp::Repost,
            RemoteCall::DeleteRepost { .. } => RemoteOp::DeleteRepost,
            RemoteCall::Follow { .. } => RemoteOp::Follow,
            RemoteCall::DeleteFollow { .. } => RemoteOp::DeleteFollow,
            RemoteCall::SyncReadStates(_) => RemoteOp::SyncReadStates,
        }
    }
}

/// In-memory remote.
///
/// Holds a preferences document, records every call (including failed ones),
/// fails any operation marked with [`MemoryRemote::fail`] and can hold calls
/// pending to exercise overlapping requests.
pub struct MemoryRemote {
    preferences: Mutex<PreferencesDocument>,
    calls: Mutex<Vec<RemoteCall>>,
    failing: Mutex<HashSet<RemoteOp>>,
    held: watch::Sender<HashSet<RemoteOp>>,
}

impl MemoryRemote {
    /// Create a remote with an empty preferences document.
    pub fn new() -> Self {
        Self::with_preferences(PreferencesDocument::default())
    }

    /// Create a remote serving `preferences`.
    pub fn with_preferences(preferences: PreferencesDocument) -> Self {
        let (held, _rx) = watch::channel(HashSet::new());
        Self {
            preferences: Mutex::new(preferences),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            held,
        }
    }

    /// Make `op` fail with a remote error until [`MemoryRemote::succeed`].
    pub fn fail(&self, op: RemoteOp) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).insert(op);
    }

    /// Stop failing `op`.
    pub fn succeed(&self, op: RemoteOp) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).remove(&op);
    }

    /// Keep calls to `op` pending until [`MemoryRemote::release`]. Held calls
    /// are recorded as soon as they start.
    pub fn hold(&self, op: RemoteOp) {
        self.held.send_modify(|held| {
            held.insert(op);
        });
    }

    /// Let pending and future calls to `op` complete.
    pub fn release(&self, op: RemoteOp) {
        self.held.send_modify(|held| {
            held.remove(&op);
        });
    }

    /// Current server-side preferences.
    pub fn preferences(&self) -> PreferencesDocument {
        self.preferences.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace server-side preferences.
    pub fn set_preferences(&self, preferences: PreferencesDocument) {
        *self.preferences.lock().unwrap_or_else(|e| e.into_inner()) = preferences;
    }

    /// Every call in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of calls to `op`.
    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.op() == op)
            .count()
    }

    async fn record(&self, call: RemoteCall) -> Result<()> {
        let op = call.op();
        let mut gate = self.held.subscribe();
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
        gate.wait_for(|held| !held.contains(&op))
            .await
            .map_err(|_| Error::Remote("remote dropped".to_string()))?;
        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(&op) {
            return Err(Error::Remote(format!("{:?} failed", op)));
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn get_preferences(&self) -> Result<PreferencesDocument> {
        self.record(RemoteCall::GetPreferences).await?;
        Ok(self.preferences())
    }

    async fn put_preferences(&self, preferences: &PreferencesDocument) -> Result<()> {
        self.record(RemoteCall::PutPreferences(preferences.clone())).await?;
        self.set_preferences(preferences.clone());
        Ok(())
    }

    async fn like(&self, uri: &str, cid: &str) -> Result<()> {
        self.record(RemoteCall::Like {
            uri: uri.to_string(),
            cid: cid.to_string(),
        })
        .await
    }

    async fn delete_like(&self, like_uri: &str) -> Result<()> {
        self.record(RemoteCall::DeleteLike {
            like_uri: like_uri.to_string(),
        })
        .await
    }

    async fn repost(&self, uri: &str, cid: &str) -> Result<()> {
        self.record(RemoteCall::Repost {
            uri: uri.to_string(),
            cid: cid.to_string(),
        })
        .await
    }

    async fn delete_repost(&self, repost_uri: &str) -> Result<()> {
        self.record(RemoteCall::DeleteRepost {
            repost_uri: repost_uri.to_string(),
        })
        .await
    }

    async fn follow(&self, did: &str) -> Result<()> {
        self.record(RemoteCall::Follow {
            did: did.to_string(),
        })
        .await
    }

    async fn delete_follow(&self, follow_uri: &str) -> Result<()> {
        self.record(RemoteCall::DeleteFollow {
            follow_uri: follow_uri.to_string(),
        })
        .await
    }

    async fn sync_read_states(&self, entries: &[ReadStateUpdate]) -> Result<()> {
        self.record(RemoteCall::SyncReadStates(entries.to_vec())).await
    }
}

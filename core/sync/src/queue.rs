//! Durable FIFO queue of mutating actions performed while offline.
//!
//! Actions move `Queued -> Executing -> Completed` (dropped) or back to
//! `Queued` at the tail on failure. Delivery is at-least-once: an action whose
//! response was lost may be replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use skysync_common::{ActionId, Clock, Error, Result};
use skysync_storage::{keys, DurableStore, JsonStoreExt};

use crate::connectivity::ConnectivityMonitor;
use crate::remote::RemoteApi;

/// A mutating action and its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum OfflineAction {
    Like { uri: String, cid: String },
    Unlike { like_uri: String },
    Repost { uri: String, cid: String },
    Unrepost { repost_uri: String },
    Follow { did: String },
    Unfollow { follow_uri: String },
}

impl OfflineAction {
    /// Wire name of the action type.
    pub fn kind(&self) -> &'static str {
        match self {
            OfflineAction::Like { .. } => "like",
            OfflineAction::Unlike { .. } => "unlike",
            OfflineAction::Repost { .. } => "repost",
            OfflineAction::Unrepost { .. } => "unrepost",
            OfflineAction::Follow { .. } => "follow",
            OfflineAction::Unfollow { .. } => "unfollow",
        }
    }

    /// Perform the action against the remote.
    pub async fn execute(&self, remote: &dyn RemoteApi) -> Result<()> {
        match self {
            OfflineAction::Like { uri, cid } => remote.like(uri, cid).await,
            OfflineAction::Unlike { like_uri } => remote.delete_like(like_uri).await,
            OfflineAction::Repost { uri, cid } => remote.repost(uri, cid).await,
            OfflineAction::Unrepost { repost_uri } => remote.delete_repost(repost_uri).await,
            OfflineAction::Follow { did } => remote.follow(did).await,
            OfflineAction::Unfollow { follow_uri } => remote.delete_follow(follow_uri).await,
        }
    }
}

/// An action waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: ActionId,
    #[serde(flatten)]
    pub action: OfflineAction,
    pub enqueued_at: DateTime<Utc>,
}

/// Counters for one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Actions attempted.
    pub attempted: usize,
    /// Actions the remote accepted.
    pub succeeded: usize,
    /// Actions re-appended after failing.
    pub requeued: Vec<ActionId>,
    /// Actions left in the queue after the pass.
    pub remaining: usize,
}

/// What a call to [`OfflineActionQueue::process_queue`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A pass ran to completion.
    Processed(ProcessReport),
    /// Another pass was already running; nothing was touched.
    AlreadyRunning,
    /// The connectivity monitor reported offline; nothing was touched.
    Offline,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Waiting actions, oldest first.
    queued: VecDeque<QueuedAction>,
    /// Snapshot taken by the running pass that has not executed yet.
    executing: VecDeque<QueuedAction>,
}

impl QueueState {
    fn snapshot(&self) -> Vec<QueuedAction> {
        self.executing
            .iter()
            .chain(self.queued.iter())
            .cloned()
            .collect()
    }
}

/// Durable queue of pending actions, replayed on demand.
pub struct OfflineActionQueue {
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    /// Serializes durable writes.
    writer: tokio::sync::Mutex<()>,
    /// Held for the duration of a processing pass.
    processing: tokio::sync::Mutex<()>,
}

impl OfflineActionQueue {
    /// Load the persisted queue.
    ///
    /// A corrupt record yields an empty queue.
    ///
    /// # Errors
    /// - Store read failure
    pub async fn load(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let queued = match store.load_json::<VecDeque<QueuedAction>>(keys::OFFLINE_QUEUE).await {
            Ok(queued) => queued.unwrap_or_default(),
            Err(Error::Serialization(e)) => {
                warn!("Discarding corrupt offline queue: {}", e);
                VecDeque::new()
            }
            Err(e) => return Err(e),
        };

        if !queued.is_empty() {
            info!("Restored {} queued offline actions", queued.len());
        }

        Ok(Self {
            store,
            remote,
            connectivity,
            clock,
            state: Mutex::new(QueueState {
                queued,
                executing: VecDeque::new(),
            }),
            writer: tokio::sync::Mutex::new(()),
            processing: tokio::sync::Mutex::new(()),
        })
    }

    /// Append an action and persist the queue. When online, a processing pass
    /// runs before this returns.
    ///
    /// # Errors
    /// - Persisting failed. The action stays queued in memory.
    pub async fn queue_action(&self, action: OfflineAction) -> Result<QueuedAction> {
        let queued = QueuedAction {
            id: ActionId::generate(),
            action,
            enqueued_at: self.clock.now(),
        };

        debug!("Queueing {} action {}", queued.action.kind(), queued.id);
        self.lock().queued.push_back(queued.clone());
        self.persist().await?;

        if self.connectivity.is_online() {
            match self.process_queue().await {
                Ok(ProcessOutcome::Processed(report)) if !report.requeued.is_empty() => {
                    debug!("{} actions still pending after pass", report.remaining);
                }
                Ok(_) => {}
                Err(e) => warn!("Processing after enqueue failed: {}", e),
            }
        }

        Ok(queued)
    }

    /// Replay every queued action in order.
    ///
    /// The pass works on a snapshot: actions queued meanwhile wait for the next
    /// pass, and failed actions go to the back of the live queue. A second call
    /// while a pass is running returns [`ProcessOutcome::AlreadyRunning`].
    ///
    /// # Errors
    /// - Persisting the resulting queue failed
    pub async fn process_queue(&self) -> Result<ProcessOutcome> {
        if !self.connectivity.is_online() {
            debug!("Skipping offline queue processing while offline");
            return Ok(ProcessOutcome::Offline);
        }

        let Ok(_running) = self.processing.try_lock() else {
            debug!("Offline queue pass already running");
            return Ok(ProcessOutcome::AlreadyRunning);
        };

        let attempted = {
            let mut state = self.lock();
            let QueueState { queued, executing } = &mut *state;
            executing.extend(queued.drain(..));
            executing.len()
        };

        let mut report = ProcessReport {
            attempted,
            ..ProcessReport::default()
        };

        if attempted == 0 {
            return Ok(ProcessOutcome::Processed(report));
        }

        info!("Processing {} offline actions", attempted);

        loop {
            let next = self.lock().executing.front().cloned();
            let Some(queued) = next else { break };

            let result = queued.action.execute(self.remote.as_ref()).await;

            let mut state = self.lock();
            state.executing.pop_front();
            match result {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!(
                        "Offline {} action {} failed, re-queueing: {}",
                        queued.action.kind(),
                        queued.id,
                        e
                    );
                    report.requeued.push(queued.id.clone());
                    state.queued.push_back(queued);
                }
            }
        }

        report.remaining = self.lock().queued.len();
        self.persist().await?;

        info!(
            "Offline queue pass done: {} succeeded, {} re-queued",
            report.succeeded,
            report.requeued.len()
        );

        Ok(ProcessOutcome::Processed(report))
    }

    /// Pending actions, including any the running pass has not reached yet.
    pub fn pending(&self) -> Vec<QueuedAction> {
        self.lock().snapshot()
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        state.queued.len() + state.executing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every waiting action. Actions of a running pass are unaffected.
    pub async fn clear(&self) -> Result<()> {
        self.lock().queued.clear();
        self.persist().await
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write the queue, not-yet-executed snapshot entries first, so a crash
    /// mid-pass replays them rather than losing them.
    async fn persist(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let snapshot = self.lock().snapshot();
        self.store.save_json(keys::OFFLINE_QUEUE, &snapshot).await
    }
}

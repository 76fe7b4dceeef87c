//! Runs the domain synchronizers one at a time and tracks their status.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use skysync_common::{Clock, Error, Result};
use skysync_storage::DurableStore;

use crate::connectivity::ConnectivityMonitor;
use crate::preferences::PreferencesSynchronizer;
use crate::queue::{OfflineActionQueue, ProcessOutcome};
use crate::read_state::{ReadStateSynchronizer, DEFAULT_FLUSH_DELAY};
use crate::remote::RemoteApi;
use crate::retry::{with_timeout, RetryConfig, RetryExecutor};
use crate::scheduler::SyncMode;
use crate::state::{DomainStatus, SyncOptions, SyncSnapshot};

/// Status keys used by the coordinator.
pub mod domains {
    pub const PREFERENCES: &str = "preferences";
    pub const OFFLINE_QUEUE: &str = "offline_queue";
    pub const READ_STATES: &str = "read_states";
}

/// Configuration for the sync layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period before read markers are flushed.
    pub read_state_flush_delay: Duration,
    /// Retries for a domain task when the caller does not set any.
    pub max_retries: u32,
    pub sync_mode: SyncMode,
    /// Replay the offline queue when connectivity comes back.
    pub process_queue_on_reconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            read_state_flush_delay: DEFAULT_FLUSH_DELAY,
            max_retries: 3,
            sync_mode: SyncMode::Manual,
            process_queue_on_reconnect: true,
        }
    }
}

/// Sets the global flag for as long as it lives.
struct GlobalSync<'a> {
    status: &'a watch::Sender<SyncSnapshot>,
}

impl<'a> GlobalSync<'a> {
    fn begin(status: &'a watch::Sender<SyncSnapshot>) -> Self {
        status.send_modify(|snapshot| snapshot.is_global_sync = true);
        Self { status }
    }
}

impl Drop for GlobalSync<'_> {
    fn drop(&mut self) {
        self.status
            .send_modify(|snapshot| snapshot.is_global_sync = false);
    }
}

/// Sequences preferences sync, offline queue replay and read marker flushes.
///
/// Every task takes the same lock, so no two domain tasks ever overlap.
pub struct SyncCoordinator {
    preferences: Arc<PreferencesSynchronizer>,
    read_state: Arc<ReadStateSynchronizer>,
    queue: Arc<OfflineActionQueue>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    retry: RetryConfig,
    run_lock: Mutex<()>,
    status: watch::Sender<SyncSnapshot>,
}

impl SyncCoordinator {
    pub fn new(
        preferences: Arc<PreferencesSynchronizer>,
        read_state: Arc<ReadStateSynchronizer>,
        queue: Arc<OfflineActionQueue>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let retry = RetryConfig::new(config.max_retries);
        let (status, _) = watch::channel(SyncSnapshot::new());
        Self {
            preferences,
            read_state,
            queue,
            connectivity,
            clock,
            config,
            retry,
            run_lock: Mutex::new(()),
            status,
        }
    }

    /// Load every synchronizer from `store` and wire them together.
    ///
    /// # Errors
    /// - Store read failure while loading read state or the offline queue
    pub async fn build(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Result<Self> {
        let preferences = Arc::new(PreferencesSynchronizer::new(
            store.clone(),
            remote.clone(),
            clock.clone(),
        ));
        let read_state = Arc::new(
            ReadStateSynchronizer::load(
                store.clone(),
                remote.clone(),
                config.read_state_flush_delay,
            )
            .await?,
        );
        let queue = Arc::new(
            OfflineActionQueue::load(store, remote, connectivity.clone(), clock.clone()).await?,
        );

        Ok(Self::new(
            preferences,
            read_state,
            queue,
            connectivity,
            clock,
            config,
        ))
    }

    /// Replace the retry policy around domain tasks. Its `max_retries`
    /// becomes the default budget; `SyncOptions::retries` still overrides it
    /// per call.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.config.max_retries = retry.max_retries;
        self.retry = retry;
        self
    }

    pub fn preferences(&self) -> &Arc<PreferencesSynchronizer> {
        &self.preferences
    }

    pub fn read_state(&self) -> &Arc<ReadStateSynchronizer> {
        &self.read_state
    }

    pub fn queue(&self) -> &Arc<OfflineActionQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Arc<dyn ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Sync preferences, then replay the offline queue.
    ///
    /// A failing domain is recorded in its status and does not stop the
    /// next one. Concurrent calls wait for each other.
    pub async fn sync_all(&self, options: &SyncOptions) -> SyncSnapshot {
        let _run = self.run_lock.lock().await;
        let global = GlobalSync::begin(&self.status);

        info!("Starting sync of all domains");

        self.run_preferences(options).await;
        self.run_offline_queue(options).await;

        drop(global);
        let snapshot = self.snapshot();
        let failed = snapshot.failed_domains();
        if failed.is_empty() {
            info!("Sync of all domains completed");
        } else {
            warn!("Sync completed with failures in: {}", failed.join(", "));
        }
        snapshot
    }

    /// Replay the offline queue on its own.
    pub async fn process_offline_queue(&self) -> DomainStatus {
        let _run = self.run_lock.lock().await;
        let _global = GlobalSync::begin(&self.status);
        self.run_offline_queue(&SyncOptions::default()).await;
        self.get_sync_state(domains::OFFLINE_QUEUE)
    }

    /// Flush pending read markers now.
    ///
    /// Never retried: a failed flush has already dropped its markers.
    pub async fn sync_read_states(&self) -> DomainStatus {
        let _run = self.run_lock.lock().await;
        let _global = GlobalSync::begin(&self.status);

        let read_state = self.read_state.clone();
        let options = SyncOptions::default().with_retries(0);
        self.run_domain(domains::READ_STATES, &options, || {
            let read_state = read_state.clone();
            async move { read_state.flush_now().await.map(|sent| sent > 0) }
        })
        .await;

        self.get_sync_state(domains::READ_STATES)
    }

    /// Last known status of `domain`, idle if it never ran.
    pub fn get_sync_state(&self, domain: &str) -> DomainStatus {
        self.status.borrow().get(domain)
    }

    pub fn is_global_sync(&self) -> bool {
        self.status.borrow().is_global_sync
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.status.subscribe()
    }

    async fn run_preferences(&self, options: &SyncOptions) {
        let preferences = self.preferences.clone();
        self.run_domain(domains::PREFERENCES, options, || {
            let preferences = preferences.clone();
            async move {
                preferences
                    .try_sync(options)
                    .await
                    .map(|outcome| outcome.uploaded)
            }
        })
        .await;
    }

    async fn run_offline_queue(&self, options: &SyncOptions) {
        let queue = self.queue.clone();
        self.run_domain(domains::OFFLINE_QUEUE, options, || {
            let queue = queue.clone();
            async move {
                match queue.process_queue().await? {
                    ProcessOutcome::Processed(report) => Ok(report.succeeded > 0),
                    ProcessOutcome::AlreadyRunning => Err(Error::SyncInProgress),
                    ProcessOutcome::Offline => Err(Error::Offline),
                }
            }
        })
        .await;
    }

    /// Run one domain task under the call's timeout and retry budget,
    /// recording the outcome. The task resolves to whether anything changed.
    async fn run_domain<F, Fut>(&self, domain: &str, options: &SyncOptions, task: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.status
            .send_modify(|snapshot| snapshot.entry(domain).mark_loading());
        debug!("Domain {} started", domain);

        let mut retry = self.retry.clone();
        if let Some(retries) = options.retries {
            retry.max_retries = retries;
        }
        let result = RetryExecutor::new(retry)
            .execute(|| with_timeout(options.timeout, task()))
            .await;

        match result {
            Ok(has_changes) => {
                let now = self.clock.now();
                self.status
                    .send_modify(|snapshot| snapshot.entry(domain).mark_synced(now, has_changes));
                debug!("Domain {} synced (changes: {})", domain, has_changes);
            }
            Err(e) => {
                warn!("Domain {} failed: {}", domain, e);
                self.status
                    .send_modify(|snapshot| snapshot.entry(domain).mark_failed(e.to_string()));
            }
        }
    }
}

//! Sync scheduling - manual and periodic modes, plus replay on reconnect.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use skysync_common::{Error, Result};

use crate::coordinator::SyncCoordinator;
use crate::state::{SyncOptions, SyncSnapshot};

/// When syncs run without an explicit request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only on request.
    Manual,
    /// A full sync every `interval`, in addition to requests.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

/// Work the scheduler task can be asked to do.
#[derive(Debug, Clone)]
pub enum SyncRequest {
    /// Every domain, in order.
    All(SyncOptions),
    OfflineQueue,
    ReadStates,
    /// Stop the scheduler task.
    Shutdown,
}

type Envelope = (SyncRequest, oneshot::Sender<SyncSnapshot>);

/// Cloneable front end for the scheduler task.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: watch::Sender<SyncMode>,
    request_tx: mpsc::Sender<Envelope>,
}

impl SyncScheduler {
    /// Create a scheduler. The returned handle must be driven with
    /// [`SyncSchedulerHandle::run`].
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (mode, mode_rx) = watch::channel(mode);

        let scheduler = Self { mode, request_tx };
        let handle = SyncSchedulerHandle {
            mode: mode_rx,
            request_rx,
        };

        (scheduler, handle)
    }

    /// Create a scheduler in the mode set by the coordinator's config.
    pub fn for_coordinator(coordinator: &SyncCoordinator) -> (Self, SyncSchedulerHandle) {
        Self::new(coordinator.config().sync_mode.clone())
    }

    /// Sync every domain and wait for the resulting status.
    pub async fn request_sync(&self, options: SyncOptions) -> Result<SyncSnapshot> {
        self.request(SyncRequest::All(options)).await
    }

    pub async fn request_offline_queue(&self) -> Result<SyncSnapshot> {
        self.request(SyncRequest::OfflineQueue).await
    }

    pub async fn request_read_states(&self) -> Result<SyncSnapshot> {
        self.request(SyncRequest::ReadStates).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncSnapshot> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::SchedulerStopped)?;

        response_rx.await.map_err(|_| Error::SchedulerStopped)
    }

    /// Change the sync mode. The running task picks it up immediately.
    pub fn set_mode(&self, mode: SyncMode) {
        self.mode.send_replace(mode);
    }

    pub fn get_mode(&self) -> SyncMode {
        self.mode.borrow().clone()
    }

    /// Stop the scheduler task once queued requests ahead of this one are
    /// served.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }
}

/// Receiving side of the scheduler, consumed by [`SyncSchedulerHandle::run`].
pub struct SyncSchedulerHandle {
    mode: watch::Receiver<SyncMode>,
    request_rx: mpsc::Receiver<Envelope>,
}

impl SyncSchedulerHandle {
    /// Serve requests, periodic ticks and connectivity changes until shut
    /// down or every [`SyncScheduler`] is dropped.
    ///
    /// Meant to be spawned on its own task. Work runs one item at a time.
    pub async fn run(mut self, coordinator: Arc<SyncCoordinator>) {
        let mut periodic = Self::periodic_interval(&self.mode.borrow_and_update());
        let mut online = coordinator.connectivity().subscribe();
        let mut watching_connectivity = true;
        let mut watching_mode = true;

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((request, response_tx)) = request else {
                        debug!("All scheduler senders dropped");
                        break;
                    };
                    if matches!(request, SyncRequest::Shutdown) {
                        info!("Received shutdown request");
                        let _ = response_tx.send(coordinator.snapshot());
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let snapshot = Self::serve(&coordinator, request).await;
                    let _ = response_tx.send(snapshot);
                }

                _ = Self::tick(&mut periodic) => {
                    debug!("Triggering periodic sync");
                    let snapshot = coordinator.sync_all(&SyncOptions::default()).await;
                    let failed = snapshot.failed_domains();
                    if !failed.is_empty() {
                        warn!("Periodic sync failed for: {}", failed.join(", "));
                    }
                }

                changed = online.changed(), if watching_connectivity => {
                    if changed.is_err() {
                        debug!("Connectivity monitor gone, no longer watching");
                        watching_connectivity = false;
                        continue;
                    }
                    let is_online = *online.borrow_and_update();
                    if is_online && coordinator.config().process_queue_on_reconnect {
                        info!("Back online, replaying offline queue");
                        coordinator.process_offline_queue().await;
                    }
                }

                changed = self.mode.changed(), if watching_mode => {
                    if changed.is_err() {
                        watching_mode = false;
                        continue;
                    }
                    let mode = self.mode.borrow_and_update().clone();
                    debug!("Sync mode changed to {:?}", mode);
                    periodic = Self::periodic_interval(&mode);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn serve(coordinator: &SyncCoordinator, request: SyncRequest) -> SyncSnapshot {
        match request {
            SyncRequest::All(options) => coordinator.sync_all(&options).await,
            SyncRequest::OfflineQueue => {
                coordinator.process_offline_queue().await;
                coordinator.snapshot()
            }
            SyncRequest::ReadStates => {
                coordinator.sync_read_states().await;
                coordinator.snapshot()
            }
            SyncRequest::Shutdown => coordinator.snapshot(),
        }
    }

    /// First tick fires one full period after creation.
    fn periodic_interval(mode: &SyncMode) -> Option<Interval> {
        let period = mode.interval()?;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    async fn tick(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::WatchConnectivity;
    use crate::coordinator::{domains, SyncConfig};
    use crate::memory_remote::{MemoryRemote, RemoteOp};
    use crate::queue::OfflineAction;
    use skysync_common::ManualClock;
    use skysync_storage::MemoryStore;
    use tokio::task::JoinHandle;

    struct Running {
        scheduler: SyncScheduler,
        remote: Arc<MemoryRemote>,
        connectivity: Arc<WatchConnectivity>,
        coordinator: Arc<SyncCoordinator>,
        task: JoinHandle<()>,
    }

    async fn start(mode: SyncMode, online: bool) -> Running {
        let remote = Arc::new(MemoryRemote::new());
        let connectivity = Arc::new(WatchConnectivity::new(online));
        let coordinator = Arc::new(
            SyncCoordinator::build(
                Arc::new(MemoryStore::new()),
                remote.clone(),
                connectivity.clone(),
                Arc::new(ManualClock::at_millis(0)),
                SyncConfig::default(),
            )
            .await
            .unwrap(),
        );

        let (scheduler, handle) = SyncScheduler::new(mode);
        let task = tokio::spawn(handle.run(coordinator.clone()));

        Running {
            scheduler,
            remote,
            connectivity,
            coordinator,
            task,
        }
    }

    fn follow(did: &str) -> OfflineAction {
        OfflineAction::Follow {
            did: did.to_string(),
        }
    }

    #[tokio::test]
    async fn test_mode_change() {
        let (scheduler, _handle) = SyncScheduler::new(SyncMode::Manual);
        assert_eq!(scheduler.get_mode(), SyncMode::Manual);

        scheduler.set_mode(SyncMode::Periodic {
            interval: Duration::from_secs(60),
        });

        assert!(matches!(scheduler.get_mode(), SyncMode::Periodic { .. }));
    }

    #[tokio::test]
    async fn test_sync_request() {
        let running = start(SyncMode::Manual, true).await;

        let snapshot = running
            .scheduler
            .request_sync(SyncOptions::default())
            .await
            .unwrap();

        assert!(snapshot.get(domains::PREFERENCES).last_sync_time.is_some());
        assert!(snapshot.get(domains::OFFLINE_QUEUE).last_sync_time.is_some());
        assert_eq!(running.remote.call_count(RemoteOp::GetPreferences), 1);

        running.scheduler.shutdown().await;
        running.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_states_request() {
        let running = start(SyncMode::Manual, true).await;
        running
            .coordinator
            .read_state()
            .mark_as_read("at://post")
            .await
            .unwrap();

        let snapshot = running.scheduler.request_read_states().await.unwrap();

        assert!(snapshot.get(domains::READ_STATES).has_changes);
        assert_eq!(running.remote.call_count(RemoteOp::SyncReadStates), 1);

        running.scheduler.shutdown().await;
        running.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_after_shutdown_fails() {
        let running = start(SyncMode::Manual, true).await;
        running.scheduler.shutdown().await;
        running.task.await.unwrap();

        let result = running.scheduler.request_offline_queue().await;
        assert!(matches!(result, Err(Error::SchedulerStopped)));
    }

    #[tokio::test]
    async fn test_stops_when_senders_dropped() {
        let running = start(SyncMode::Manual, true).await;
        drop(running.scheduler);
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_mode_syncs_on_interval() {
        let running = start(
            SyncMode::Periodic {
                interval: Duration::from_secs(30),
            },
            true,
        )
        .await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(running.remote.call_count(RemoteOp::GetPreferences), 0);

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(running.remote.call_count(RemoteOp::GetPreferences), 2);

        running.scheduler.shutdown().await;
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_mode_drives_scheduler() {
        let remote = Arc::new(MemoryRemote::new());
        let coordinator = Arc::new(
            SyncCoordinator::build(
                Arc::new(MemoryStore::new()),
                remote.clone(),
                Arc::new(WatchConnectivity::new(true)),
                Arc::new(ManualClock::at_millis(0)),
                SyncConfig {
                    sync_mode: SyncMode::Periodic {
                        interval: Duration::from_secs(20),
                    },
                    ..SyncConfig::default()
                },
            )
            .await
            .unwrap(),
        );

        let (scheduler, handle) = SyncScheduler::for_coordinator(&coordinator);
        assert_eq!(
            scheduler.get_mode(),
            SyncMode::Periodic {
                interval: Duration::from_secs(20)
            }
        );
        let task = tokio::spawn(handle.run(coordinator.clone()));

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(remote.call_count(RemoteOp::GetPreferences), 2);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_to_manual_stops_ticks() {
        let running = start(
            SyncMode::Periodic {
                interval: Duration::from_secs(30),
            },
            true,
        )
        .await;

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(running.remote.call_count(RemoteOp::GetPreferences), 1);

        running.scheduler.set_mode(SyncMode::Manual);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(running.remote.call_count(RemoteOp::GetPreferences), 1);

        running.scheduler.shutdown().await;
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_queue() {
        let running = start(SyncMode::Manual, false).await;
        running
            .coordinator
            .queue()
            .queue_action(follow("did:plc:alice"))
            .await
            .unwrap();
        assert_eq!(running.coordinator.queue().len(), 1);

        running.connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(running.coordinator.queue().is_empty());
        assert_eq!(running.remote.call_count(RemoteOp::Follow), 1);

        running.scheduler.shutdown().await;
        running.task.await.unwrap();
    }
}

//! Network reachability as seen by the sync layer.

use tokio::sync::watch;

/// Reports whether the device is online and notifies on changes.
///
/// The platform integration lives in the application; this crate only
/// consumes the signal.
pub trait ConnectivityMonitor: Send + Sync {
    /// Current reachability.
    fn is_online(&self) -> bool;

    /// Receiver that observes every reachability change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Monitor that always reports online and never changes.
pub struct AlwaysOnline {
    tx: watch::Sender<bool>,
}

impl AlwaysOnline {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx }
    }
}

impl Default for AlwaysOnline {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Monitor driven by the application through [`WatchConnectivity::set_online`].
pub struct WatchConnectivity {
    tx: watch::Sender<bool>,
}

impl WatchConnectivity {
    /// Create a monitor with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Update reachability. Subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl ConnectivityMonitor for WatchConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

//! SkySync sync layer
//!
//! Offline-capable synchronization for a social client:
//! - Two-tier TTL cache over a durable store
//! - Last-writer-wins preferences sync with single-flight protection
//! - Read/unread tracking with a debounced bulk flush
//! - Durable offline action queue with at-least-once replay
//! - A coordinator that runs domains in sequence and reports their status
//! - Manual and periodic scheduling, and queue replay on reconnect

pub mod cache;
pub mod connectivity;
pub mod coordinator;
pub mod debounce;
pub mod memory_remote;
pub mod preferences;
pub mod queue;
pub mod read_state;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use cache::{CacheEntry, TtlCache};
pub use connectivity::{AlwaysOnline, ConnectivityMonitor, WatchConnectivity};
pub use coordinator::{domains, SyncConfig, SyncCoordinator};
pub use debounce::Debouncer;
pub use memory_remote::{MemoryRemote, RemoteCall, RemoteOp};
pub use preferences::{merge, MergeOutcome, PreferencesDocument, PreferencesSynchronizer};
pub use queue::{OfflineAction, OfflineActionQueue, ProcessOutcome, ProcessReport, QueuedAction};
pub use read_state::{ReadStateSynchronizer, DEFAULT_FLUSH_DELAY};
pub use remote::{ReadStateUpdate, RemoteApi};
pub use retry::{with_timeout, RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{DomainStatus, SyncOptions, SyncResult, SyncSnapshot};

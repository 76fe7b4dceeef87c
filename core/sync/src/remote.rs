//! Remote social-protocol API consumed by the sync layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use skysync_common::Result;

use crate::preferences::PreferencesDocument;

/// One read/unread marker sent to the server in a bulk flush.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadStateUpdate {
    pub uri: String,
    pub read: bool,
}

/// Operations the sync layer needs from the remote service.
///
/// Mutations are not assumed to be idempotent. An action replayed from the
/// offline queue may be applied twice if an earlier response was lost.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Fetch the user's preferences document.
    async fn get_preferences(&self) -> Result<PreferencesDocument>;

    /// Replace the user's preferences document.
    async fn put_preferences(&self, preferences: &PreferencesDocument) -> Result<()>;

    async fn like(&self, uri: &str, cid: &str) -> Result<()>;

    async fn delete_like(&self, like_uri: &str) -> Result<()>;

    async fn repost(&self, uri: &str, cid: &str) -> Result<()>;

    async fn delete_repost(&self, repost_uri: &str) -> Result<()>;

    async fn follow(&self, did: &str) -> Result<()>;

    async fn delete_follow(&self, follow_uri: &str) -> Result<()>;

    /// Bulk upload of read markers.
    ///
    /// The server-side shape of this endpoint is owned by the integrator; the
    /// sync layer only guarantees it is called with the entries changed since
    /// the previous flush.
    async fn sync_read_states(&self, entries: &[ReadStateUpdate]) -> Result<()>;
}

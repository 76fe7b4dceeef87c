//! Sync results, options and per-domain status tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use skysync_common::{Error, Result};

/// Outcome of a synchronizer operation as handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> SyncResult<T> {
    /// Successful result carrying `data`.
    pub fn ok(data: T, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp,
        }
    }

    /// Failed result carrying the error's message.
    pub fn failure(error: &Error, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            timestamp,
        }
    }

    pub fn from_result(result: Result<T>, timestamp: DateTime<Utc>) -> Self {
        match result {
            Ok(data) => Self::ok(data, timestamp),
            Err(e) => Self::failure(&e, timestamp),
        }
    }
}

/// Caller-supplied options for a sync run.
///
/// Synchronizers only look at `force`. `timeout` and `retries` are applied by
/// the coordinator around each domain task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Bypass the single-flight guard.
    #[serde(default)]
    pub force: bool,
    /// Deadline for one domain task.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Extra attempts after a transient failure.
    #[serde(default)]
    pub retries: Option<u32>,
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Last known status of one sync domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    /// A task for this domain is running.
    pub is_loading: bool,
    /// Completion time of the last successful run.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Message from the last failed run.
    pub error: Option<String>,
    /// The last run changed local or remote state.
    pub has_changes: bool,
}

impl DomainStatus {
    /// Idle status reported for domains that never ran.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Mark as running. Keeps the previous sync time.
    pub fn mark_loading(&mut self) {
        self.is_loading = true;
        self.error = None;
    }

    /// Mark as finished successfully.
    pub fn mark_synced(&mut self, at: DateTime<Utc>, has_changes: bool) {
        self.is_loading = false;
        self.last_sync_time = Some(at);
        self.error = None;
        self.has_changes = has_changes;
    }

    /// Mark as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.is_loading = false;
        self.error = Some(error.into());
        self.has_changes = false;
    }
}

/// Aggregated status across all domains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// True while any coordinator task is active.
    pub is_global_sync: bool,
    domains: BTreeMap<String, DomainStatus>,
}

impl SyncSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status for a domain, or idle if it never ran.
    pub fn get(&self, domain: &str) -> DomainStatus {
        self.domains.get(domain).cloned().unwrap_or_default()
    }

    /// Mutable status for a domain, created idle on first access.
    pub fn entry(&mut self, domain: &str) -> &mut DomainStatus {
        self.domains.entry(domain.to_string()).or_default()
    }

    /// All domains that have run at least once.
    pub fn domains(&self) -> impl Iterator<Item = (&str, &DomainStatus)> {
        self.domains.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether any domain is currently loading.
    pub fn any_loading(&self) -> bool {
        self.domains.values().any(|s| s.is_loading)
    }

    /// Domains whose last run failed.
    pub fn failed_domains(&self) -> Vec<&str> {
        self.domains
            .iter()
            .filter(|(_, s)| s.error.is_some())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_result_failure_message() {
        let now = Utc::now();
        let result: SyncResult<()> = SyncResult::failure(&Error::SyncInProgress, now);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Sync already in progress"));
        assert!(result.data.is_none());
    }

    #[test]
    fn test_sync_result_serializes_camel_case() {
        let result = SyncResult::ok(1u32, Utc::now());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 1);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_domain_status_transitions() {
        let mut status = DomainStatus::idle();
        status.mark_loading();
        assert!(status.is_loading);

        let now = Utc::now();
        status.mark_synced(now, true);
        assert!(!status.is_loading);
        assert_eq!(status.last_sync_time, Some(now));
        assert!(status.has_changes);

        status.mark_loading();
        status.mark_failed("boom");
        assert_eq!(status.error.as_deref(), Some("boom"));
        // a failure keeps the last good sync time
        assert_eq!(status.last_sync_time, Some(now));
    }

    #[test]
    fn test_snapshot_defaults_to_idle() {
        let mut snapshot = SyncSnapshot::new();
        assert_eq!(snapshot.get("preferences"), DomainStatus::idle());

        snapshot.entry("preferences").mark_loading();
        assert!(snapshot.any_loading());

        snapshot.entry("preferences").mark_failed("down");
        assert_eq!(snapshot.failed_domains(), vec!["preferences"]);
    }
}

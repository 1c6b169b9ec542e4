use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::policy::ReplicationMode;

/// Outcome of one sync pass for a policy.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SyncResult {
    pub policy_id: String,
    pub synced: u64,
    pub deleted: u64,
    pub failed: u64,
    pub bytes_total: u64,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl SyncResult {
    pub fn new(policy_id: impl Into<String>) -> Self {
        SyncResult {
            policy_id: policy_id.into(),
            ..Default::default()
        }
    }
}

/// Point-in-time view of a policy's replication counters.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    pub total_objects_synced: u64,
    pub total_objects_deleted: u64,
    pub total_bytes_synced: u64,
    pub total_errors: u64,
    pub sync_count: u64,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub average_sync_duration: Duration,
}

/// Policy identity combined with its metrics snapshot, for status reporting.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplicationStatus {
    pub policy_id: String,
    pub source_backend: String,
    pub destination_backend: String,
    pub enabled: bool,
    pub replication_mode: ReplicationMode,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub metrics: MetricsSnapshot,
}

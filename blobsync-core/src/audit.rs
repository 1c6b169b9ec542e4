//! Audit seam for object mutation events.
//!
//! Every replication mutation attempt is audited exactly once with a
//! success or failure tag; sinks live outside this crate.

use async_trait::async_trait;

/// Kind of replication mutation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    ReplicationSuccess,
    ReplicationFailed,
    ReplicationDelete,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ReplicationSuccess => "replication_success",
            AuditEventType::ReplicationFailed => "replication_failed",
            AuditEventType::ReplicationDelete => "replication_delete",
        }
    }
}

/// Success/failure tag on an audited mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// One audited object mutation.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub event_type: AuditEventType,
    pub user_id: String,
    pub principal: String,
    pub bucket: String,
    pub key: String,
    pub ip_address: String,
    pub request_id: String,
    pub bytes_transferred: u64,
    pub outcome: AuditOutcome,
    pub error: Option<String>,
}

/// Sink for audited object mutations.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log_object_mutation(&self, entry: AuditEntry);
}

/// Discards audit entries; used when no audit sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditLogger;

#[async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log_object_mutation(&self, _entry: AuditEntry) {}
}

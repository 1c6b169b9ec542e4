use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Logical mutation carried by change-log rows and watcher notifications.
///
/// Watchers collapse create/write into [`ChangeOperation::Put`] and
/// remove/rename into [`ChangeOperation::Delete`]; metadata-only noise is
/// filtered out before this type is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChangeOperation {
    Put,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Put => "put",
            ChangeOperation::Delete => "delete",
        }
    }
}

/// One durable row of the change log; also the shape glue code builds from
/// watcher output.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChangeEvent {
    pub key: String,
    pub operation: ChangeOperation,
    /// Filled with the wall clock at record time when absent.
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub etag: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub size: Option<u64>,
    /// Per-policy processing bits; an absent key and `false` both mean "not
    /// yet processed".
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "HashMap::is_empty")
    )]
    pub processed: HashMap<String, bool>,
}

impl ChangeEvent {
    pub fn new(key: impl Into<String>, operation: ChangeOperation) -> Self {
        ChangeEvent {
            key: key.into(),
            operation,
            timestamp: None,
            etag: None,
            size: None,
            processed: HashMap::new(),
        }
    }

    pub fn is_processed(&self, policy_id: &str) -> bool {
        self.processed.get(policy_id).copied().unwrap_or(false)
    }

    pub fn mark_processed(&mut self, policy_id: &str) {
        self.processed.insert(policy_id.to_string(), true);
    }
}

/// Filesystem notification after ignore filtering, debouncing, and operation
/// mapping.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileSystemEvent {
    pub path: PathBuf,
    pub operation: ChangeOperation,
    pub timestamp: DateTime<Utc>,
}


#[cfg(all(test, feature = "serde"))]
mod serde_tests {
    use super::*;

    #[test]
    fn test_change_event_round_trip() {
        let mut event = ChangeEvent::new("docs/a.txt", ChangeOperation::Put);
        event.timestamp = Some(Utc::now());
        event.etag = Some("abc123".to_string());
        event.size = Some(42);
        event.mark_processed("pol-1");

        let json = serde_json::to_string(&event).expect("serialize event");
        let decoded: ChangeEvent =
            serde_json::from_str(&json).expect("deserialize event");
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_missing_processed_map_loads_empty() {
        let json = r#"{"key":"a.txt","operation":"delete"}"#;
        let decoded: ChangeEvent =
            serde_json::from_str(json).expect("deserialize event");
        assert_eq!(decoded.operation, ChangeOperation::Delete);
        assert!(decoded.processed.is_empty());
        assert!(decoded.timestamp.is_none());
    }
}

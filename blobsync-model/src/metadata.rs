use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Object metadata as reported by a blob-store backend.
///
/// `etag` equality implies identical content by backend contract; `custom`
/// entries are copied verbatim during replication.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ObjectMetadata {
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub content_type: String,
    pub custom: HashMap<String, String>,
}

impl ObjectMetadata {
    pub fn new(size: u64, etag: impl Into<String>) -> Self {
        ObjectMetadata {
            size,
            etag: etag.into(),
            last_modified: Utc::now(),
            content_type: String::new(),
            custom: HashMap::new(),
        }
    }
}

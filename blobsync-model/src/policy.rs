use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};

/// How object payloads travel between the source and destination stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ReplicationMode {
    /// Copy bytes blob-for-blob; client-side ciphertext stays ciphertext.
    #[default]
    Opaque,
    /// Decrypt on read from the source, re-encrypt on write to the
    /// destination.
    Transparent,
}

impl ReplicationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMode::Opaque => "opaque",
            ReplicationMode::Transparent => "transparent",
        }
    }
}

/// One client-side encryption layer of a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EncryptionLayer {
    pub enabled: bool,
    pub provider: String,
    pub default_key: String,
}

/// Three-layer encryption posture: backend at-rest plus the source and
/// destination DEK layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EncryptionConfig {
    pub backend: EncryptionLayer,
    pub source: EncryptionLayer,
    pub destination: EncryptionLayer,
}

/// Unit of replication configuration. Persisted by the manager; mutated only
/// through the manager's add/overwrite path and its post-sync timestamp
/// update.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplicationPolicy {
    pub id: String,
    pub source_backend: String,
    pub destination_backend: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub source_settings: HashMap<String, String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub destination_settings: HashMap<String, String>,
    /// Optional key-prefix filter applied to source enumeration.
    #[cfg_attr(feature = "serde", serde(default))]
    pub source_prefix: String,
    pub check_interval: Duration,
    pub enabled: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub replication_mode: ReplicationMode,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub encryption: Option<EncryptionConfig>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl ReplicationPolicy {
    pub fn new(
        id: impl Into<String>,
        source_backend: impl Into<String>,
        destination_backend: impl Into<String>,
    ) -> Self {
        ReplicationPolicy {
            id: id.into(),
            source_backend: source_backend.into(),
            destination_backend: destination_backend.into(),
            source_settings: HashMap::new(),
            destination_settings: HashMap::new(),
            source_prefix: String::new(),
            check_interval: Duration::from_secs(300),
            enabled: true,
            replication_mode: ReplicationMode::Opaque,
            encryption: None,
            last_sync_time: None,
        }
    }

    /// Checks the parts of a policy the registry refuses to store.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ModelError::InvalidPolicy(
                "policy id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backend_encryption_enabled(&self) -> bool {
        self.encryption
            .as_ref()
            .is_some_and(|e| e.backend.enabled)
    }

    pub fn source_encryption_enabled(&self) -> bool {
        self.encryption.as_ref().is_some_and(|e| e.source.enabled)
    }

    pub fn destination_encryption_enabled(&self) -> bool {
        self.encryption
            .as_ref()
            .is_some_and(|e| e.destination.enabled)
    }
}


#[cfg(all(test, feature = "serde"))]
mod serde_tests {
    use super::*;

    #[test]
    fn test_mode_serializes_lowercase() {
        let json = serde_json::to_string(&ReplicationMode::Transparent)
            .expect("serialize mode");
        assert_eq!(json, "\"transparent\"");
        assert!(serde_json::from_str::<ReplicationMode>("\"mirror\"").is_err());
    }

    #[test]
    fn test_policy_round_trip_preserves_encryption() {
        let mut policy = ReplicationPolicy::new("pol-1", "local", "s3");
        policy.replication_mode = ReplicationMode::Transparent;
        policy
            .source_settings
            .insert("path".to_string(), "/data".to_string());
        policy.encryption = Some(EncryptionConfig {
            backend: EncryptionLayer {
                enabled: true,
                provider: "aes".to_string(),
                default_key: "backend-key".to_string(),
            },
            source: EncryptionLayer::default(),
            destination: EncryptionLayer {
                enabled: true,
                provider: "kms".to_string(),
                default_key: "dest-key".to_string(),
            },
        });

        let json = serde_json::to_string(&policy).expect("serialize policy");
        let decoded: ReplicationPolicy =
            serde_json::from_str(&json).expect("deserialize policy");
        assert_eq!(decoded, policy);
    }
}

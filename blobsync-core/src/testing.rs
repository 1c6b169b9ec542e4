//! In-memory doubles for the storage, backend-factory, and audit seams.
//!
//! Shared by the unit and integration tests; not part of the supported API.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use blobsync_model::ObjectMetadata;

use crate::audit::{AuditEntry, AuditLogger};
use crate::error::{ReplicationError, Result};
use crate::storage::{
    BackendFactory, ListOptions, ListResult, ObjectEntry, ObjectReader,
    Storage,
};

/// In-memory storage; a `BTreeMap` keeps listings in key order.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, (Vec<u8>, ObjectMetadata)>>,
    failing_puts: Mutex<HashSet<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        key: impl Into<String>,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) {
        self.objects.lock().insert(key.into(), (bytes, metadata));
    }

    /// Makes every future put for `key` fail.
    pub fn fail_puts_for(&self, key: impl Into<String>) {
        self.failing_puts.lock().insert(key.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    pub fn bytes_of(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).map(|(bytes, _)| bytes.clone())
    }

    pub fn metadata_of(&self, key: &str) -> Option<ObjectMetadata> {
        self.objects
            .lock()
            .get(key)
            .map(|(_, metadata)| metadata.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<ObjectReader> {
        let bytes = self
            .objects
            .lock()
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| {
                ReplicationError::Storage(format!("object not found: {key}"))
            })?;
        Ok(Box::pin(Cursor::new(bytes)))
    }

    async fn put_with_metadata(
        &self,
        key: &str,
        mut reader: ObjectReader,
        metadata: ObjectMetadata,
    ) -> Result<()> {
        if self.failing_puts.lock().contains(key) {
            return Err(ReplicationError::Storage(format!(
                "injected put failure for {key}"
            )));
        }
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        self.objects.lock().insert(key.to_string(), (bytes, metadata));
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata> {
        self.metadata_of(key).ok_or_else(|| {
            ReplicationError::Storage(format!("object not found: {key}"))
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn list(&self, options: ListOptions) -> Result<ListResult> {
        let objects = self.objects.lock();
        let max_results = if options.max_results == 0 {
            usize::MAX
        } else {
            options.max_results
        };

        let mut page = Vec::new();
        let mut truncated = false;
        for (key, (_, metadata)) in objects.iter() {
            if let Some(continue_from) = &options.continue_from
                && key <= continue_from
            {
                continue;
            }
            if !key.starts_with(&options.prefix) {
                continue;
            }
            if page.len() == max_results {
                truncated = true;
                break;
            }
            page.push(ObjectEntry {
                key: key.clone(),
                metadata: metadata.clone(),
            });
        }

        let next_token = if truncated {
            page.last().map(|entry: &ObjectEntry| entry.key.clone())
        } else {
            None
        };
        Ok(ListResult {
            objects: page,
            truncated,
            next_token,
        })
    }
}

/// Backend factory serving pre-registered storages by tag.
#[derive(Default)]
pub struct StaticBackendFactory {
    backends: Mutex<HashMap<String, Arc<dyn Storage>>>,
}

impl std::fmt::Debug for StaticBackendFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticBackendFactory").finish_non_exhaustive()
    }
}

impl StaticBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tag: impl Into<String>, storage: Arc<dyn Storage>) {
        self.backends.lock().insert(tag.into(), storage);
    }
}

#[async_trait]
impl BackendFactory for StaticBackendFactory {
    async fn create(
        &self,
        backend: &str,
        _settings: &HashMap<String, String>,
    ) -> Result<Arc<dyn Storage>> {
        self.backends.lock().get(backend).cloned().ok_or_else(|| {
            ReplicationError::Storage(format!("unknown backend: {backend}"))
        })
    }
}

/// Records audit entries for assertions.
#[derive(Debug, Default)]
pub struct RecordingAuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AuditLogger for RecordingAuditLogger {
    async fn log_object_mutation(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}

//! Per-policy synchronization algorithms and encryption-layer composition.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};
use uuid::Uuid;

use blobsync_model::{
    ChangeOperation, ReplicationMode, ReplicationPolicy, SyncResult,
};

use crate::audit::{AuditEntry, AuditEventType, AuditLogger, AuditOutcome};
use crate::changelog::ChangeLog;
use crate::detector::ChangeDetector;
use crate::encryption::EncrypterFactory;
use crate::error::{ReplicationError, Result};
use crate::metrics::ReplicationMetrics;
use crate::pool::{WorkItem, WorkResult, WorkerPool, WorkerPoolConfig};
use crate::storage::{BackendFactory, EncryptedStorage, Storage};

/// Floor for the parallel worker count.
const MIN_PARALLEL_WORKERS: usize = 4;

/// Backend tag whose storage honours the at-rest encryption hook.
const LOCAL_BACKEND: &str = "local";

/// Executes sync passes for one policy.
///
/// A syncer is built per sync call, wires the policy's three encryption
/// layers around the source and destination stores, and owns its own
/// metrics. Cancellation is by dropping the pass future.
#[derive(Clone)]
pub struct Syncer {
    policy: Arc<ReplicationPolicy>,
    source: Arc<dyn Storage>,
    dest: Arc<dyn Storage>,
    metrics: Arc<ReplicationMetrics>,
    audit: Arc<dyn AuditLogger>,
    request_id: Arc<str>,
}

impl fmt::Debug for Syncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Syncer")
            .field("policy", &self.policy.id)
            .field("mode", &self.policy.replication_mode)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl Syncer {
    /// Builds the source and destination stores for `policy` and composes
    /// its encryption layers: the backend at-rest hook on `"local"`
    /// backends, then transparent-mode wrappers that decrypt reads and
    /// encrypt writes. Opaque mode leaves both stores unwrapped so ciphertext
    /// flows blob-for-blob.
    pub async fn new(
        policy: ReplicationPolicy,
        backends: Arc<dyn BackendFactory>,
        backend_encryption: Arc<dyn EncrypterFactory>,
        source_encryption: Arc<dyn EncrypterFactory>,
        destination_encryption: Arc<dyn EncrypterFactory>,
        audit: Arc<dyn AuditLogger>,
    ) -> Result<Self> {
        let source = backends
            .create(&policy.source_backend, &policy.source_settings)
            .await?;
        let dest = backends
            .create(
                &policy.destination_backend,
                &policy.destination_settings,
            )
            .await?;

        if policy.backend_encryption_enabled() {
            if policy.source_backend == LOCAL_BACKEND {
                source
                    .set_at_rest_encrypter_factory(backend_encryption.clone());
            }
            if policy.destination_backend == LOCAL_BACKEND {
                dest.set_at_rest_encrypter_factory(backend_encryption);
            }
        }

        let (source, dest) = match policy.replication_mode {
            ReplicationMode::Transparent => {
                let source: Arc<dyn Storage> =
                    if policy.source_encryption_enabled() {
                        Arc::new(EncryptedStorage::new(
                            source,
                            source_encryption,
                        ))
                    } else {
                        source
                    };
                let dest: Arc<dyn Storage> =
                    if policy.destination_encryption_enabled() {
                        Arc::new(EncryptedStorage::new(
                            dest,
                            destination_encryption,
                        ))
                    } else {
                        dest
                    };
                (source, dest)
            }
            ReplicationMode::Opaque => (source, dest),
        };

        Ok(Syncer {
            policy: Arc::new(policy),
            source,
            dest,
            metrics: Arc::new(ReplicationMetrics::new()),
            audit,
            request_id: Uuid::new_v4().to_string().into(),
        })
    }

    pub fn policy(&self) -> &ReplicationPolicy {
        &self.policy
    }

    /// This syncer's own counters, distinct from the manager's per-policy
    /// registry metrics.
    pub fn metrics(&self) -> Arc<ReplicationMetrics> {
        self.metrics.clone()
    }

    /// Copies one object source-to-destination, metadata included, and
    /// returns the bytes moved.
    pub async fn sync_object(&self, key: &str) -> Result<u64> {
        let reader = self.source.get(key).await.map_err(|err| {
            ReplicationError::Storage(format!(
                "failed to read source object {key}: {err}"
            ))
        })?;
        let metadata = self.source.get_metadata(key).await.map_err(|err| {
            ReplicationError::Storage(format!(
                "failed to read source metadata for {key}: {err}"
            ))
        })?;
        let bytes = metadata.size;

        if let Err(err) =
            self.dest.put_with_metadata(key, reader, metadata).await
        {
            self.audit_mutation(
                AuditEventType::ReplicationFailed,
                key,
                0,
                AuditOutcome::Failure,
                Some(err.to_string()),
            )
            .await;
            return Err(ReplicationError::Storage(format!(
                "failed to write destination object {key}: {err}"
            )));
        }

        self.audit_mutation(
            AuditEventType::ReplicationSuccess,
            key,
            bytes,
            AuditOutcome::Success,
            None,
        )
        .await;
        Ok(bytes)
    }

    /// Full reconciliation pass over the policy's source prefix.
    pub async fn sync_all(&self) -> Result<SyncResult> {
        let started = Instant::now();
        info!("starting full sync for policy {}", self.policy.id);

        let detector =
            ChangeDetector::new(self.source.clone(), self.dest.clone());
        let changed =
            detector.detect_changes(&self.policy.source_prefix).await?;

        let mut result = SyncResult::new(&self.policy.id);
        for key in changed {
            match self.sync_object(&key).await {
                Ok(bytes) => {
                    result.synced += 1;
                    result.bytes_total += bytes;
                }
                Err(err) => {
                    warn!("failed to sync {key}: {err}");
                    result.failed += 1;
                    result.errors.push(format!("{key}: {err}"));
                }
            }
        }

        result.duration = started.elapsed();
        self.metrics.record_result(&result);
        info!(
            "completed full sync for policy {}: {} synced, {} failed, {} \
             bytes in {:?}",
            self.policy.id,
            result.synced,
            result.failed,
            result.bytes_total,
            result.duration
        );
        Ok(result)
    }

    /// Full reconciliation fanned out over a bounded worker pool.
    pub async fn sync_all_parallel(&self, workers: usize) -> Result<SyncResult> {
        let started = Instant::now();
        info!(
            "starting parallel sync for policy {} with {} workers",
            self.policy.id,
            workers.max(MIN_PARALLEL_WORKERS)
        );

        let detector =
            ChangeDetector::new(self.source.clone(), self.dest.clone());
        let changed =
            detector.detect_changes(&self.policy.source_prefix).await?;

        let mut result = SyncResult::new(&self.policy.id);
        if changed.is_empty() {
            result.duration = started.elapsed();
            return Ok(result);
        }

        let pool = WorkerPool::new(WorkerPoolConfig {
            worker_count: workers.max(MIN_PARALLEL_WORKERS),
            queue_size: changed.len(),
        });

        let syncer = self.clone();
        pool.start(move |item: WorkItem| {
            let syncer = syncer.clone();
            async move {
                match syncer.sync_object(&item.key).await {
                    Ok(bytes) => WorkResult {
                        key: item.key,
                        bytes,
                        error: None,
                    },
                    Err(err) => WorkResult {
                        key: item.key,
                        bytes: 0,
                        error: Some(err.to_string()),
                    },
                }
            }
        });

        // Drain results concurrently so workers never stall on a full
        // result queue.
        let results = pool.results();
        let collector = tokio::spawn(async move {
            let mut synced = 0u64;
            let mut failed = 0u64;
            let mut bytes_total = 0u64;
            let mut errors = Vec::new();
            loop {
                let next = { results.lock().await.recv().await };
                let Some(work) = next else { break };
                match work.error {
                    None => {
                        synced += 1;
                        bytes_total += work.bytes;
                    }
                    Some(err) => {
                        failed += 1;
                        errors.push(format!("{}: {err}", work.key));
                    }
                }
            }
            (synced, failed, bytes_total, errors)
        });

        for key in changed {
            if let Err(err) = pool.submit(WorkItem { key: key.clone() }).await
            {
                warn!("failed to submit {key}: {err}");
                result.failed += 1;
                result.errors.push(format!("{key}: {err}"));
            }
        }
        pool.shutdown().await;

        match collector.await {
            Ok((synced, failed, bytes_total, errors)) => {
                result.synced = synced;
                result.failed += failed;
                result.bytes_total = bytes_total;
                result.errors.extend(errors);
            }
            Err(err) => {
                error!("result collector failed: {err}");
            }
        }

        result.duration = started.elapsed();
        self.metrics.record_result(&result);
        info!(
            "completed parallel sync for policy {}: {} synced, {} failed, \
             {} bytes in {:?}",
            self.policy.id,
            result.synced,
            result.failed,
            result.bytes_total,
            result.duration
        );
        Ok(result)
    }

    /// Applies unprocessed change-log events for this policy.
    ///
    /// Per-event failures are counted and retried on a later pass; only a
    /// change-log read failure is fatal to the pass. The feed is
    /// at-least-once: a mark-processed failure after a successful apply is
    /// logged, not surfaced.
    pub async fn sync_incremental(
        &self,
        changelog: &dyn ChangeLog,
    ) -> Result<SyncResult> {
        let started = Instant::now();
        let events = changelog.get_unprocessed(&self.policy.id)?;
        info!(
            "starting incremental sync for policy {}: {} pending events",
            self.policy.id,
            events.len()
        );

        let mut result = SyncResult::new(&self.policy.id);
        for event in events {
            match event.operation {
                ChangeOperation::Put => {
                    match self.sync_object(&event.key).await {
                        Ok(bytes) => {
                            result.synced += 1;
                            result.bytes_total += bytes;
                            self.finish_event(changelog, &event.key);
                        }
                        Err(err) => {
                            warn!(
                                "failed to apply put for {}: {err}",
                                event.key
                            );
                            result.failed += 1;
                            result.errors.push(format!("{}: {err}", event.key));
                        }
                    }
                }
                ChangeOperation::Delete => {
                    match self.dest.delete(&event.key).await {
                        Ok(()) => {
                            self.audit_mutation(
                                AuditEventType::ReplicationDelete,
                                &event.key,
                                0,
                                AuditOutcome::Success,
                                None,
                            )
                            .await;
                            result.deleted += 1;
                            self.finish_event(changelog, &event.key);
                        }
                        Err(err) => {
                            warn!(
                                "failed to apply delete for {}: {err}",
                                event.key
                            );
                            result.failed += 1;
                            result.errors.push(format!("{}: {err}", event.key));
                        }
                    }
                }
            }
        }

        result.duration = started.elapsed();
        self.metrics.record_result(&result);
        info!(
            "completed incremental sync for policy {}: {} synced, {} \
             deleted, {} failed in {:?}",
            self.policy.id,
            result.synced,
            result.deleted,
            result.failed,
            result.duration
        );
        Ok(result)
    }

    /// Marks one applied event processed; failure leaves it for redelivery.
    fn finish_event(&self, changelog: &dyn ChangeLog, key: &str) {
        if let Err(err) = changelog.mark_processed(key, &self.policy.id) {
            warn!("failed to mark {key} processed: {err}");
        }
    }

    async fn audit_mutation(
        &self,
        event_type: AuditEventType,
        key: &str,
        bytes_transferred: u64,
        outcome: AuditOutcome,
        error: Option<String>,
    ) {
        self.audit
            .log_object_mutation(AuditEntry {
                event_type,
                user_id: String::new(),
                principal: "replication".to_string(),
                bucket: self.policy.destination_backend.clone(),
                key: key.to_string(),
                ip_address: String::new(),
                request_id: self.request_id.to_string(),
                bytes_transferred,
                outcome,
                error,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use blobsync_model::{
        EncryptionConfig, EncryptionLayer, ObjectMetadata,
    };

    use crate::audit::NoopAuditLogger;
    use crate::encryption::{Encrypter, NoopEncrypter, NoopEncrypterFactory};
    use crate::testing::{MemoryStorage, StaticBackendFactory};

    use super::*;

    /// Noop-backed factory that counts how often an encrypter is requested,
    /// to observe which layers a syncer actually wired.
    #[derive(Debug, Default)]
    struct CountingEncrypterFactory {
        calls: AtomicUsize,
    }

    impl CountingEncrypterFactory {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl EncrypterFactory for CountingEncrypterFactory {
        fn encrypter(&self, _key_id: &str) -> Result<Arc<dyn Encrypter>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopEncrypter))
        }

        fn default_key_id(&self) -> &str {
            "test-key"
        }
    }

    struct Setup {
        source: Arc<MemoryStorage>,
        dest: Arc<MemoryStorage>,
        backends: Arc<StaticBackendFactory>,
    }

    fn setup() -> Setup {
        let source = Arc::new(MemoryStorage::new());
        let dest = Arc::new(MemoryStorage::new());
        let backends = Arc::new(StaticBackendFactory::new());
        backends.register("src", source.clone());
        backends.register("dst", dest.clone());
        Setup {
            source,
            dest,
            backends,
        }
    }

    fn transparent_policy() -> ReplicationPolicy {
        let mut policy = ReplicationPolicy::new("pol-1", "src", "dst");
        policy.replication_mode = ReplicationMode::Transparent;
        policy.encryption = Some(EncryptionConfig {
            backend: EncryptionLayer::default(),
            source: EncryptionLayer {
                enabled: true,
                ..Default::default()
            },
            destination: EncryptionLayer {
                enabled: true,
                ..Default::default()
            },
        });
        policy
    }

    async fn build(
        policy: ReplicationPolicy,
        backends: Arc<StaticBackendFactory>,
        source_enc: Arc<CountingEncrypterFactory>,
        dest_enc: Arc<CountingEncrypterFactory>,
    ) -> Syncer {
        Syncer::new(
            policy,
            backends,
            Arc::new(NoopEncrypterFactory::new()),
            source_enc,
            dest_enc,
            Arc::new(NoopAuditLogger),
        )
        .await
        .expect("construct syncer")
    }

    #[tokio::test]
    async fn test_transparent_mode_uses_both_dek_layers() {
        let fixture = setup();
        fixture.source.insert(
            "a.bin",
            b"payload".to_vec(),
            ObjectMetadata::new(7, "e1"),
        );

        let source_enc = Arc::new(CountingEncrypterFactory::default());
        let dest_enc = Arc::new(CountingEncrypterFactory::default());
        let syncer = build(
            transparent_policy(),
            fixture.backends.clone(),
            source_enc.clone(),
            dest_enc.clone(),
        )
        .await;

        let bytes = syncer.sync_object("a.bin").await.expect("sync object");
        assert_eq!(bytes, 7);
        assert_eq!(fixture.dest.bytes_of("a.bin"), Some(b"payload".to_vec()));
        // Read went through the source layer, write through the destination
        // layer.
        assert!(source_enc.calls() >= 1);
        assert!(dest_enc.calls() >= 1);
    }

    #[tokio::test]
    async fn test_opaque_mode_touches_no_dek_layer() {
        let fixture = setup();
        fixture.source.insert(
            "a.bin",
            b"payload".to_vec(),
            ObjectMetadata::new(7, "e1"),
        );

        let mut policy = transparent_policy();
        policy.replication_mode = ReplicationMode::Opaque;

        let source_enc = Arc::new(CountingEncrypterFactory::default());
        let dest_enc = Arc::new(CountingEncrypterFactory::default());
        let syncer = build(
            policy,
            fixture.backends.clone(),
            source_enc.clone(),
            dest_enc.clone(),
        )
        .await;

        syncer.sync_object("a.bin").await.expect("sync object");
        assert_eq!(source_enc.calls(), 0);
        assert_eq!(dest_enc.calls(), 0);
    }

    #[tokio::test]
    async fn test_sync_all_over_empty_source() {
        let fixture = setup();
        let source_enc = Arc::new(CountingEncrypterFactory::default());
        let dest_enc = Arc::new(CountingEncrypterFactory::default());
        let syncer = build(
            ReplicationPolicy::new("pol-1", "src", "dst"),
            fixture.backends.clone(),
            source_enc,
            dest_enc,
        )
        .await;

        let result = syncer.sync_all().await.expect("sync");
        assert_eq!(result.synced, 0);
        assert_eq!(result.failed, 0);
        assert!(result.errors.is_empty());

        let snapshot = syncer.metrics().snapshot();
        assert_eq!(snapshot.sync_count, 1);
        assert_eq!(snapshot.total_objects_synced, 0);
    }

    #[tokio::test]
    async fn test_parallel_empty_detection_returns_early() {
        let fixture = setup();
        let syncer = build(
            ReplicationPolicy::new("pol-1", "src", "dst"),
            fixture.backends.clone(),
            Arc::new(CountingEncrypterFactory::default()),
            Arc::new(CountingEncrypterFactory::default()),
        )
        .await;

        let result = syncer.sync_all_parallel(8).await.expect("sync");
        assert_eq!(result.synced, 0);
        // No pool ran, so no sync was recorded either.
        assert_eq!(syncer.metrics().snapshot().sync_count, 0);
    }

    #[tokio::test]
    async fn test_source_read_failures_do_not_audit() {
        let fixture = setup();
        let audit = Arc::new(crate::testing::RecordingAuditLogger::new());
        let syncer = Syncer::new(
            ReplicationPolicy::new("pol-1", "src", "dst"),
            fixture.backends.clone(),
            Arc::new(NoopEncrypterFactory::new()),
            Arc::new(NoopEncrypterFactory::new()),
            Arc::new(NoopEncrypterFactory::new()),
            audit.clone(),
        )
        .await
        .expect("construct syncer");

        assert!(syncer.sync_object("missing").await.is_err());
        assert!(audit.entries().is_empty());
    }
}

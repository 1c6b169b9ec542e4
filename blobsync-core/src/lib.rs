//! Core library for the blobsync replication engine.
//!
//! Keeps a destination blob store consistent with a source store under
//! per-policy configuration: one-shot bulk reconciliation, parallel bulk
//! reconciliation, and incremental replication fed by a durable JSON-lines
//! change log and a local filesystem watcher. Blob-store backends,
//! encryption providers, and audit sinks are consumed through seams and
//! live outside this crate.

pub mod audit;
pub mod changelog;
pub mod detector;
pub mod encryption;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod storage;
pub mod syncer;
#[doc(hidden)]
pub mod testing;
pub mod watch;

pub use audit::{
    AuditEntry, AuditEventType, AuditLogger, AuditOutcome, NoopAuditLogger,
};
pub use changelog::{ChangeLog, FileChangeLog, spawn_change_recorder};
pub use detector::{ChangeDetector, has_changed};
pub use encryption::{
    Encrypter, EncrypterFactory, NoopEncrypter, NoopEncrypterFactory,
};
pub use error::{ReplicationError, Result};
pub use manager::{DEFAULT_POLICY_FILE, ManagerConfig, ReplicationManager};
pub use metrics::ReplicationMetrics;
pub use pool::{
    PoolMetrics, WorkItem, WorkResult, WorkerPool, WorkerPoolConfig,
};
pub use storage::{
    BackendFactory, EncryptedStorage, ListOptions, ListResult, ObjectEntry,
    ObjectReader, Storage,
};
pub use syncer::Syncer;
pub use watch::{FsWatcher, WatcherConfig};

pub use blobsync_model as model;

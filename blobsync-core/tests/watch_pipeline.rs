//! Watcher -> change recorder -> change log -> incremental sync, end to end
//! against a real directory tree.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::sleep;

use blobsync_core::model::{ObjectMetadata, ReplicationPolicy};
use blobsync_core::testing::{
    MemoryStorage, RecordingAuditLogger, StaticBackendFactory,
};
use blobsync_core::{
    ChangeLog, FileChangeLog, FsWatcher, NoopEncrypterFactory, Syncer,
    WatcherConfig, spawn_change_recorder,
};

#[tokio::test]
async fn filesystem_writes_flow_into_incremental_sync() {
    let watched = TempDir::new().expect("tempdir");
    let log_dir = TempDir::new().expect("tempdir");

    let changelog: Arc<dyn ChangeLog> = Arc::new(
        FileChangeLog::new(log_dir.path().join("changes.log"), u64::MAX)
            .expect("open change log"),
    );

    let watcher = FsWatcher::new(WatcherConfig {
        debounce_delay: Duration::from_millis(20),
        ..Default::default()
    })
    .expect("watcher");
    let root = watched.path().canonicalize().expect("canonical root");
    watcher.watch(&root).expect("watch");

    let recorder = spawn_change_recorder(
        watcher.events(),
        changelog.clone(),
        root.clone(),
    );

    std::fs::write(watched.path().join("report.txt"), b"v1")
        .expect("write file");
    sleep(Duration::from_millis(400)).await;

    // Stop the watcher; the recorder drains the closed channel and exits.
    watcher.stop().await;
    recorder.await.expect("recorder join");

    let pending = changelog.get_unprocessed("pol-1").expect("get");
    assert!(
        pending.iter().any(|event| event.key == "report.txt"),
        "expected a change-log row for report.txt, got {pending:?}"
    );

    // The recorded events drive an incremental pass.
    let source = Arc::new(MemoryStorage::new());
    source.insert("report.txt", b"v1".to_vec(), ObjectMetadata::new(2, "e1"));
    let dest = Arc::new(MemoryStorage::new());
    let backends = Arc::new(StaticBackendFactory::new());
    backends.register("mem-src", source);
    backends.register("mem-dst", dest.clone());

    let syncer = Syncer::new(
        ReplicationPolicy::new("pol-1", "mem-src", "mem-dst"),
        backends,
        Arc::new(NoopEncrypterFactory::new()),
        Arc::new(NoopEncrypterFactory::new()),
        Arc::new(NoopEncrypterFactory::new()),
        Arc::new(RecordingAuditLogger::new()),
    )
    .await
    .expect("construct syncer");

    let result = syncer.sync_incremental(changelog.as_ref()).await.expect("sync");
    assert!(result.synced >= 1);
    assert_eq!(dest.bytes_of("report.txt"), Some(b"v1".to_vec()));
    assert!(changelog.get_unprocessed("pol-1").expect("get").is_empty());
}

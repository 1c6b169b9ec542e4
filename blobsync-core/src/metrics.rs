//! Lock-free per-policy replication counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use blobsync_model::{MetricsSnapshot, SyncResult};

/// Counters and timings for one policy.
///
/// All fields are atomics updated without locks; a snapshot is a set of
/// independent reads, not a transaction. Counters are monotonic between
/// [`ReplicationMetrics::reset`] calls.
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    total_objects_synced: AtomicU64,
    total_objects_deleted: AtomicU64,
    total_bytes_synced: AtomicU64,
    total_errors: AtomicU64,
    sync_count: AtomicU64,
    total_sync_duration_ns: AtomicU64,
    last_sync_time_ns: AtomicI64,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_objects_synced(&self, count: u64) {
        self.total_objects_synced.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_objects_deleted(&self, count: u64) {
        self.total_objects_deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_bytes_synced(&self, bytes: u64) {
        self.total_bytes_synced.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_errors(&self, count: u64) {
        self.total_errors.fetch_add(count, Ordering::Relaxed);
    }

    /// Stamps the sync wall clock and folds `duration` into the running
    /// average.
    pub fn record_sync(&self, duration: Duration) {
        let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        self.last_sync_time_ns.store(now_ns, Ordering::Relaxed);
        self.total_sync_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.sync_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds one sync pass into the counters.
    pub fn record_result(&self, result: &SyncResult) {
        self.record_objects_synced(result.synced);
        self.record_objects_deleted(result.deleted);
        self.record_bytes_synced(result.bytes_total);
        self.record_errors(result.failed);
        self.record_sync(result.duration);
    }

    /// Mean sync duration; zero when nothing has been recorded yet.
    pub fn average_sync_duration(&self) -> Duration {
        let count = self.sync_count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        let total = self.total_sync_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total / count)
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        let ns = self.last_sync_time_ns.load(Ordering::Relaxed);
        if ns == 0 {
            return None;
        }
        Some(Utc.timestamp_nanos(ns))
    }

    /// Best-effort consistent view of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_objects_synced: self
                .total_objects_synced
                .load(Ordering::Relaxed),
            total_objects_deleted: self
                .total_objects_deleted
                .load(Ordering::Relaxed),
            total_bytes_synced: self.total_bytes_synced.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            sync_count: self.sync_count.load(Ordering::Relaxed),
            last_sync_time: self.last_sync_time(),
            average_sync_duration: self.average_sync_duration(),
        }
    }

    /// Zeroes every counter. Operator tooling only, not the hot path.
    pub fn reset(&self) {
        self.total_objects_synced.store(0, Ordering::Relaxed);
        self.total_objects_deleted.store(0, Ordering::Relaxed);
        self.total_bytes_synced.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
        self.sync_count.store(0, Ordering::Relaxed);
        self.total_sync_duration_ns.store(0, Ordering::Relaxed);
        self.last_sync_time_ns.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_with_zero_syncs_is_zero() {
        let metrics = ReplicationMetrics::new();
        assert_eq!(metrics.average_sync_duration(), Duration::ZERO);
        assert!(metrics.last_sync_time().is_none());
    }

    #[test]
    fn test_record_sync_updates_average() {
        let metrics = ReplicationMetrics::new();
        metrics.record_sync(Duration::from_millis(100));
        metrics.record_sync(Duration::from_millis(300));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sync_count, 2);
        assert_eq!(snapshot.average_sync_duration, Duration::from_millis(200));
        assert!(snapshot.last_sync_time.is_some());
    }

    #[test]
    fn test_record_result_folds_counters() {
        let metrics = ReplicationMetrics::new();
        let mut result = SyncResult::new("pol-1");
        result.synced = 4;
        result.deleted = 1;
        result.failed = 2;
        result.bytes_total = 1024;
        result.duration = Duration::from_millis(50);

        metrics.record_result(&result);
        metrics.record_result(&result);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_objects_synced, 8);
        assert_eq!(snapshot.total_objects_deleted, 2);
        assert_eq!(snapshot.total_errors, 4);
        assert_eq!(snapshot.total_bytes_synced, 2048);
        assert_eq!(snapshot.sync_count, 2);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let metrics = ReplicationMetrics::new();
        metrics.record_objects_synced(7);
        metrics.record_sync(Duration::from_secs(1));
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot, MetricsSnapshot::default());
    }
}

//! Bounded parallel dispatch for per-object replication work.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ReplicationError, Result};

/// Default number of worker tasks.
const DEFAULT_WORKER_COUNT: usize = 4;
/// Default work-queue capacity.
const DEFAULT_QUEUE_SIZE: usize = 100;

/// Tunables for a worker pool. Zero values fall back to the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub queue_size: usize,
}

/// One unit of work: an object key to replicate.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub key: String,
}

/// Outcome of one processed item.
#[derive(Debug, Clone)]
pub struct WorkResult {
    pub key: String,
    pub bytes: u64,
    pub error: Option<String>,
}

impl WorkResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate counters across one pool's lifetime.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    objects_processed: AtomicU64,
    objects_succeeded: AtomicU64,
    objects_failed: AtomicU64,
    bytes_processed: AtomicU64,
}

impl PoolMetrics {
    pub fn objects_processed(&self) -> u64 {
        self.objects_processed.load(Ordering::Relaxed)
    }

    pub fn objects_succeeded(&self) -> u64 {
        self.objects_succeeded.load(Ordering::Relaxed)
    }

    pub fn objects_failed(&self) -> u64 {
        self.objects_failed.load(Ordering::Relaxed)
    }

    /// Bytes moved by successful items only.
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }
}

/// Bounded fan-out over one processor.
///
/// Workers share a single work queue and push every outcome onto the result
/// queue; output order is unrelated to submission order. The pool lives for
/// the duration of one parallel sync call.
pub struct WorkerPool {
    worker_count: usize,
    queue_size: usize,
    work_tx: Mutex<Option<mpsc::Sender<WorkItem>>>,
    work_rx: Mutex<Option<mpsc::Receiver<WorkItem>>>,
    result_tx: Mutex<Option<mpsc::Sender<WorkResult>>>,
    result_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkResult>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<PoolMetrics>,
    cancel: CancellationToken,
    shutdown: AtomicBool,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("queue_size", &self.queue_size)
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let worker_count = if config.worker_count == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            config.worker_count
        };
        let queue_size = if config.queue_size == 0 {
            DEFAULT_QUEUE_SIZE
        } else {
            config.queue_size
        };

        let (work_tx, work_rx) = mpsc::channel(queue_size);
        let (result_tx, result_rx) = mpsc::channel(queue_size);

        WorkerPool {
            worker_count,
            queue_size,
            work_tx: Mutex::new(Some(work_tx)),
            work_rx: Mutex::new(Some(work_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Arc::new(tokio::sync::Mutex::new(result_rx)),
            workers: Mutex::new(Vec::new()),
            metrics: Arc::new(PoolMetrics::default()),
            cancel: CancellationToken::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Launches the worker tasks. Subsequent calls are a no-op.
    pub fn start<F, Fut>(&self, processor: F)
    where
        F: Fn(WorkItem) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = WorkResult> + Send + 'static,
    {
        let Some(work_rx) = self.work_rx.lock().take() else {
            return;
        };
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let result_tx = self.result_tx.lock().clone();
        let Some(result_tx) = result_tx else {
            return;
        };

        for worker_id in 0..self.worker_count {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let metrics = self.metrics.clone();
            let cancel = self.cancel.clone();
            let processor = processor.clone();

            let handle = tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = async {
                            work_rx.lock().await.recv().await
                        } => match item {
                            Some(item) => item,
                            None => break,
                        },
                    };

                    let result = processor(item).await;
                    metrics.objects_processed.fetch_add(1, Ordering::Relaxed);
                    match &result.error {
                        None => {
                            metrics
                                .objects_succeeded
                                .fetch_add(1, Ordering::Relaxed);
                            metrics
                                .bytes_processed
                                .fetch_add(result.bytes, Ordering::Relaxed);
                        }
                        Some(err) => {
                            metrics
                                .objects_failed
                                .fetch_add(1, Ordering::Relaxed);
                            debug!(
                                "worker {worker_id}: {} failed: {err}",
                                result.key
                            );
                        }
                    }
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
                debug!("worker {worker_id} exiting");
            });
            self.workers.lock().push(handle);
        }
    }

    /// Enqueues an item, waiting for queue space. Fails fast once shutdown
    /// has begun or the pool is cancelled.
    pub async fn submit(&self, item: WorkItem) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ReplicationError::Internal(
                "worker pool is shut down".to_string(),
            ));
        }
        let sender = self.work_tx.lock().clone();
        let Some(sender) = sender else {
            return Err(ReplicationError::Internal(
                "worker pool is shut down".to_string(),
            ));
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReplicationError::Internal(
                "worker pool cancelled".to_string(),
            )),
            sent = sender.send(item) => sent.map_err(|_| {
                ReplicationError::Internal("work queue closed".to_string())
            }),
        }
    }

    /// Stops intake, drains the workers, then closes the result queue so a
    /// collector reading [`WorkerPool::results`] sees exactly one result per
    /// accepted item. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        drop(self.work_tx.lock().take());

        let workers: Vec<_> = {
            let mut guard = self.workers.lock();
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(err) = worker.await {
                warn!("worker join failed: {err}");
            }
        }

        drop(self.result_tx.lock().take());
        self.cancel.cancel();
    }

    /// Shared handle to the result queue.
    pub fn results(
        &self,
    ) -> Arc<tokio::sync::Mutex<mpsc::Receiver<WorkResult>>> {
        self.result_rx.clone()
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

//! Bounded-backlog batching in front of the run writer
//!
//! Producers enqueue items without waiting; a background task hands them to
//! a [`BatchSink`] in batches of at most `max_batch_size`, as soon as a full
//! batch is queued or `max_latency` has passed. When the backlog is full,
//! `enqueue` fails immediately instead of blocking.
//!
//! A batch whose flush fails with a retryable error goes back to the front
//! of the queue and is retried on the next tick. Batches that fail
//! permanently are dropped, counted, and reported by `shutdown`.

use crate::config::BatcherConfig;
use crate::error::{Error, Result};
use crate::writer::{RunBatch, RunWriter};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Destination of flushed batches
#[async_trait]
pub trait BatchSink<T>: Send + Sync + 'static {
    /// Deliver `items`; on a retryable error the same items are offered again
    async fn flush(&self, items: &[T]) -> Result<()>;
}

/// Retries of a failing batch while draining on shutdown
const SHUTDOWN_RETRIES: u32 = 3;
const SHUTDOWN_BACKOFF: Duration = Duration::from_millis(50);

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicUsize,
    last_error: Mutex<Option<String>>,
    max_batch_size: usize,
    max_latency: Duration,
    backlog_cap: usize,
}

pub struct Batcher<T> {
    shared: Arc<Shared<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> Batcher<T> {
    /// Start the flush task
    pub fn spawn<S: BatchSink<T>>(config: &BatcherConfig, sink: S) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            max_batch_size: config.max_batch_size.max(1),
            max_latency: Duration::from_millis(config.max_latency_ms.max(1)),
            backlog_cap: config.backlog_cap,
        });
        let task = tokio::spawn(flush_loop(shared.clone(), Arc::new(sink)));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue one item, or fail with `Backpressure` when the backlog is full
    pub async fn enqueue(&self, item: T) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Other("batcher is shut down".to_string()));
        }
        let mut queue = self.shared.queue.lock().await;
        if queue.len() >= self.shared.backlog_cap {
            return Err(Error::Backpressure(queue.len()));
        }
        queue.push_back(item);
        let len = queue.len();
        drop(queue);

        if len >= self.shared.max_batch_size {
            self.shared.notify.notify_one();
        }
        Ok(())
    }

    /// Items waiting to be flushed
    pub async fn pending(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Items dropped after a permanent flush failure
    pub fn dropped(&self) -> usize {
        self.shared.dropped.load(Ordering::Acquire)
    }

    /// Stop accepting items, flush what is queued and wait for the task.
    ///
    /// Fails if any item was dropped during the batcher's lifetime.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        if let Some(task) = self.task.lock().await.take() {
            task.await
                .map_err(|e| Error::Other(format!("batcher task failed: {}", e)))?;
        }
        let dropped = self.dropped();
        if dropped > 0 {
            let reason = self.shared.last_error.lock().await.clone().unwrap_or_default();
            return Err(Error::Other(format!(
                "{} queued items could not be flushed: {}",
                dropped, reason
            )));
        }
        Ok(())
    }
}

async fn take_batch<T>(shared: &Shared<T>, allow_partial: bool) -> Option<Vec<T>> {
    let mut queue = shared.queue.lock().await;
    if queue.is_empty() || (!allow_partial && queue.len() < shared.max_batch_size) {
        return None;
    }
    let n = queue.len().min(shared.max_batch_size);
    Some(queue.drain(..n).collect())
}

async fn requeue<T>(shared: &Shared<T>, items: Vec<T>) {
    let mut queue = shared.queue.lock().await;
    for item in items.into_iter().rev() {
        queue.push_front(item);
    }
}

async fn flush_loop<T, S>(shared: Arc<Shared<T>>, sink: Arc<S>)
where
    T: Send + Sync + 'static,
    S: BatchSink<T>,
{
    debug!(
        max_batch_size = shared.max_batch_size,
        max_latency_ms = shared.max_latency.as_millis() as u64,
        backlog_cap = shared.backlog_cap,
        "Batcher started"
    );
    let mut shutdown_retries = 0;
    loop {
        let timed_out = tokio::select! {
            _ = shared.notify.notified() => false,
            _ = tokio::time::sleep(shared.max_latency) => true,
        };
        let closing = shared.closed.load(Ordering::Acquire);

        while let Some(items) = take_batch(&shared, timed_out || closing).await {
            let count = items.len();
            match sink.flush(&items).await {
                Ok(()) => debug!(items = count, "Flushed batch"),
                Err(e) if e.is_retryable() && (!closing || shutdown_retries < SHUTDOWN_RETRIES) => {
                    warn!(items = count, error = %e, "Batch flush failed; will retry");
                    requeue(&shared, items).await;
                    if !closing {
                        break;
                    }
                    shutdown_retries += 1;
                    tokio::time::sleep(SHUTDOWN_BACKOFF * shutdown_retries).await;
                }
                Err(e) => {
                    error!(items = count, error = %e, "Dropping batch after flush failure");
                    shared.dropped.fetch_add(count, Ordering::AcqRel);
                    *shared.last_error.lock().await = Some(e.to_string());
                }
            }
        }

        if closing {
            info!("Batcher drained");
            return;
        }
    }
}

/// Sink writing queued runs through [`RunWriter`], merging runs of the same
/// entity, schema version and pipeline version into one manifest
pub struct EntitySink {
    writer: RunWriter,
}

impl EntitySink {
    pub fn new(writer: RunWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl BatchSink<RunBatch> for EntitySink {
    async fn flush(&self, items: &[RunBatch]) -> Result<()> {
        let mut merged: BTreeMap<(crate::registry::Entity, u32, String), RunBatch> = BTreeMap::new();
        for run in items {
            let key = (run.entity, run.schema_version, run.pipeline_version.clone());
            match merged.get_mut(&key) {
                Some(existing) => existing.absorb(run.clone()),
                None => {
                    merged.insert(key, run.clone());
                }
            }
        }
        for run in merged.values() {
            self.writer.write_run(run).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{doc_chunk_run, text_vector};
    use crate::manifest::ManifestStore;
    use crate::registry::Entity;
    use crate::storage::Storage;

    #[derive(Clone, Default)]
    struct Collect {
        batches: Arc<Mutex<Vec<Vec<u32>>>>,
    }

    #[async_trait]
    impl BatchSink<u32> for Collect {
        async fn flush(&self, items: &[u32]) -> Result<()> {
            self.batches.lock().await.push(items.to_vec());
            Ok(())
        }
    }

    /// Fails the first `failures` flushes with `error`, then collects
    struct Failing {
        failures: AtomicUsize,
        error: fn() -> Error,
        inner: Collect,
    }

    #[async_trait]
    impl BatchSink<u32> for Failing {
        async fn flush(&self, items: &[u32]) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err((self.error)());
            }
            self.inner.flush(items).await
        }
    }

    fn config(max_batch_size: usize, max_latency_ms: u64, backlog_cap: usize) -> BatcherConfig {
        BatcherConfig {
            max_batch_size,
            max_latency_ms,
            backlog_cap,
        }
    }

    #[tokio::test]
    async fn test_backpressure_at_cap() {
        let sink = Collect::default();
        let batcher = Batcher::spawn(&config(1_000, 3_600_000, 100), sink.clone());

        for i in 0..100 {
            batcher.enqueue(i).await.unwrap();
        }
        let err = batcher.enqueue(100).await.unwrap_err();
        assert!(matches!(err, Error::Backpressure(100)));
        assert!(err.is_retryable());
        assert_eq!(batcher.pending().await, 100);
        assert!(sink.batches.lock().await.is_empty());

        batcher.shutdown().await.unwrap();
        let flushed: usize = sink.batches.lock().await.iter().map(Vec::len).sum();
        assert_eq!(flushed, 100);
    }

    #[tokio::test]
    async fn test_flushes_on_size() {
        let sink = Collect::default();
        let batcher = Batcher::spawn(&config(3, 3_600_000, 100), sink.clone());
        for i in 0..7 {
            batcher.enqueue(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let batches = sink.batches.lock().await.clone();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5]]);
        assert_eq!(batcher.pending().await, 1);
        batcher.shutdown().await.unwrap();
        assert_eq!(sink.batches.lock().await.last(), Some(&vec![6]));
    }

    #[tokio::test]
    async fn test_flushes_on_latency() {
        let sink = Collect::default();
        let batcher = Batcher::spawn(&config(100, 30, 100), sink.clone());
        batcher.enqueue(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sink.batches.lock().await.clone(), vec![vec![1]]);
        assert_eq!(batcher.pending().await, 0);
        batcher.shutdown().await.unwrap();
        assert!(batcher.enqueue(2).await.is_err());
    }

    #[tokio::test]
    async fn test_retryable_failure_keeps_items() {
        let collected = Collect::default();
        let sink = Failing {
            failures: AtomicUsize::new(1),
            error: || Error::Timeout(Duration::from_millis(5)),
            inner: collected.clone(),
        };
        let batcher = Batcher::spawn(&config(3, 30, 100), sink);
        for i in 0..3 {
            batcher.enqueue(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(collected.batches.lock().await.clone(), vec![vec![0, 1, 2]]);
        assert_eq!(batcher.pending().await, 0);
        batcher.shutdown().await.unwrap();
        assert_eq!(batcher.dropped(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_retries_pending_batch() {
        let collected = Collect::default();
        let sink = Failing {
            failures: AtomicUsize::new(2),
            error: || Error::Timeout(Duration::from_millis(5)),
            inner: collected.clone(),
        };
        let batcher = Batcher::spawn(&config(100, 3_600_000, 100), sink);
        batcher.enqueue(7).await.unwrap();
        batcher.shutdown().await.unwrap();
        assert_eq!(collected.batches.lock().await.clone(), vec![vec![7]]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_reported() {
        let collected = Collect::default();
        let sink = Failing {
            failures: AtomicUsize::new(1),
            error: || Error::Validation("bad row".to_string()),
            inner: collected.clone(),
        };
        let batcher = Batcher::spawn(&config(2, 3_600_000, 100), sink);
        batcher.enqueue(1).await.unwrap();
        batcher.enqueue(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(batcher.dropped(), 2);

        let err = batcher.shutdown().await.unwrap_err();
        assert!(err.to_string().contains("bad row"));
        assert!(collected.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_entity_sink_merges_runs() {
        let storage = Storage::in_memory("v1");
        let batcher = Batcher::spawn(
            &config(10, 3_600_000, 100),
            EntitySink::new(RunWriter::new(storage.clone())),
        );
        batcher
            .enqueue(doc_chunk_run("m1", &[("c1", "one", text_vector(0))]))
            .await
            .unwrap();
        batcher
            .enqueue(doc_chunk_run("m1", &[("c2", "two", text_vector(1))]))
            .await
            .unwrap();
        batcher.shutdown().await.unwrap();

        let manifests = ManifestStore::new(storage)
            .list_all(Some(Entity::DocChunk))
            .await
            .unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].primary_rows(), 2);
    }
}

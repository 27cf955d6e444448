//! UpdateSerializer - dispatcher owning all per-key update queues
//!
//! Routes updates to their key's FIFO queue, creating queues on demand
//! with a mutex-guarded double-checked path, and reclaims idle queues
//! with a periodic cleanup task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use lc_common::{CacheResult, Document, SerializerConfig};

use crate::error::SerializerError;
use crate::executor::{UpdateExecutor, UpdateFn, UpdateOutcome};
use crate::queue::{QueueKey, UpdateQueue, UpdateRequest};

/// Per-key serialized updates with optimistic versioning.
///
/// Queues are keyed by `(cache, key)` and survive until the cleanup task
/// reclaims them after `idle_timeout` of inactivity.
pub struct UpdateSerializer<D> {
    config: SerializerConfig,
    executor: Arc<UpdateExecutor<D>>,
    queues: Arc<DashMap<QueueKey, Arc<UpdateQueue<D>>>>,
    /// Guards only the create path; lookups stay lock-free.
    create_lock: Mutex<()>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl<D: Document> UpdateSerializer<D> {
    /// Build the serializer and start its cleanup task.
    pub fn new(config: SerializerConfig, executor: UpdateExecutor<D>) -> Arc<Self> {
        let serializer = Arc::new(Self {
            config,
            executor: Arc::new(executor),
            queues: Arc::new(DashMap::new()),
            create_lock: Mutex::new(()),
            cleanup_task: Mutex::new(None),
            running: AtomicBool::new(true),
        });
        serializer.spawn_cleanup();
        serializer
    }

    /// Apply `update_fn` to the stored document, serialized FIFO per key.
    pub async fn update<F>(&self, cache: &str, doc: &D, update_fn: F) -> CacheResult<D>
    where
        F: Fn(&D) -> D + Send + Sync + 'static,
    {
        let f: UpdateFn<D> = Arc::new(move |current| Some(update_fn(current)));
        self.enqueue(cache, doc.key(), f, false).await
    }

    /// Like [`update`](Self::update), but the closure may decline to
    /// write by returning `None`, yielding [`CacheResult::Reject`].
    pub async fn update_rejectable<F>(&self, cache: &str, doc: &D, update_fn: F) -> CacheResult<D>
    where
        F: Fn(&D) -> Option<D> + Send + Sync + 'static,
    {
        let f: UpdateFn<D> = Arc::new(update_fn);
        self.enqueue(cache, doc.key(), f, false).await
    }

    /// Low-level entry point with explicit validation bypass.
    pub async fn enqueue(
        &self,
        cache: &str,
        key: &str,
        update_fn: UpdateFn<D>,
        bypass_validation: bool,
    ) -> CacheResult<D> {
        if !self.running.load(Ordering::SeqCst) {
            return CacheResult::failure(SerializerError::QueueClosed);
        }

        let queue_key = QueueKey::new(cache, key);

        // one extra pass covers racing an idle-queue shutdown
        for _ in 0..2 {
            let queue = self.queue_for(&queue_key);
            let (completion, receiver) = oneshot::channel();
            let request = UpdateRequest {
                update_fn: update_fn.clone(),
                bypass_validation,
                completion,
            };
            queue.submit(request).await;

            match receiver.await {
                Ok(Ok(UpdateOutcome::Updated(doc))) => return CacheResult::Success(doc),
                Ok(Ok(UpdateOutcome::Rejected)) => return CacheResult::Reject,
                Ok(Err(SerializerError::QueueClosed)) => {
                    debug!(queue = %queue_key, "Queue closed under us, retrying with a fresh one");
                }
                Ok(Err(e)) => return CacheResult::failure(e),
                Err(_) => return CacheResult::failure(SerializerError::Cancelled),
            }
        }

        CacheResult::failure(SerializerError::QueueClosed)
    }

    /// Number of live per-key queues.
    pub fn active_queues(&self) -> usize {
        self.queues.len()
    }

    /// Cancel cleanup, close every queue and join their workers.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(queues = self.queues.len(), "Shutting down update serializer");

        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }

        let keys: Vec<QueueKey> = self.queues.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, queue)) = self.queues.remove(&key) {
                queue.shutdown(self.config.shutdown_timeout).await;
            }
        }

        info!("Update serializer shut down");
    }

    /// Fetch or create the queue for a key (double-checked under the
    /// create lock so exactly one worker exists per key).
    fn queue_for(&self, key: &QueueKey) -> Arc<UpdateQueue<D>> {
        if let Some(queue) = self.queues.get(key) {
            if queue.is_open() {
                return queue.clone();
            }
        }

        let _guard = self.create_lock.lock();

        // re-check under the lock; drop the map guard before mutating
        let stale = if let Some(queue) = self.queues.get(key) {
            if queue.is_open() {
                return queue.clone();
            }
            true
        } else {
            false
        };
        if stale {
            self.queues.remove(key);
        }

        let queue = UpdateQueue::start(
            key.clone(),
            self.config.max_queued_updates,
            self.executor.clone(),
        );
        self.queues.insert(key.clone(), queue.clone());
        debug!(queue = %key, "Created update queue");
        queue
    }

    fn spawn_cleanup(self: &Arc<Self>) {
        let queues = self.queues.clone();
        let interval = self.config.cleanup_interval;
        let idle_timeout = self.config.idle_timeout;
        let shutdown_timeout = self.config.shutdown_timeout;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Self::cleanup_idle(&queues, idle_timeout, shutdown_timeout).await;
            }
        });
        *self.cleanup_task.lock() = Some(task);
    }

    /// Reclaim queues idle past the threshold. Shutdown problems are
    /// logged inside the queue and never re-raised from here.
    async fn cleanup_idle(
        queues: &DashMap<QueueKey, Arc<UpdateQueue<D>>>,
        idle_timeout: Duration,
        shutdown_timeout: Duration,
    ) {
        let idle: Vec<QueueKey> = queues
            .iter()
            .filter(|entry| entry.value().idle_for() >= idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        if idle.is_empty() {
            return;
        }

        debug!(count = idle.len(), "Reclaiming idle update queues");
        for key in idle {
            if let Some((_, queue)) = queues.remove(&key) {
                queue.shutdown(shutdown_timeout).await;
            }
        }
    }
}

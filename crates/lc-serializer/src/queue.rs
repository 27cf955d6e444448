//! UpdateQueue - single-key FIFO update worker
//!
//! One bounded channel and one worker task per active document key, so
//! concurrent updates to the same key apply strictly in enqueue order.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lc_common::Document;

use crate::error::SerializerError;
use crate::executor::{UpdateExecutor, UpdateFn, UpdateOutcome};
use crate::Result;

/// Extra attempts after the first failed `try_send` on a full queue.
const FULL_QUEUE_RETRIES: u32 = 3;
const FULL_QUEUE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Identity of an update queue: cache name plus document key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub cache: Arc<str>,
    pub key: Arc<str>,
}

impl QueueKey {
    pub fn new(cache: &str, key: &str) -> Self {
        Self {
            cache: Arc::from(cache),
            key: Arc::from(key),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cache, self.key)
    }
}

/// One queued update; the completion resolves exactly once.
pub(crate) struct UpdateRequest<D> {
    pub update_fn: UpdateFn<D>,
    pub bypass_validation: bool,
    pub completion: oneshot::Sender<Result<UpdateOutcome<D>>>,
}

/// Bounded FIFO queue with a dedicated worker for one document key.
pub struct UpdateQueue<D> {
    key: QueueKey,
    tx: Mutex<Option<mpsc::Sender<UpdateRequest<D>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_activity: Arc<Mutex<Instant>>,
}

impl<D: Document> UpdateQueue<D> {
    /// Create the queue and start its worker.
    pub(crate) fn start(
        key: QueueKey,
        capacity: usize,
        executor: Arc<UpdateExecutor<D>>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<UpdateRequest<D>>(capacity.max(1));
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let worker_key = key.clone();
        let worker_activity = last_activity.clone();
        let worker = tokio::spawn(async move {
            debug!(queue = %worker_key, "Update worker started");
            while let Some(request) = rx.recv().await {
                *worker_activity.lock() = Instant::now();
                let result = executor
                    .execute(&worker_key.key, &request.update_fn, request.bypass_validation)
                    .await;
                // a dropped receiver just means the caller stopped waiting
                let _ = request.completion.send(result);
                *worker_activity.lock() = Instant::now();
            }
            debug!(queue = %worker_key, "Update worker drained and exited");
        });

        Arc::new(Self {
            key,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            last_activity,
        })
    }

    /// Enqueue a request, retrying a full queue briefly before rejecting.
    ///
    /// All outcomes flow through the request's completion channel.
    pub(crate) async fn submit(&self, request: UpdateRequest<D>) {
        *self.last_activity.lock() = Instant::now();

        let Some(tx) = self.tx.lock().clone() else {
            let _ = request.completion.send(Err(SerializerError::QueueClosed));
            return;
        };

        let mut request = request;
        for attempt in 0..=FULL_QUEUE_RETRIES {
            match tx.try_send(request) {
                Ok(()) => return,
                Err(TrySendError::Closed(returned)) => {
                    let _ = returned.completion.send(Err(SerializerError::QueueClosed));
                    return;
                }
                Err(TrySendError::Full(returned)) => {
                    request = returned;
                    if attempt < FULL_QUEUE_RETRIES {
                        tokio::time::sleep(FULL_QUEUE_RETRY_DELAY).await;
                    }
                }
            }
        }

        warn!(queue = %self.key, "Update queue full, rejecting request");
        let _ = request
            .completion
            .send(Err(SerializerError::QueueFull(self.key.to_string())));
    }

    /// False once the queue has been shut down.
    pub(crate) fn is_open(&self) -> bool {
        self.tx.lock().is_some()
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Close the queue, wait for the worker to drain, abort on timeout.
    ///
    /// Requests still queued when the worker is aborted resolve as
    /// cancelled on the caller side.
    pub(crate) async fn shutdown(&self, timeout: Duration) {
        drop(self.tx.lock().take());

        let handle = self.worker.lock().take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(_) => debug!(queue = %self.key, "Update queue drained"),
                Err(_) => {
                    warn!(queue = %self.key, "Update queue did not drain in time, aborting worker");
                    handle.abort();
                }
            }
        }
    }
}

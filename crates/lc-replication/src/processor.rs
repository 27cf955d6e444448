//! EventProcessor - bounded-buffer consumer for change events
//!
//! A single long-running task drains the event channel and dispatches
//! each event to the cache handler under a processing timeout. The
//! producer side (`handle_incoming`) applies bounded backpressure: a full
//! buffer is retried briefly, then the event is dispatched directly so
//! the cache stays correct even when the consumer cannot keep up.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lc_common::{ReplicationConfig, EVENT_COUNT_WRAP};

use crate::classifier::ErrorClassifier;
use crate::error::ReplicationError;
use crate::handler::{CacheHandler, DocumentChange};
use crate::source::{decode_document_id, ChangeEvent, ChangeOperation};
use crate::state::{ConnectionState, StateMachine};
use crate::tokens::ResumeTokenStore;
use crate::Result;

/// Extra attempts after the first failed `try_send` on a full buffer.
const FULL_BUFFER_RETRIES: u32 = 3;
const FULL_BUFFER_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Bounds for the idle poll tick used to observe shutdown.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) struct ProcessorShared<D> {
    handler: Arc<dyn CacheHandler<D>>,
    tokens: Arc<ResumeTokenStore>,
    classifier: Arc<ErrorClassifier>,
    state: Arc<StateMachine>,
    events_processed: Arc<AtomicU64>,
    processing_timeout: Duration,
}

/// Producer-side handle plus the shared dispatch machinery.
///
/// One instance per `start` cycle; the channel is not reusable once
/// closed, so a restart builds a fresh processor.
pub struct EventProcessor<D> {
    shared: Arc<ProcessorShared<D>>,
    tx: mpsc::Sender<ChangeEvent<D>>,
}

impl<D> Clone for EventProcessor<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<D: Send + Sync + 'static> EventProcessor<D> {
    /// Build a processor and the receiving half of its event channel.
    pub fn new(
        config: &ReplicationConfig,
        handler: Arc<dyn CacheHandler<D>>,
        tokens: Arc<ResumeTokenStore>,
        classifier: Arc<ErrorClassifier>,
        state: Arc<StateMachine>,
        events_processed: Arc<AtomicU64>,
    ) -> (Self, mpsc::Receiver<ChangeEvent<D>>) {
        let (tx, rx) = mpsc::channel(config.max_buffered_events.max(1));
        let shared = Arc::new(ProcessorShared {
            handler,
            tokens,
            classifier,
            state,
            events_processed,
            processing_timeout: config.event_processing_timeout,
        });
        (Self { shared, tx }, rx)
    }

    /// Spawn the consumer loop on the runtime.
    pub fn spawn(&self, rx: mpsc::Receiver<ChangeEvent<D>>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(Self::run(shared, rx))
    }

    async fn run(shared: Arc<ProcessorShared<D>>, mut rx: mpsc::Receiver<ChangeEvent<D>>) {
        let poll = poll_interval(shared.processing_timeout);
        info!(poll_ms = poll.as_millis() as u64, "Event processor started");

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    None => {
                        debug!("Event channel closed, processor exiting");
                        break;
                    }
                    Some(event) => {
                        if Self::process(&shared, event).await.is_break() {
                            break;
                        }
                    }
                },
                _ = tokio::time::sleep(poll) => {
                    // periodic state check while the channel is idle
                    if shared.state.current() == ConnectionState::Shutdown {
                        debug!("Shutdown observed, processor exiting");
                        break;
                    }
                }
            }
        }

        info!("Event processor exited");
    }

    /// Dispatch one event under the processing timeout and, on success,
    /// advance the resume tokens and event counter.
    async fn process(shared: &Arc<ProcessorShared<D>>, event: ChangeEvent<D>) -> ControlFlow<()> {
        let token = event.token.clone();
        let dispatched =
            tokio::time::timeout(shared.processing_timeout, Self::dispatch(shared, event, false))
                .await;

        match dispatched {
            Err(_) => {
                // timeouts are routine under load; the event is skipped
                warn!(
                    timeout_ms = shared.processing_timeout.as_millis() as u64,
                    "Event processing timed out"
                );
                ControlFlow::Continue(())
            }
            Ok(Ok(())) => {
                shared.tokens.advance(token);
                let count = shared.events_processed.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= EVENT_COUNT_WRAP {
                    shared.events_processed.store(0, Ordering::SeqCst);
                }
                shared.tokens.note_processed();
                ControlFlow::Continue(())
            }
            Ok(Err(e)) => {
                if shared.classifier.is_processor_stopping(&e) {
                    error!(error = %e, "Unrecoverable processing error, stopping event processor");
                    ControlFlow::Break(())
                } else {
                    warn!(error = %e, "Event processing failed, continuing");
                    ControlFlow::Continue(())
                }
            }
        }
    }

    /// Core event dispatch, shared by the normal and loss-recovery paths;
    /// `recovery` only affects logging.
    async fn dispatch(
        shared: &Arc<ProcessorShared<D>>,
        event: ChangeEvent<D>,
        recovery: bool,
    ) -> Result<()> {
        use ChangeOperation::*;

        match event.operation {
            op @ (Insert | Update | Replace) => {
                let Some(doc) = event.full_document else {
                    warn!(
                        operation = %op,
                        recovery,
                        "Change event missing full document, dropping from replication"
                    );
                    return Ok(());
                };
                let change = match op {
                    Insert => DocumentChange::Inserted,
                    Update => DocumentChange::Updated,
                    _ => DocumentChange::Replaced,
                };
                shared
                    .handler
                    .on_document_changed(doc, change)
                    .await
                    .map_err(|e| ReplicationError::Handler(e.to_string()))?;
            }
            Delete => {
                let Some(key_doc) = event.document_key else {
                    warn!(recovery, "Delete event missing document key, dropping");
                    return Ok(());
                };
                if let Some(id) = decode_document_id(&key_doc) {
                    shared
                        .handler
                        .on_document_deleted(&id)
                        .await
                        .map_err(|e| ReplicationError::Handler(e.to_string()))?;
                }
            }
            Drop => {
                warn!(recovery, "Backing collection dropped");
                shared.handler.on_collection_dropped().await;
            }
            Rename => {
                warn!(recovery, "Backing collection renamed");
                shared.handler.on_collection_renamed().await;
            }
            DropDatabase => {
                warn!(recovery, "Backing database dropped");
                shared.handler.on_database_dropped().await;
            }
            Invalidate => {
                warn!(recovery, "Change stream invalidated");
                shared.handler.on_stream_invalidated().await;
            }
            Unknown => {
                debug!(recovery, "Unknown change operation");
                shared.handler.on_unknown_operation().await;
            }
        }

        Ok(())
    }

    /// Hand an event from the stream collector to the processor.
    ///
    /// Returns `false` when the channel is closed and collection should
    /// stop. A full buffer is retried `FULL_BUFFER_RETRIES` times at
    /// `FULL_BUFFER_RETRY_DELAY`; if it stays full the event is
    /// dispatched directly (loss recovery) and any failure there is
    /// logged, never rethrown.
    pub async fn handle_incoming(&self, event: ChangeEvent<D>) -> bool {
        let mut event = event;
        for attempt in 0..=FULL_BUFFER_RETRIES {
            match self.tx.try_send(event) {
                Ok(()) => return true,
                Err(TrySendError::Closed(_)) => {
                    debug!("Event channel closed, stopping collection");
                    return false;
                }
                Err(TrySendError::Full(returned)) => {
                    event = returned;
                    if attempt < FULL_BUFFER_RETRIES {
                        tokio::time::sleep(FULL_BUFFER_RETRY_DELAY).await;
                    }
                }
            }
        }

        warn!(
            operation = %event.operation,
            "Event buffer full after retries, dispatching directly to preserve cache correctness"
        );
        if let Err(e) = Self::dispatch(&self.shared, event, true).await {
            warn!(error = %e, "Event-loss recovery dispatch failed");
        }
        true
    }
}

/// Idle tick for the consumer loop: a tenth of the processing timeout,
/// clamped so state checks stay responsive without busy-waiting.
fn poll_interval(processing_timeout: Duration) -> Duration {
    (processing_timeout / 10).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

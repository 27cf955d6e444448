//! StreamManager - lifecycle orchestration for change-stream replication
//!
//! Wires the token store, state machine, classifier and event processor
//! together: starts the collector and processor tasks, drives the retry
//! loop with classified backoff, repositions the stream along the token
//! fallback chain, and guarantees clean shutdown with job completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bson::Timestamp;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use lc_common::ReplicationConfig;

use crate::classifier::{Decision, ErrorClassifier};
use crate::error::ReplicationError;
use crate::handler::CacheHandler;
use crate::processor::EventProcessor;
use crate::source::{EventSource, EventStream};
use crate::state::{ConnectionState, StateMachine};
use crate::tokens::{ResumeTokenStore, StreamPosition};
use crate::Result;

/// Snapshot of replication health for monitoring surfaces.
#[derive(Debug, Clone)]
pub struct ReplicatorStats {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub events_processed: u64,
    pub reconnects: u64,
}

/// Orchestrates one replicated collection's change-stream subscription.
///
/// `start`/`stop` are idempotent and thread-safe; resume tokens survive a
/// stop/start cycle so resumption is gap-free where the oplog allows.
pub struct StreamManager<D> {
    config: ReplicationConfig,
    source: Arc<dyn EventSource<D>>,
    handler: Arc<dyn CacheHandler<D>>,
    tokens: Arc<ResumeTokenStore>,
    classifier: Arc<ErrorClassifier>,
    state: Arc<StateMachine>,
    /// Producer handle of the current cycle; dropped on stop so the event
    /// channel closes once the stream task lets go of its clone.
    processor: Mutex<Option<EventProcessor<D>>>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    events_processed: Arc<AtomicU64>,
    reconnects: AtomicU64,
}

impl<D: Send + Sync + 'static> StreamManager<D> {
    pub fn new(
        config: ReplicationConfig,
        source: Arc<dyn EventSource<D>>,
        handler: Arc<dyn CacheHandler<D>>,
    ) -> Self {
        let classifier = Arc::new(ErrorClassifier::new(&config));
        Self {
            config,
            source,
            handler,
            tokens: Arc::new(ResumeTokenStore::new()),
            classifier,
            state: Arc::new(StateMachine::new()),
            processor: Mutex::new(None),
            shutdown: Mutex::new(None),
            events_processed: Arc::new(AtomicU64::new(0)),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Begin replication.
    ///
    /// `start_at` is the cluster time captured before the caller's initial
    /// bulk load; when absent it is queried from the store. Rejected
    /// unless the manager is DISCONNECTED, FAILED or SHUTDOWN.
    pub async fn start(self: Arc<Self>, start_at: Option<Timestamp>) -> Result<()> {
        let _guard = self.state.lifecycle_lock().await;

        let observed = self.state.current();
        if !matches!(
            observed,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Shutdown
        ) {
            warn!(state = %observed, "Start rejected: manager already active");
            return Err(ReplicationError::InvalidState(format!(
                "cannot start from {observed}"
            )));
        }

        let moved = if observed == ConnectionState::Shutdown {
            // restart after a full stop; the table keeps SHUTDOWN terminal
            // for everything except this lock-guarded path
            self.state.force(ConnectionState::Connecting);
            true
        } else {
            self.state.transition_to(Some(observed), ConnectionState::Connecting)
        };
        if !moved {
            warn!("Start aborted: state changed concurrently");
            return Err(ReplicationError::InvalidState(
                "state changed during start".to_string(),
            ));
        }

        info!(start_at = ?start_at, "Starting stream manager");

        let start_time = match start_at {
            Some(ts) => Some(ts),
            None => match self.source.current_operation_time().await {
                Ok(ts) => Some(ts),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Could not capture operation time; positioning falls back to live tail"
                    );
                    None
                }
            },
        };
        if let Some(ts) = start_time {
            self.tokens.set_start_time(ts);
        }

        self.classifier.reset_failures();
        self.events_processed.store(0, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (processor, rx) = EventProcessor::new(
            &self.config,
            self.handler.clone(),
            self.tokens.clone(),
            self.classifier.clone(),
            self.state.clone(),
            self.events_processed.clone(),
        );
        let processor_handle = processor.spawn(rx);

        let manager = Arc::clone(&self);
        let stream_processor = processor.clone();
        let stream_handle = tokio::spawn(async move {
            manager.run_stream_loop(stream_processor, shutdown_rx).await;
        });

        self.state.register_jobs(stream_handle, processor_handle);
        *self.processor.lock() = Some(processor);
        *self.shutdown.lock() = Some(shutdown_tx);

        Ok(())
    }

    /// Stop replication and wait for both tasks to finish.
    ///
    /// Idempotent. Cleanup-critical failures (resource leaks, corruption)
    /// propagate; ordinary cleanup errors are logged and swallowed.
    /// Resume tokens are preserved for the next start.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.state.lifecycle_lock().await;

        if self.state.current() == ConnectionState::Shutdown {
            debug!("Stop ignored: already shut down");
            return Ok(());
        }

        info!("Stopping stream manager");
        self.state.transition_to(None, ConnectionState::Shutdown);

        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let _ = self.processor.lock().take();

        for e in self.state.cancel_jobs().await {
            if self.classifier.is_cleanup_critical(&e) {
                error!(error = %e, "Critical cleanup failure");
                self.state.clear_jobs_unsafe();
                return Err(e);
            }
            warn!(error = %e, "Cleanup error during stop");
        }

        info!("Stream manager stopped");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn last_error(&self) -> Option<Arc<ReplicationError>> {
        self.classifier.last_error()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.classifier.consecutive_failures()
    }

    /// True while either the collector or processor task is running.
    pub fn jobs_running(&self) -> bool {
        self.state.jobs_running()
    }

    /// The token store backing this manager; exposed so embedders can
    /// inspect or seed resume positions.
    pub fn token_store(&self) -> Arc<ResumeTokenStore> {
        self.tokens.clone()
    }

    pub fn stats(&self) -> ReplicatorStats {
        ReplicatorStats {
            state: self.state.current(),
            consecutive_failures: self.classifier.consecutive_failures(),
            events_processed: self.events_processed.load(Ordering::SeqCst),
            reconnects: self.reconnects.load(Ordering::SeqCst),
        }
    }

    async fn run_stream_loop(
        self: Arc<Self>,
        processor: EventProcessor<D>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut retry: u32 = 0;
        let mut failed = false;

        while self.state.current() != ConnectionState::Shutdown && retry < self.config.max_retries {
            match self.collect(&processor, &mut shutdown_rx).await {
                Ok(()) => {
                    info!("Change stream ended");
                    break;
                }
                Err(e) => {
                    if self.state.current() == ConnectionState::Shutdown {
                        break;
                    }
                    let err = Arc::new(e);
                    match self.classifier.decide(&err, retry) {
                        Decision::Stop => {
                            warn!(error = %err, retry, "Giving up on stream retries");
                            break;
                        }
                        Decision::StopWithError => {
                            error!(error = %err, "Fatal stream error");
                            self.enter_failed();
                            failed = true;
                            break;
                        }
                        Decision::RetryAfter(delay) => {
                            warn!(
                                error = %err,
                                retry,
                                delay_ms = delay.as_millis() as u64,
                                "Stream error, scheduling reconnect"
                            );
                            let cancelled = tokio::select! {
                                _ = tokio::time::sleep(delay) => false,
                                _ = shutdown_rx.recv() => true,
                            };
                            if cancelled {
                                break;
                            }

                            if self.classifier.is_resume_token_error(&err) {
                                self.tokens.handle_token_error();
                            }
                            if self.state.current() == ConnectionState::Connected {
                                self.handler.on_disconnected().await;
                            }
                            self.enter_reconnecting();
                            retry += 1;
                        }
                    }
                }
            }
        }

        if !failed {
            if retry >= self.config.max_retries {
                error!(retries = retry, "Retry budget exhausted");
                self.enter_failed();
            } else if self.state.current() != ConnectionState::Shutdown {
                self.state.force(ConnectionState::Disconnected);
            }
        }

        debug!("Stream task exited");
    }

    /// Iterate one opened stream until it errors, ends, or shutdown.
    async fn collect(
        &self,
        processor: &EventProcessor<D>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut stream = self.open_stream().await?;

        loop {
            if self.state.current() == ConnectionState::Shutdown {
                return Ok(());
            }

            let item = tokio::select! {
                item = stream.next() => item,
                _ = shutdown_rx.recv() => return Ok(()),
            };

            match item {
                None => return Ok(()),
                Some(Err(e)) => return Err(e),
                Some(Ok(event)) => {
                    let observed = self.state.current();
                    if matches!(
                        observed,
                        ConnectionState::Connecting | ConnectionState::Reconnecting
                    ) && self.state.transition_to(Some(observed), ConnectionState::Connected)
                    {
                        self.on_successful_connection(observed == ConnectionState::Reconnecting)
                            .await;
                    }

                    if !processor.handle_incoming(event).await {
                        warn!("Event channel closed, ending collection");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Open the stream at the best available position, falling back along
    /// the token chain when the store rejects a resume position.
    async fn open_stream(&self) -> Result<EventStream<D>> {
        let positions = self.tokens.positions();
        let last_index = positions.len() - 1;

        for (index, position) in positions.into_iter().enumerate() {
            match &position {
                StreamPosition::ResumeAfter(_) => {
                    debug!("Opening change stream from resume token");
                }
                StreamPosition::StartAtOperationTime(ts) => {
                    if index > 0 {
                        warn!(
                            time = ?ts,
                            "Token resume unavailable; replaying from start timestamp, a bounded gap is possible"
                        );
                    } else {
                        info!(time = ?ts, "Opening change stream from start timestamp");
                    }
                }
                StreamPosition::Latest => {
                    warn!("Opening change stream at current time; missed events are not replayed");
                }
            }

            match self.source.open(position).await {
                Ok(stream) => return Ok(stream),
                Err(e) if index < last_index && self.classifier.is_resume_token_error(&e) => {
                    warn!(error = %e, "Stream position rejected, trying next fallback");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ReplicationError::Stream(
            "no stream position was accepted".to_string(),
        ))
    }

    async fn on_successful_connection(&self, reconnect: bool) {
        self.classifier.reset_failures();
        if reconnect {
            let count = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
            info!(reconnects = count, "Change stream reconnected");
        } else {
            info!("Change stream connected");
        }
        self.handler.on_connected().await;
    }

    fn enter_failed(&self) {
        if self.state.current() != ConnectionState::Shutdown {
            self.state.transition_to(None, ConnectionState::Failed);
        }
    }

    fn enter_reconnecting(&self) {
        match self.state.current() {
            ConnectionState::Connected => {
                self.state
                    .transition_to(Some(ConnectionState::Connected), ConnectionState::Reconnecting);
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                // first connection attempt failed; keep showing a
                // reconnect in progress without widening the CAS table
                self.state.force(ConnectionState::Reconnecting);
            }
            _ => {}
        }
    }
}

//! StateMachine - connection lifecycle for the stream manager
//!
//! A single atomic holds the current state for lock-free reads and
//! CAS-style transitions; an async mutex serializes the composed
//! lifecycle operations (start, stop, cleanup). The state machine also
//! owns the two long-running tasks (stream collector and event
//! processor) so cleanup can join them.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::sync::MutexGuard;
use tracing::{debug, warn};

use crate::error::ReplicationError;

/// How long `cancel_jobs` waits for a task before aborting it.
const JOB_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state of a stream manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Failed = 4,
    Shutdown = 5,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> ConnectionState {
        match raw {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Shutdown,
        }
    }

    /// The legal transition table. `Shutdown` is terminal; `Failed` is
    /// recoverable only through an explicit restart.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, Connecting) | (Disconnected, Shutdown) => true,
            (Connecting, Connected) | (Connecting, Failed) | (Connecting, Shutdown) => true,
            (Connected, Reconnecting) | (Connected, Failed) | (Connected, Shutdown) => true,
            (Reconnecting, Connected) | (Reconnecting, Failed) | (Reconnecting, Shutdown) => true,
            (Failed, Connecting) | (Failed, Shutdown) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Failed => "FAILED",
            ConnectionState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Atomic connection state plus ownership of the long-running tasks.
pub struct StateMachine {
    state: AtomicU8,
    state_lock: tokio::sync::Mutex<()>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    processor_task: Mutex<Option<JoinHandle<()>>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            state_lock: tokio::sync::Mutex::new(()),
            stream_task: Mutex::new(None),
            processor_task: Mutex::new(None),
        }
    }

    pub fn current(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Transition to `next`, CAS-style when `expected` is given.
    ///
    /// Illegal transitions are rejected and logged; a transition to the
    /// current state is a silent no-op. Returns whether the state was
    /// moved (or already there).
    pub fn transition_to(&self, expected: Option<ConnectionState>, next: ConnectionState) -> bool {
        loop {
            let current = self.current();
            if let Some(expected) = expected {
                if current != expected {
                    debug!(
                        expected = %expected,
                        current = %current,
                        next = %next,
                        "State changed before CAS transition"
                    );
                    return false;
                }
            }
            if current == next {
                return true;
            }
            if !current.can_transition_to(next) {
                warn!(from = %current, to = %next, "Rejected illegal state transition");
                return false;
            }
            if self
                .state
                .compare_exchange(current as u8, next as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!(from = %current, to = %next, "Connection state transition");
                return true;
            }
            // lost the race, re-read and retry
        }
    }

    /// Unconditional set, bypassing the legality table.
    ///
    /// Reserved for the retry-loop moves the table omits: restart from
    /// SHUTDOWN, reconnect continuity after a failed first attempt, and
    /// the loop's exit to DISCONNECTED.
    pub(crate) fn force(&self, next: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(next as u8, Ordering::SeqCst));
        if previous != next {
            debug!(from = %previous, to = %next, "Forced connection state");
        }
    }

    /// Serializes composed lifecycle operations.
    pub async fn lifecycle_lock(&self) -> MutexGuard<'_, ()> {
        self.state_lock.lock().await
    }

    pub(crate) fn register_jobs(&self, stream: JoinHandle<()>, processor: JoinHandle<()>) {
        *self.stream_task.lock() = Some(stream);
        *self.processor_task.lock() = Some(processor);
    }

    /// True while either owned task is still running.
    pub fn jobs_running(&self) -> bool {
        let stream_alive = self
            .stream_task
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        let processor_alive = self
            .processor_task
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        stream_alive || processor_alive
    }

    /// Wait for both tasks to finish, aborting any that outlive the join
    /// timeout. Join failures are returned for the caller to classify.
    pub(crate) async fn cancel_jobs(&self) -> Vec<ReplicationError> {
        let handles = [
            ("stream", self.stream_task.lock().take()),
            ("processor", self.processor_task.lock().take()),
        ];

        let mut errors = Vec::new();
        for (name, handle) in handles {
            let Some(mut handle) = handle else { continue };
            match tokio::time::timeout(JOB_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    if join_error.is_cancelled() {
                        continue;
                    }
                    errors.push(ReplicationError::Task(format!(
                        "{name} task failed during cleanup: {join_error}"
                    )));
                }
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                    errors.push(ReplicationError::Task(format!(
                        "{name} task did not stop within {}s",
                        JOB_JOIN_TIMEOUT.as_secs()
                    )));
                }
            }
        }
        errors
    }

    /// Emergency path: drop task handles without joining, aborting both.
    /// Used when the state lock cannot be held long enough to join.
    pub(crate) fn clear_jobs_unsafe(&self) {
        if let Some(handle) = self.stream_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.processor_task.lock().take() {
            handle.abort();
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

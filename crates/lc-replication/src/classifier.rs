//! ErrorClassifier - failure taxonomy and retry pacing for the stream
//!
//! The driver reports most stream failures as opaque messages, so
//! classification is substring matching over the lowercased rendering.
//! Match sets are centralised here and unit-tested independently; unknown
//! errors are treated as recoverable (retry, not fatal).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use lc_common::{ReplicationConfig, BACKOFF_MULTIPLIER, JITTER_FACTOR, MAX_BACKOFF_EXPONENT};

use crate::error::ReplicationError;

/// Permanent failures: retrying cannot help, surface to the caller.
const FATAL_PATTERNS: &[&str] = &[
    "authentication",
    "authorization",
    "unauthorized",
    "not authorized",
    "change streams are only supported",
    "feature is not supported",
    "database not found",
    "collection not found",
    "ns not found",
];

/// Resume-position failures: the saved tokens must be discarded.
const RESUME_TOKEN_PATTERNS: &[&str] = &[
    "resume point may no longer be in the oplog",
    "invalid resume point",
    "resume token",
];

/// Failures that must propagate even during teardown.
const CLEANUP_CRITICAL_PATTERNS: &[&str] = &[
    "resource leak",
    "memory",
    "corruption",
    "deadlock",
    "interrupted",
];

/// Failures that make the event processor drain and exit its loop.
const PROCESSOR_STOPPING_PATTERNS: &[&str] = &[
    "serializ",
    "deserializ",
    "decode",
    "channel closed",
];

/// What the retry loop should do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Give up without marking the manager failed.
    Stop,
    /// Give up and enter FAILED; the error stays visible via `last_error`.
    StopWithError,
    /// Sleep for the given backoff, then reconnect.
    RetryAfter(Duration),
}

/// Classifies stream failures and tracks the consecutive-failure window.
pub struct ErrorClassifier {
    max_retries: u32,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<Arc<ReplicationError>>>,
}

impl ErrorClassifier {
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_retry_delay: config.initial_retry_delay,
            max_retry_delay: config.max_retry_delay,
            consecutive_failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Classify a failure and choose the retry action.
    ///
    /// Always records the failure first so `consecutive_failures` and
    /// `last_error` reflect it even when the decision is to stop. The
    /// caller performs the actual (cancellable) sleep.
    pub fn decide(&self, error: &Arc<ReplicationError>, retry_count: u32) -> Decision {
        self.record_failure(error);

        if self.is_fatal(error) {
            return Decision::StopWithError;
        }
        if retry_count >= self.max_retries {
            return Decision::Stop;
        }

        let delay = self.retry_delay(retry_count);
        debug!(retry = retry_count, delay_ms = delay.as_millis() as u64, "Scheduling stream retry");
        Decision::RetryAfter(delay)
    }

    pub fn record_failure(&self, error: &Arc<ReplicationError>) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock() = Some(error.clone());
    }

    /// Called after a successful (re)connection.
    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<Arc<ReplicationError>> {
        self.last_error.lock().clone()
    }

    pub fn is_fatal(&self, error: &ReplicationError) -> bool {
        let message = lowercased(error);
        FATAL_PATTERNS.iter().any(|p| message.contains(p))
    }

    /// True when the saved resume position is no longer usable.
    ///
    /// A bare "resume" mention is treated as token-invalidating: clearing
    /// a good token costs one timestamp-based reposition, keeping a bad
    /// one wedges the stream.
    pub fn is_resume_token_error(&self, error: &ReplicationError) -> bool {
        let message = lowercased(error);
        RESUME_TOKEN_PATTERNS.iter().any(|p| message.contains(p)) || message.contains("resume")
    }

    pub fn is_cleanup_critical(&self, error: &ReplicationError) -> bool {
        let message = lowercased(error);
        if message.contains("cancel") {
            return false;
        }
        CLEANUP_CRITICAL_PATTERNS.iter().any(|p| message.contains(p))
    }

    pub fn is_processor_stopping(&self, error: &ReplicationError) -> bool {
        let message = lowercased(error);
        PROCESSOR_STOPPING_PATTERNS.iter().any(|p| message.contains(p))
    }

    /// Exponential backoff with clamped exponent, delay cap and additive
    /// uniform jitter in `[0, delay * JITTER_FACTOR]`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(MAX_BACKOFF_EXPONENT);
        let base = self.initial_retry_delay.as_millis() as f64
            * BACKOFF_MULTIPLIER.powi(exponent as i32);
        let max = self.max_retry_delay.as_millis() as f64;
        let capped = if base.is_finite() { base.min(max) } else { max };

        let jitter = if capped > 0.0 {
            rand::rng().random_range(0.0..=capped * JITTER_FACTOR)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter) as u64)
    }
}

fn lowercased(error: &ReplicationError) -> String {
    error.to_string().to_lowercase()
}

//! ResumeTokenStore - stream positioning hints across reconnects
//!
//! Remembers the last two successfully processed resume tokens plus the
//! effective start timestamp captured before the initial cache load, and
//! produces the positioning fallback chain used when (re)opening the
//! stream: current token, previous token, start timestamp, live tail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bson::{Bson, Timestamp};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Drop the previous token after this many processed events...
const MAINTENANCE_EVENT_INTERVAL: u64 = 1_000;
/// ...but only when at least this long has passed since the last sweep.
const MAINTENANCE_MIN_PERIOD: Duration = Duration::from_secs(300);

/// Opaque change-stream position issued by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct EventToken(Bson);

impl EventToken {
    pub fn new(raw: Bson) -> Self {
        EventToken(raw)
    }

    pub fn raw(&self) -> &Bson {
        &self.0
    }

    pub fn into_raw(self) -> Bson {
        self.0
    }
}

/// Where to position the change stream when opening it.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPosition {
    /// Resume immediately after a previously processed event.
    ResumeAfter(EventToken),
    /// Replay from a cluster timestamp.
    StartAtOperationTime(Timestamp),
    /// Tail from now, accepting a possible gap.
    Latest,
}

#[derive(Default)]
struct TokenPair {
    current: Option<EventToken>,
    previous: Option<EventToken>,
}

/// Holds the resume-token pair and the effective start timestamp.
///
/// Tokens advance only after an event has been successfully dispatched to
/// the cache handler; an event in flight never touches the store.
pub struct ResumeTokenStore {
    tokens: Mutex<TokenPair>,
    start_time: Mutex<Option<Timestamp>>,
    processed_since_maintenance: AtomicU64,
    last_maintenance: Mutex<Instant>,
    maintenance_events: u64,
    maintenance_period: Duration,
}

impl ResumeTokenStore {
    pub fn new() -> Self {
        Self::with_maintenance(MAINTENANCE_EVENT_INTERVAL, MAINTENANCE_MIN_PERIOD)
    }

    /// Custom maintenance cadence; used by tests.
    pub fn with_maintenance(events: u64, period: Duration) -> Self {
        Self {
            tokens: Mutex::new(TokenPair::default()),
            start_time: Mutex::new(None),
            processed_since_maintenance: AtomicU64::new(0),
            last_maintenance: Mutex::new(Instant::now()),
            maintenance_events: events,
            maintenance_period: period,
        }
    }

    /// Record the cluster time captured before the initial bulk load.
    pub fn set_start_time(&self, timestamp: Timestamp) {
        *self.start_time.lock() = Some(timestamp);
    }

    pub fn start_time(&self) -> Option<Timestamp> {
        *self.start_time.lock()
    }

    /// Shift the pair after a successful dispatch:
    /// `previous := current; current := token`.
    pub fn advance(&self, token: EventToken) {
        let mut pair = self.tokens.lock();
        pair.previous = pair.current.take();
        pair.current = Some(token);
    }

    pub fn current(&self) -> Option<EventToken> {
        self.tokens.lock().current.clone()
    }

    pub fn previous(&self) -> Option<EventToken> {
        self.tokens.lock().previous.clone()
    }

    /// Discard both tokens after a resume-position failure.
    ///
    /// The start timestamp is deliberately preserved so the next
    /// connection can still bound the replication gap. Idempotent.
    pub fn handle_token_error(&self) {
        let mut pair = self.tokens.lock();
        if pair.current.is_some() || pair.previous.is_some() {
            info!("Clearing resume tokens after resume-position failure");
        }
        pair.current = None;
        pair.previous = None;
    }

    /// The positioning fallback chain, best hint first. Always ends with
    /// [`StreamPosition::Latest`].
    pub fn positions(&self) -> Vec<StreamPosition> {
        let pair = self.tokens.lock();
        let mut chain = Vec::with_capacity(4);
        if let Some(current) = &pair.current {
            chain.push(StreamPosition::ResumeAfter(current.clone()));
        }
        if let Some(previous) = &pair.previous {
            chain.push(StreamPosition::ResumeAfter(previous.clone()));
        }
        if let Some(ts) = *self.start_time.lock() {
            chain.push(StreamPosition::StartAtOperationTime(ts));
        }
        chain.push(StreamPosition::Latest);
        chain
    }

    /// Bookkeeping after a successfully processed event.
    ///
    /// Every `maintenance_events` processed events, and no more often than
    /// `maintenance_period`, the previous token is dropped so token memory
    /// stays bounded.
    pub fn note_processed(&self) {
        let processed = self.processed_since_maintenance.fetch_add(1, Ordering::SeqCst) + 1;
        if processed < self.maintenance_events {
            return;
        }

        let mut last = self.last_maintenance.lock();
        if last.elapsed() < self.maintenance_period {
            return;
        }

        self.processed_since_maintenance.store(0, Ordering::SeqCst);
        *last = Instant::now();
        drop(last);

        let mut pair = self.tokens.lock();
        if pair.previous.take().is_some() {
            debug!("Token maintenance dropped previous resume token");
        }
    }
}

impl Default for ResumeTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn token(tag: &str) -> EventToken {
        EventToken::new(Bson::Document(doc! { "_data": tag }))
    }

    #[test]
    fn advance_shifts_pair() {
        let store = ResumeTokenStore::new();
        assert_eq!(store.current(), None);

        store.advance(token("t1"));
        assert_eq!(store.current(), Some(token("t1")));
        assert_eq!(store.previous(), None);

        store.advance(token("t2"));
        assert_eq!(store.current(), Some(token("t2")));
        assert_eq!(store.previous(), Some(token("t1")));

        store.advance(token("t3"));
        assert_eq!(store.current(), Some(token("t3")));
        assert_eq!(store.previous(), Some(token("t2")));
    }

    #[test]
    fn token_error_clears_tokens_not_start_time() {
        let store = ResumeTokenStore::new();
        let ts = Timestamp { time: 42, increment: 7 };
        store.set_start_time(ts);
        store.advance(token("t1"));
        store.advance(token("t2"));

        store.handle_token_error();
        assert_eq!(store.current(), None);
        assert_eq!(store.previous(), None);
        assert_eq!(store.start_time(), Some(ts));

        // clearing twice is a no-op
        store.handle_token_error();
        assert_eq!(store.current(), None);
    }

    #[test]
    fn fallback_chain_ordering() {
        let store = ResumeTokenStore::new();
        assert_eq!(store.positions(), vec![StreamPosition::Latest]);

        let ts = Timestamp { time: 1, increment: 0 };
        store.set_start_time(ts);
        assert_eq!(
            store.positions(),
            vec![StreamPosition::StartAtOperationTime(ts), StreamPosition::Latest]
        );

        store.advance(token("t1"));
        store.advance(token("t2"));
        assert_eq!(
            store.positions(),
            vec![
                StreamPosition::ResumeAfter(token("t2")),
                StreamPosition::ResumeAfter(token("t1")),
                StreamPosition::StartAtOperationTime(ts),
                StreamPosition::Latest,
            ]
        );
    }

    #[test]
    fn maintenance_drops_previous_token() {
        let store = ResumeTokenStore::with_maintenance(2, Duration::ZERO);
        store.advance(token("t1"));
        store.advance(token("t2"));

        store.note_processed();
        assert_eq!(store.previous(), Some(token("t1")));

        store.note_processed();
        assert_eq!(store.previous(), None);
        assert_eq!(store.current(), Some(token("t2")));
    }

    #[test]
    fn maintenance_respects_min_period() {
        let store = ResumeTokenStore::with_maintenance(1, Duration::from_secs(3600));
        store.advance(token("t1"));
        store.advance(token("t2"));

        store.note_processed();
        // event threshold reached but the period has not elapsed
        assert_eq!(store.previous(), Some(token("t1")));
    }
}

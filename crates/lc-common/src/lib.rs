use std::time::Duration;

pub mod logging;

// ============================================================================
// Shared Constants
// ============================================================================

/// Cap on the exponent used for stream reconnect backoff.
pub const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Multiplier applied per retry when computing reconnect backoff.
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Fraction of the computed delay added as uniform random jitter.
pub const JITTER_FACTOR: f64 = 0.25;

/// Upper bound on optimistic-versioning attempts per update.
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 50;

/// The processed-event counter wraps to zero at this value.
pub const EVENT_COUNT_WRAP: u64 = i64::MAX as u64 - 1;

// ============================================================================
// Document Model
// ============================================================================

/// A cacheable document with a stable key and an optimistic version.
///
/// The replication core never interprets document contents; it only needs
/// the key (mirrors the store's `_id`) and the version used for
/// compare-and-swap writes.
pub trait Document: Clone + Send + Sync + 'static {
    /// Stable identity of this document within its cache.
    fn key(&self) -> &str;

    /// Optimistic concurrency version. Incremented once per committed update.
    fn version(&self) -> i64;

    /// Overwrite the version. Called by the update executor after applying
    /// an update closure.
    fn set_version(&mut self, version: i64);
}

/// Write-through seam into the process-local cache.
///
/// The update executor calls this after a successful commit so readers see
/// the new revision without waiting for the change stream to echo it back.
pub trait CacheWriter<D>: Send + Sync {
    fn put(&self, doc: D);
}

/// Optional document validation applied before a versioned write.
///
/// Requests flagged with `bypass_validation` skip this hook entirely.
pub trait DocumentValidator<D>: Send + Sync {
    fn validate(&self, doc: &D) -> Result<(), String>;
}

// ============================================================================
// Operation Results
// ============================================================================

/// Outcome of a cache operation as seen by application code.
///
/// `Empty` is used by optional reads that found nothing; `Reject` is
/// produced when a rejectable update closure declines to write.
#[derive(Debug)]
pub enum CacheResult<T> {
    Success(T),
    Empty,
    Failure(anyhow::Error),
    Reject,
}

impl<T> CacheResult<T> {
    pub fn failure<E: Into<anyhow::Error>>(error: E) -> Self {
        CacheResult::Failure(error.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CacheResult::Success(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CacheResult::Empty)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CacheResult::Failure(_))
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, CacheResult::Reject)
    }

    /// The success value, if any.
    pub fn ok(self) -> Option<T> {
        match self {
            CacheResult::Success(v) => Some(v),
            _ => None,
        }
    }

    /// Map the success value, passing every other variant through.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> CacheResult<U> {
        match self {
            CacheResult::Success(v) => CacheResult::Success(f(v)),
            CacheResult::Empty => CacheResult::Empty,
            CacheResult::Failure(e) => CacheResult::Failure(e),
            CacheResult::Reject => CacheResult::Reject,
        }
    }

    /// The success value, panicking on any other variant. Test helper.
    pub fn unwrap(self) -> T {
        match self {
            CacheResult::Success(v) => v,
            CacheResult::Empty => panic!("called unwrap on CacheResult::Empty"),
            CacheResult::Failure(e) => panic!("called unwrap on CacheResult::Failure: {e}"),
            CacheResult::Reject => panic!("called unwrap on CacheResult::Reject"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tuning for the change-stream replication pipeline.
///
/// All values are fixed at construction; the manager never re-reads them
/// after `start`.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Capacity of the bounded event channel between the stream collector
    /// and the event processor.
    pub max_buffered_events: usize,
    /// Reconnect attempts before the manager gives up and enters FAILED.
    pub max_retries: u32,
    /// First reconnect delay; doubled per retry up to `max_retry_delay`.
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Budget for dispatching a single change event to the cache handler.
    pub event_processing_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_buffered_events: 1024,
            max_retries: 10,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            event_processing_timeout: Duration::from_secs(30),
        }
    }
}

impl ReplicationConfig {
    /// Defaults with `LIVECACHE_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_env("LIVECACHE_MAX_BUFFERED_EVENTS", &mut config.max_buffered_events);
        apply_env("LIVECACHE_MAX_RETRIES", &mut config.max_retries);
        apply_env_duration("LIVECACHE_INITIAL_RETRY_DELAY_MS", &mut config.initial_retry_delay);
        apply_env_duration("LIVECACHE_MAX_RETRY_DELAY_MS", &mut config.max_retry_delay);
        apply_env_duration("LIVECACHE_EVENT_TIMEOUT_MS", &mut config.event_processing_timeout);
        config
    }
}

/// Tuning for the per-key update serializer.
#[derive(Debug, Clone)]
pub struct SerializerConfig {
    /// Capacity of each per-key update queue.
    pub max_queued_updates: usize,
    /// How long `shutdown` waits for a queue to drain before aborting it.
    pub shutdown_timeout: Duration,
    /// Interval of the idle-queue cleanup task.
    pub cleanup_interval: Duration,
    /// Queues idle at least this long are shut down by the cleanup task.
    pub idle_timeout: Duration,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            max_queued_updates: 200,
            shutdown_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl SerializerConfig {
    /// Defaults with `LIVECACHE_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_env("LIVECACHE_MAX_QUEUED_UPDATES", &mut config.max_queued_updates);
        apply_env_duration("LIVECACHE_SERIALIZER_SHUTDOWN_TIMEOUT_MS", &mut config.shutdown_timeout);
        apply_env_duration("LIVECACHE_QUEUE_CLEANUP_INTERVAL_MS", &mut config.cleanup_interval);
        apply_env_duration("LIVECACHE_QUEUE_IDLE_TIMEOUT_MS", &mut config.idle_timeout);
        config
    }
}

fn apply_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(var = name, value = %raw, "Ignoring unparseable env override"),
        }
    }
}

fn apply_env_duration(name: &str, slot: &mut Duration) {
    let mut millis = slot.as_millis() as u64;
    apply_env(name, &mut millis);
    *slot = Duration::from_millis(millis);
}

//! DocumentStore - transactional seam for versioned document writes
//!
//! The update executor drives optimistic versioning through this trait so
//! the CAS loop is testable without a live database. The MongoDB binding
//! lives in [`crate::mongo`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Store-level failures with the conflict classes the CAS loop reacts to
/// pulled out of the driver's error shape.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The storage transaction aborted on a write-write race; the data
    /// read is not stale, the attempt just has to be replayed.
    #[error("write conflict")]
    WriteConflict,

    /// A unique index rejected the write.
    #[error("duplicate unique index value")]
    DuplicateKey,

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("{0}")]
    Other(String),
}

/// Factory for storage transactions plus pacing hints.
#[async_trait]
pub trait DocumentStore<D>: Send + Sync {
    /// Open a transaction. Every fetch/replace inside the CAS loop runs
    /// through the returned handle.
    async fn transaction(&self) -> Result<Box<dyn StoreTransaction<D>>, StoreError>;

    /// Rolling average round-trip to the store, used to scale CAS retry
    /// delays. Connection monitoring itself lives outside this crate.
    fn average_ping(&self) -> Duration {
        Duration::from_millis(1)
    }
}

/// One storage transaction. Dropped without `commit`, it must leave the
/// store unchanged.
#[async_trait]
pub trait StoreTransaction<D>: Send {
    async fn find_by_key(&mut self, key: &str) -> Result<Option<D>, StoreError>;

    /// Replace the document only if its stored version equals
    /// `expected_version`. Returns the modified count: zero means another
    /// writer won the race.
    async fn replace_versioned(
        &mut self,
        key: &str,
        expected_version: i64,
        doc: &D,
    ) -> Result<u64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn abort(&mut self) -> Result<(), StoreError>;
}

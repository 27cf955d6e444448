//! CacheHandler - callbacks from the replication pipeline into the cache
//!
//! Implemented by the in-memory cache layer. Handler failures are logged
//! by the event processor and never tear down the stream.

use async_trait::async_trait;

/// How a replicated document changed in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentChange {
    Inserted,
    Updated,
    Replaced,
}

/// Receives replicated mutations and connection lifecycle notifications.
///
/// The structural callbacks default to no-ops; most caches only care
/// about document changes and deletions.
#[async_trait]
pub trait CacheHandler<D>: Send + Sync {
    /// A document was inserted, updated or replaced; `doc` is the
    /// post-image from the store.
    async fn on_document_changed(&self, doc: D, change: DocumentChange) -> anyhow::Result<()>;

    /// A document was deleted; `id` is the decoded `_id`.
    async fn on_document_deleted(&self, id: &str) -> anyhow::Result<()>;

    /// The backing collection was dropped.
    async fn on_collection_dropped(&self) {}

    /// The backing collection was renamed.
    async fn on_collection_renamed(&self) {}

    /// The backing database was dropped.
    async fn on_database_dropped(&self) {}

    /// The change stream was invalidated by the store.
    async fn on_stream_invalidated(&self) {}

    /// The driver yielded an operation this core does not model.
    async fn on_unknown_operation(&self) {}

    /// The stream (re)connected and events are flowing.
    async fn on_connected(&self) {}

    /// The stream lost its connection; a reconnect follows.
    async fn on_disconnected(&self) {}
}

//! EventSource - the seam between the replication core and the driver
//!
//! The stream manager consumes change events through this trait so the
//! core stays testable without a live database. The MongoDB
//! implementation lives in [`crate::mongo`].

use std::pin::Pin;

use async_trait::async_trait;
use bson::{Bson, Document as BsonDocument, Timestamp};
use futures::Stream;
use tracing::warn;

use crate::tokens::{EventToken, StreamPosition};
use crate::Result;

/// Kind of mutation reported by the change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    Invalidate,
    /// Anything the driver reports that this core does not model.
    Unknown,
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Replace => "replace",
            ChangeOperation::Delete => "delete",
            ChangeOperation::Drop => "drop",
            ChangeOperation::Rename => "rename",
            ChangeOperation::DropDatabase => "dropDatabase",
            ChangeOperation::Invalidate => "invalidate",
            ChangeOperation::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A decoded change-stream event.
#[derive(Debug, Clone)]
pub struct ChangeEvent<D> {
    pub operation: ChangeOperation,
    /// Post-image of the document; present for insert/update/replace when
    /// full-document lookup is enabled on the stream.
    pub full_document: Option<D>,
    /// Raw `documentKey` of the event, carrying `_id`.
    pub document_key: Option<BsonDocument>,
    /// Resume position immediately after this event.
    pub token: EventToken,
}

pub type EventStream<D> = Pin<Box<dyn Stream<Item = Result<ChangeEvent<D>>> + Send>>;

/// Produces change-event streams positioned by the token store's
/// fallback chain.
#[async_trait]
pub trait EventSource<D>: Send + Sync {
    /// Open a change stream at the given position. A position the store
    /// refuses (stale or corrupt token) surfaces as an error the caller
    /// classifies to fall back along the chain.
    async fn open(&self, position: StreamPosition) -> Result<EventStream<D>>;

    /// Current cluster time, captured before the initial bulk load to
    /// bound the replication gap.
    async fn current_operation_time(&self) -> Result<Timestamp>;
}

/// Decode the `_id` of a `documentKey` into the cache key space.
///
/// Accepts ObjectId (rendered as hex), strings and 32/64-bit integers;
/// anything else is logged and dropped from replication.
pub fn decode_document_id(document_key: &BsonDocument) -> Option<String> {
    match document_key.get("_id") {
        Some(Bson::ObjectId(oid)) => Some(oid.to_hex()),
        Some(Bson::String(s)) => Some(s.clone()),
        Some(Bson::Int32(i)) => Some(i.to_string()),
        Some(Bson::Int64(i)) => Some(i.to_string()),
        other => {
            warn!(id = ?other, "Unsupported _id type in delete event, dropping");
            None
        }
    }
}

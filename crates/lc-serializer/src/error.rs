use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced to callers of the update serializer.
#[derive(Error, Debug)]
pub enum SerializerError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("duplicate unique index value")]
    DuplicateUniqueIndex,

    #[error("update gave up after {0} optimistic attempts")]
    TransactionRetriesExceeded(u32),

    #[error("illegal update: {0}")]
    IllegalUpdate(String),

    #[error("update validation failed: {0}")]
    Validation(String),

    #[error("update queue full for {0}")]
    QueueFull(String),

    #[error("update queue is shut down")]
    QueueClosed,

    #[error("update cancelled during shutdown")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

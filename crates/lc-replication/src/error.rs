use thiserror::Error;

/// Errors surfaced by the replication pipeline.
///
/// The driver does not expose structured codes for most stream failures,
/// so classification happens over the rendered message (see
/// [`crate::classifier::ErrorClassifier`]); keep `Display` text stable.
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("change stream error: {0}")]
    Stream(String),

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("event decode error: {0}")]
    Decode(String),

    #[error("cache handler error: {0}")]
    Handler(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("stream task failed: {0}")]
    Task(String),
}

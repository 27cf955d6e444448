//! LiveCache Update Serializer
//!
//! Per-document-key FIFO update queues over an optimistic-versioning
//! store:
//! - UpdateSerializer: dispatcher owning all per-key queues + idle cleanup
//! - UpdateQueue: bounded FIFO channel with a dedicated worker per key
//! - UpdateExecutor: transactional compare-and-swap retry loop
//! - MongoDocumentStore: driver binding for the DocumentStore seam

pub mod error;
pub mod executor;
pub mod mongo;
pub mod queue;
pub mod registry;
pub mod store;

pub use error::SerializerError;
pub use executor::{UpdateExecutor, UpdateFn, UpdateOutcome};
pub use mongo::MongoDocumentStore;
pub use queue::{QueueKey, UpdateQueue};
pub use registry::UpdateSerializer;
pub use store::{DocumentStore, StoreError, StoreTransaction};

pub type Result<T> = std::result::Result<T, SerializerError>;

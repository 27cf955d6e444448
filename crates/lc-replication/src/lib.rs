//! LiveCache Change-Stream Replication Core
//!
//! Keeps a process-local document cache coherent with a MongoDB-backed
//! store by consuming its change stream:
//! - StreamManager: start/stop lifecycle, retry loop, stream positioning
//! - EventProcessor: bounded-buffer consumer with loss recovery
//! - ResumeTokenStore: token fallback chain across reconnects
//! - StateMachine: atomic connection state with a legality table
//! - ErrorClassifier: message-based failure taxonomy and backoff
//! - MongoEventSource: driver binding for the EventSource seam

pub mod classifier;
pub mod error;
pub mod handler;
pub mod manager;
pub mod mongo;
pub mod processor;
pub mod source;
pub mod state;
pub mod tokens;

pub use classifier::{Decision, ErrorClassifier};
pub use error::ReplicationError;
pub use handler::{CacheHandler, DocumentChange};
pub use manager::{ReplicatorStats, StreamManager};
pub use mongo::MongoEventSource;
pub use processor::EventProcessor;
pub use source::{ChangeEvent, ChangeOperation, EventSource, EventStream};
pub use state::{ConnectionState, StateMachine};
pub use tokens::{EventToken, ResumeTokenStore, StreamPosition};

pub type Result<T> = std::result::Result<T, ReplicationError>;

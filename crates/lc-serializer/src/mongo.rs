//! MongoDB DocumentStore Implementation
//!
//! Binds the transactional store seam to MongoDB sessions. Conflict
//! classes the CAS loop reacts to (write conflict 112, duplicate key
//! 11000/11001) are lifted out of the driver's error shape here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::doc;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, ClientSession, Collection};
use serde::de::DeserializeOwned;
use serde::Serialize;

use lc_common::Document;

use crate::store::{DocumentStore, StoreError, StoreTransaction};

const WRITE_CONFLICT_CODE: i32 = 112;
const DUPLICATE_KEY_CODES: [i32; 2] = [11000, 11001];

/// Versioned document store backed by a MongoDB collection.
///
/// Requires a replica-set deployment; every update runs in a
/// multi-document transaction.
pub struct MongoDocumentStore<D>
where
    D: Send + Sync,
{
    client: Client,
    collection: Collection<D>,
    /// Rolling average round-trip in nanoseconds, fed by whatever
    /// connection monitoring the embedding service runs.
    average_ping_nanos: Arc<AtomicU64>,
}

impl<D> MongoDocumentStore<D>
where
    D: Document + Serialize + DeserializeOwned + Unpin,
{
    pub fn new(client: Client, database: &str, collection: &str) -> Self {
        let collection = client.database(database).collection::<D>(collection);
        Self {
            client,
            collection,
            average_ping_nanos: Arc::new(AtomicU64::new(1_000_000)),
        }
    }

    /// Feed the latest ping average into CAS retry pacing.
    pub fn set_average_ping(&self, ping: Duration) {
        self.average_ping_nanos
            .store(ping.as_nanos() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl<D> DocumentStore<D> for MongoDocumentStore<D>
where
    D: Document + Serialize + DeserializeOwned + Unpin,
{
    async fn transaction(&self) -> Result<Box<dyn StoreTransaction<D>>, StoreError> {
        let mut session = self.client.start_session().await.map_err(map_store_error)?;
        session
            .start_transaction()
            .await
            .map_err(map_store_error)?;
        Ok(Box::new(MongoStoreTransaction {
            session,
            collection: self.collection.clone(),
        }))
    }

    fn average_ping(&self) -> Duration {
        Duration::from_nanos(self.average_ping_nanos.load(Ordering::SeqCst).max(1))
    }
}

struct MongoStoreTransaction<D>
where
    D: Send + Sync,
{
    session: ClientSession,
    collection: Collection<D>,
}

#[async_trait]
impl<D> StoreTransaction<D> for MongoStoreTransaction<D>
where
    D: Document + Serialize + DeserializeOwned + Unpin,
{
    async fn find_by_key(&mut self, key: &str) -> Result<Option<D>, StoreError> {
        self.collection
            .find_one(doc! { "_id": key })
            .session(&mut self.session)
            .await
            .map_err(map_store_error)
    }

    async fn replace_versioned(
        &mut self,
        key: &str,
        expected_version: i64,
        doc: &D,
    ) -> Result<u64, StoreError> {
        let result = self
            .collection
            .replace_one(doc! { "_id": key, "version": expected_version }, doc)
            .session(&mut self.session)
            .await
            .map_err(map_store_error)?;
        Ok(result.modified_count)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.session
            .commit_transaction()
            .await
            .map_err(map_store_error)
    }

    async fn abort(&mut self) -> Result<(), StoreError> {
        self.session
            .abort_transaction()
            .await
            .map_err(map_store_error)
    }
}

fn map_store_error(error: mongodb::error::Error) -> StoreError {
    match error_code(&error) {
        Some(WRITE_CONFLICT_CODE) => StoreError::WriteConflict,
        Some(code) if DUPLICATE_KEY_CODES.contains(&code) => StoreError::DuplicateKey,
        _ => StoreError::Database(error),
    }
}

fn error_code(error: &mongodb::error::Error) -> Option<i32> {
    match error.kind.as_ref() {
        ErrorKind::Command(command_error) => Some(command_error.code),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => Some(write_error.code),
        _ => None,
    }
}

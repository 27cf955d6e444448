//! MongoDB EventSource Implementation
//!
//! Maps the driver's change-stream API onto the replication core's
//! [`EventSource`] seam: full-document lookup is always enabled so update
//! events carry the post-image, and stream positions translate to
//! `resume_after` / `start_at_operation_time`.

use async_trait::async_trait;
use bson::{doc, Timestamp};
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::{Client, Collection};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::ReplicationError;
use crate::source::{ChangeEvent, ChangeOperation, EventSource, EventStream};
use crate::tokens::{EventToken, StreamPosition};
use crate::Result;

/// Change-stream source backed by a MongoDB collection.
pub struct MongoEventSource<D>
where
    D: Send + Sync,
{
    client: Client,
    collection: Collection<D>,
}

impl<D> MongoEventSource<D>
where
    D: DeserializeOwned + Unpin + Send + Sync + 'static,
{
    pub fn new(client: Client, database: &str, collection: &str) -> Self {
        let collection = client.database(database).collection::<D>(collection);
        Self { client, collection }
    }

    fn options_for(position: StreamPosition) -> Result<ChangeStreamOptions> {
        let mut options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();

        match position {
            StreamPosition::ResumeAfter(token) => {
                let token = bson::from_bson::<ResumeToken>(token.into_raw())
                    .map_err(|e| ReplicationError::Decode(format!("resume token: {e}")))?;
                options.resume_after = Some(token);
            }
            StreamPosition::StartAtOperationTime(ts) => {
                options.start_at_operation_time = Some(ts);
            }
            StreamPosition::Latest => {}
        }

        Ok(options)
    }
}

fn map_event<D>(event: ChangeStreamEvent<D>) -> Result<ChangeEvent<D>> {
    let operation = match event.operation_type {
        OperationType::Insert => ChangeOperation::Insert,
        OperationType::Update => ChangeOperation::Update,
        OperationType::Replace => ChangeOperation::Replace,
        OperationType::Delete => ChangeOperation::Delete,
        OperationType::Drop => ChangeOperation::Drop,
        OperationType::Rename => ChangeOperation::Rename,
        OperationType::DropDatabase => ChangeOperation::DropDatabase,
        OperationType::Invalidate => ChangeOperation::Invalidate,
        _ => ChangeOperation::Unknown,
    };

    let token = bson::to_bson(&event.id)
        .map_err(|e| ReplicationError::Decode(format!("resume token: {e}")))?;

    Ok(ChangeEvent {
        operation,
        full_document: event.full_document,
        document_key: event.document_key,
        token: EventToken::new(token),
    })
}

#[async_trait]
impl<D> EventSource<D> for MongoEventSource<D>
where
    D: DeserializeOwned + Unpin + Send + Sync + 'static,
{
    async fn open(&self, position: StreamPosition) -> Result<EventStream<D>> {
        let options = Self::options_for(position)?;
        let stream = self.collection.watch().with_options(options).await?;

        debug!(
            namespace = %self.collection.namespace(),
            "Change stream opened"
        );

        Ok(Box::pin(stream.map(|item| match item {
            Ok(event) => map_event(event),
            Err(e) => Err(ReplicationError::from(e)),
        })))
    }

    async fn current_operation_time(&self) -> Result<Timestamp> {
        let reply = self
            .client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;

        reply
            .get_timestamp("operationTime")
            .map_err(|e| ReplicationError::Decode(format!("operationTime missing from reply: {e}")))
    }
}

//! UpdateExecutor - optimistic-versioning update loop
//!
//! Applies an update closure to the stored document under a transaction,
//! writing back only when the stored version still matches the one read.
//! Races and write conflicts are replayed with ping-scaled backoff, up to
//! `MAX_TRANSACTION_ATTEMPTS`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use lc_common::{CacheWriter, Document, DocumentValidator, MAX_TRANSACTION_ATTEMPTS};

use crate::error::SerializerError;
use crate::store::{DocumentStore, StoreError, StoreTransaction};
use crate::Result;

/// Update closure applied to the current stored document. Returning
/// `None` rejects the update without writing.
pub type UpdateFn<D> = Arc<dyn Fn(&D) -> Option<D> + Send + Sync>;

/// Result of a single serialized update.
#[derive(Debug)]
pub enum UpdateOutcome<D> {
    Updated(D),
    Rejected,
}

const CAS_RETRY_MIN_MS: f64 = 50.0;
const CAS_RETRY_MAX_MS: f64 = 2000.0;
const CAS_BACKOFF_GROWTH: f64 = 1.5;
const CAS_JITTER: f64 = 0.25;

/// Executes versioned updates against the store with CAS retry.
pub struct UpdateExecutor<D> {
    store: Arc<dyn DocumentStore<D>>,
    cache: Option<Arc<dyn CacheWriter<D>>>,
    validator: Option<Arc<dyn DocumentValidator<D>>>,
}

impl<D: Document> UpdateExecutor<D> {
    pub fn new(store: Arc<dyn DocumentStore<D>>) -> Self {
        Self {
            store,
            cache: None,
            validator: None,
        }
    }

    /// Write committed revisions through to the local cache.
    pub fn with_cache(mut self, cache: Arc<dyn CacheWriter<D>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate updated documents before they are written. Skipped for
    /// requests that set `bypass_validation`.
    pub fn with_validator(mut self, validator: Arc<dyn DocumentValidator<D>>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Run the CAS loop for one update request.
    pub async fn execute(
        &self,
        key: &str,
        update_fn: &UpdateFn<D>,
        bypass_validation: bool,
    ) -> Result<UpdateOutcome<D>> {
        let mut attempt: u32 = 0;

        loop {
            if attempt >= MAX_TRANSACTION_ATTEMPTS {
                warn!(key, attempts = attempt, "Update exhausted optimistic retries");
                return Err(SerializerError::TransactionRetriesExceeded(attempt));
            }
            if attempt > 0 {
                tokio::time::sleep(cas_retry_delay(attempt, self.store.average_ping())).await;
            }

            match self.try_once(key, update_fn, bypass_validation).await {
                Ok(outcome) => return Ok(outcome),
                Err(SerializerError::Store(StoreError::WriteConflict)) => {
                    debug!(key, attempt, "Versioned write contended, retrying");
                    attempt += 1;
                }
                Err(SerializerError::Store(StoreError::DuplicateKey)) => {
                    return Err(SerializerError::DuplicateUniqueIndex);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One transactional attempt: fetch, apply, validate, versioned
    /// replace, commit.
    async fn try_once(
        &self,
        key: &str,
        update_fn: &UpdateFn<D>,
        bypass_validation: bool,
    ) -> Result<UpdateOutcome<D>> {
        let mut txn = self.store.transaction().await?;

        let staged = self.stage(&mut *txn, key, update_fn, bypass_validation).await;

        match staged {
            Ok(Some(updated)) => {
                txn.commit().await?;
                if let Some(cache) = &self.cache {
                    cache.put(updated.clone());
                }
                Ok(UpdateOutcome::Updated(updated))
            }
            Ok(None) => {
                let _ = txn.abort().await;
                Ok(UpdateOutcome::Rejected)
            }
            Err(e) => {
                let _ = txn.abort().await;
                Err(e)
            }
        }
    }

    /// Fetch and apply inside the transaction; `Ok(None)` is a rejected
    /// update.
    async fn stage(
        &self,
        txn: &mut dyn StoreTransaction<D>,
        key: &str,
        update_fn: &UpdateFn<D>,
        bypass_validation: bool,
    ) -> Result<Option<D>> {
        let Some(current) = txn.find_by_key(key).await? else {
            return Err(SerializerError::DocumentNotFound(key.to_string()));
        };

        let Some(mut updated) = update_fn(&current) else {
            return Ok(None);
        };

        if updated.key() != current.key() {
            return Err(SerializerError::IllegalUpdate(format!(
                "update changed the document key from {} to {}",
                current.key(),
                updated.key()
            )));
        }
        updated.set_version(current.version() + 1);

        if !bypass_validation {
            if let Some(validator) = &self.validator {
                validator
                    .validate(&updated)
                    .map_err(SerializerError::Validation)?;
            }
        }

        let modified = txn
            .replace_versioned(key, current.version(), &updated)
            .await?;
        if modified == 0 {
            // another writer bumped the version between fetch and replace
            return Err(SerializerError::Store(StoreError::WriteConflict));
        }

        Ok(Some(updated))
    }
}

/// Per-attempt CAS retry delay: one-way ping doubled as the base, linear
/// growth per attempt, clamped to [50ms, 2s] with ±25% jitter.
fn cas_retry_delay(attempt: u32, average_ping: Duration) -> Duration {
    let one_way_ms = (average_ping.as_nanos() as f64 / 2.0) / 1e6;
    let base = one_way_ms * 2.0;
    let grown = base * CAS_BACKOFF_GROWTH * attempt as f64;
    let clamped = grown.clamp(CAS_RETRY_MIN_MS, CAS_RETRY_MAX_MS);
    let jitter = rand::rng().random_range(-CAS_JITTER..=CAS_JITTER);
    Duration::from_millis((clamped * (1.0 + jitter)) as u64)
}

//! Bulk reconciliation of a full collection against a document store
//!
//! Given the desired record list of a collection:
//!
//! 1. Under [`WritePolicy::Replace`], delete every stored record whose key is
//!    absent from the list.
//! 2. Upsert the whole list in one bulk request.
//! 3. If the bulk request fails, fall back to one operation per record:
//!    replace by key; if nothing matched, insert; if the insert collides on
//!    the key (another writer got there first), replace again.
//!
//! Stores may reject a bulk request wholesale because of one malformed
//! record. The per-record pass isolates that record: its failure is logged
//! and recorded, and the rest of the batch still lands.

use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::document::{DocumentStore, Filter};
use crate::error::DocumentError;
use crate::model::{key_string, Record, WritePolicy};

/// One record the reconciler could not persist
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub key: String,
    pub error: DocumentError,
}

/// Outcome of a reconcile pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: Vec<RecordFailure>,
    /// Stale records deleted under replace semantics
    pub removed: u64,
    /// The per-record fallback was used
    pub fell_back: bool,
}

impl BatchResult {
    /// Every record failed (an empty batch never counts as failed)
    pub fn is_total_failure(&self) -> bool {
        self.succeeded == 0 && !self.failed.is_empty()
    }
}

/// Reconcile `records` into `collection`
///
/// Only a failure to delete stale records is returned as an error; per-record
/// failures are collected in the [`BatchResult`].
pub async fn reconcile(
    store: &dyn DocumentStore,
    collection: &str,
    key_field: &str,
    records: &[Record],
    policy: WritePolicy,
) -> Result<BatchResult, DocumentError> {
    let mut result = BatchResult::default();

    if policy == WritePolicy::Replace {
        let keep: Vec<Value> = records
            .iter()
            .filter_map(|r| r.get(key_field).cloned())
            .collect();
        result.removed = store
            .delete_many(collection, &Filter::all().not_in(key_field, keep))
            .await?;
        if result.removed > 0 {
            debug!("Removed {} stale record(s) from {}", result.removed, collection);
        }
    }

    if records.is_empty() {
        return Ok(result);
    }

    match store
        .bulk_upsert(collection, key_field, records.to_vec())
        .await
    {
        Ok(_) => {
            result.succeeded = records.len();
            return Ok(result);
        }
        Err(e) => {
            warn!(
                "Bulk write of {} record(s) to {} failed, retrying one by one: {}",
                records.len(),
                collection,
                e
            );
            result.fell_back = true;
        }
    }

    for record in records {
        let key = record
            .get(key_field)
            .and_then(key_string)
            .unwrap_or_default();
        match upsert_one(store, collection, key_field, record).await {
            Ok(()) => result.succeeded += 1,
            Err(error) => {
                warn!("Skipping record {}={} in {}: {}", key_field, key, collection, error);
                result.failed.push(RecordFailure { key, error });
            }
        }
    }

    Ok(result)
}

/// Replace by key, insert if absent, replace again on a key collision
async fn upsert_one(
    store: &dyn DocumentStore,
    collection: &str,
    key_field: &str,
    record: &Record,
) -> Result<(), DocumentError> {
    let key = record.get(key_field).cloned().unwrap_or(Value::Null);
    let by_key = Filter::all().eq(key_field, key);

    if store.replace_one(collection, &by_key, record.clone()).await? > 0 {
        return Ok(());
    }

    match store.insert_one(collection, record.clone()).await {
        Err(e) if e.is_duplicate_key() => {
            debug!("Insert into {} raced another writer, updating instead", collection);
            store.replace_one(collection, &by_key, record.clone()).await?;
            Ok(())
        }
        other => other,
    }
}

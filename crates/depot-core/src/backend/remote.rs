//! Remote document backend
//!
//! Maps top-level keys onto document collections:
//! - Collection: one document per record, unique on the key field
//! - KeyedMap: one `{_key, value}` document per entry
//! - Tombstones: one `{id}` document per deleted id
//! - anything else: one `{_key, value}` document in the `kv` collection
//!
//! Writes go through the bulk reconciler. Collection documents carry their
//! list position in `_pos` so reads come back in the order written.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Number, Value};
use tracing::{debug, info};

use super::document::{strip_metadata, DocumentStore, Filter, FindOptions, POSITION_FIELD};
use crate::error::DocumentError;
use crate::model::{key_string, records_of, KeyKind, Record, Registry, WritePolicy};
use crate::query::{BinPage, BinQuery};
use crate::reconcile::reconcile;

/// Collection holding plain values
pub const KV_COLLECTION: &str = "kv";

/// Key field of keyed-map entries and plain values
pub const ENTRY_KEY_FIELD: &str = "_key";

const ENTRY_VALUE_FIELD: &str = "value";
const TOMBSTONE_FIELD: &str = "id";

#[derive(Clone)]
pub struct RemoteBackend {
    store: Arc<dyn DocumentStore>,
    registry: Registry,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend").finish_non_exhaustive()
    }
}

impl RemoteBackend {
    pub fn new(store: Arc<dyn DocumentStore>, registry: Registry) -> Self {
        Self { store, registry }
    }

    /// Check the store answers within `timeout`, then set up unique indexes
    pub async fn connect(
        store: Arc<dyn DocumentStore>,
        registry: Registry,
        timeout: Duration,
    ) -> Result<Self, DocumentError> {
        tokio::time::timeout(timeout, store.ping())
            .await
            .map_err(|_| DocumentError::Timeout(timeout.as_millis() as u64))??;

        let backend = Self::new(store, registry);
        backend.ensure_indexes().await?;
        info!("Connected to remote document store");
        Ok(backend)
    }

    async fn ensure_indexes(&self) -> Result<(), DocumentError> {
        for spec in self.registry.specs() {
            let field = match &spec.kind {
                KeyKind::Collection { key_field, .. } => key_field.as_str(),
                KeyKind::KeyedMap => ENTRY_KEY_FIELD,
                KeyKind::Tombstones => TOMBSTONE_FIELD,
                KeyKind::Value => continue,
            };
            self.store.ensure_index(&spec.name, field).await?;
        }
        self.store
            .ensure_index(KV_COLLECTION, ENTRY_KEY_FIELD)
            .await?;
        debug!("Unique indexes in place");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), DocumentError> {
        self.store.ping().await
    }

    /// Read every registered key
    pub async fn load_all(&self) -> Result<BTreeMap<String, Value>, DocumentError> {
        let mut data = BTreeMap::new();
        for spec in self.registry.specs() {
            data.insert(spec.name.clone(), self.fetch(&spec.name).await?);
        }
        Ok(data)
    }

    /// Read one key live from the store, without backend metadata
    pub async fn fetch(&self, key: &str) -> Result<Value, DocumentError> {
        let spec = self.registry.resolve(key);
        match spec.kind {
            KeyKind::Collection { .. } => {
                let documents = self
                    .store
                    .find(key, &Filter::all(), FindOptions::default().sorted_by(POSITION_FIELD))
                    .await?;
                Ok(Value::Array(
                    documents
                        .into_iter()
                        .map(|d| Value::Object(strip_metadata(d)))
                        .collect(),
                ))
            }
            KeyKind::KeyedMap => {
                let mut map = Record::new();
                for mut document in self.find_all(key).await? {
                    let Some(entry_key) = document.get(ENTRY_KEY_FIELD).and_then(key_string)
                    else {
                        continue;
                    };
                    let value = document.remove(ENTRY_VALUE_FIELD).unwrap_or(Value::Null);
                    map.insert(entry_key, value);
                }
                Ok(Value::Object(map))
            }
            KeyKind::Tombstones => Ok(Value::Array(
                self.find_all(key)
                    .await?
                    .into_iter()
                    .filter_map(|mut d| d.remove(TOMBSTONE_FIELD))
                    .collect(),
            )),
            KeyKind::Value => {
                let filter = Filter::all().eq(ENTRY_KEY_FIELD, Value::String(key.to_string()));
                let found = self
                    .store
                    .find(KV_COLLECTION, &filter, FindOptions::page(0, 1))
                    .await?;
                Ok(found
                    .into_iter()
                    .next()
                    .and_then(|mut d| d.remove(ENTRY_VALUE_FIELD))
                    .unwrap_or(Value::Null))
            }
        }
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<Record>, DocumentError> {
        self.store
            .find(collection, &Filter::all(), FindOptions::default())
            .await
    }

    /// Write one key's full value; records the value lacks are removed
    ///
    /// Fails only if stale records could not be removed or every record of
    /// a non-empty batch failed; partial failures are logged by the reconciler.
    pub async fn persist(&self, key: &str, value: &Value) -> Result<(), DocumentError> {
        self.write(key, value, WritePolicy::Replace).await
    }

    /// Like [`persist`](Self::persist), but records of a collection that the
    /// value lacks are left in place
    pub async fn upsert(&self, key: &str, value: &Value) -> Result<(), DocumentError> {
        self.write(key, value, WritePolicy::Merge).await
    }

    async fn write(
        &self,
        key: &str,
        value: &Value,
        collection_policy: WritePolicy,
    ) -> Result<(), DocumentError> {
        let spec = self.registry.resolve(key);
        let (collection, key_field, records, policy) = match &spec.kind {
            KeyKind::Collection { key_field, .. } => {
                let records: Vec<Record> = records_of(value)
                    .into_iter()
                    .enumerate()
                    .map(|(pos, mut record)| {
                        record.insert(POSITION_FIELD.to_string(), Value::from(pos as u64));
                        record
                    })
                    .collect();
                (key, key_field.as_str(), records, collection_policy)
            }
            KeyKind::KeyedMap => {
                let records: Vec<Record> = value
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .map(|(k, v)| entry(Value::String(k.clone()), v.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                (key, ENTRY_KEY_FIELD, records, WritePolicy::Replace)
            }
            KeyKind::Tombstones => {
                let records: Vec<Record> = value
                    .as_array()
                    .map(|ids| {
                        ids.iter()
                            .map(|id| {
                                let mut record = Record::new();
                                record.insert(TOMBSTONE_FIELD.to_string(), id.clone());
                                record
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                (key, TOMBSTONE_FIELD, records, WritePolicy::Replace)
            }
            KeyKind::Value => (
                KV_COLLECTION,
                ENTRY_KEY_FIELD,
                vec![entry(Value::String(key.to_string()), value.clone())],
                WritePolicy::Merge,
            ),
        };

        let result = reconcile(self.store.as_ref(), collection, key_field, &records, policy).await?;
        if result.is_total_failure() {
            if let Some(first) = result.failed.into_iter().next() {
                return Err(first.error);
            }
        }
        Ok(())
    }

    /// Bin listing pushed down to the store
    pub async fn query_bins(
        &self,
        collection: &str,
        deleted: &HashSet<String>,
        query: &BinQuery,
    ) -> Result<BinPage, DocumentError> {
        let mut filter = Filter::all();
        if !deleted.is_empty() {
            filter = filter.not_in(TOMBSTONE_FIELD, tombstone_values(deleted));
        }
        if let Some(bbox) = &query.bbox {
            filter = filter
                .range("lat", bbox.min_lat, bbox.max_lat)
                .range("lng", bbox.min_lng, bbox.max_lng);
        }

        let total = self.store.count(collection, &filter).await?;
        let bins = self
            .store
            .find(
                collection,
                &filter,
                FindOptions::page(query.offset, query.effective_limit()).sorted_by(POSITION_FIELD),
            )
            .await?
            .into_iter()
            .map(strip_metadata)
            .collect();

        Ok(BinPage {
            bins,
            total: total as usize,
        })
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn entry(key: Value, value: Value) -> Record {
    let mut record = Record::new();
    record.insert(ENTRY_KEY_FIELD.to_string(), key);
    record.insert(ENTRY_VALUE_FIELD.to_string(), value);
    record
}

/// Tombstone ids in every form a stored id may take
///
/// Ids are kept as strings, but bins may carry numeric ids, so numeric-looking
/// ids are matched as numbers too.
fn tombstone_values(deleted: &HashSet<String>) -> Vec<Value> {
    let mut values = Vec::with_capacity(deleted.len() * 2);
    for id in deleted {
        values.push(Value::String(id.clone()));
        if let Ok(n) = id.parse::<i64>() {
            values.push(Value::Number(n.into()));
        } else if let Some(n) = id.parse::<f64>().ok().and_then(Number::from_f64) {
            values.push(Value::Number(n));
        }
    }
    values
}

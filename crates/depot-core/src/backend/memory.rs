//! In-process document store
//!
//! Behaves like a remote store from the coordinator's point of view: it
//! assigns `_id` metadata, enforces unique indexes and rejects a whole bulk
//! request if any document in it is malformed. Useful for embedding and as
//! the remote driver in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::document::{BulkSummary, Document, DocumentStore, Filter, FindOptions, METADATA_FIELD};
use crate::error::DocumentError;
use crate::model::key_string;

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    collections: HashMap<String, Vec<Document>>,
    unique: HashMap<String, Vec<String>>,
    next_id: u64,
}

impl MemoryInner {
    fn assign_id(&mut self, document: &mut Document) {
        if !document.contains_key(METADATA_FIELD) {
            self.next_id += 1;
            document.insert(
                METADATA_FIELD.to_string(),
                Value::String(format!("{:024x}", self.next_id)),
            );
        }
    }

    fn collision(&self, collection: &str, document: &Document) -> Option<String> {
        let fields = self.unique.get(collection)?;
        let existing = self.collections.get(collection)?;
        fields.iter().find_map(|field| {
            let value = document.get(field)?;
            existing
                .iter()
                .any(|d| d.get(field) == Some(value))
                .then(|| key_string(value).unwrap_or_else(|| value.to_string()))
        })
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of a collection, metadata included
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .collections
            .get(collection)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn ping(&self) -> Result<(), DocumentError> {
        Ok(())
    }

    async fn ensure_index(&self, collection: &str, field: &str) -> Result<(), DocumentError> {
        let mut inner = self.inner.lock();
        let fields = inner.unique.entry(collection.to_string()).or_default();
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, DocumentError> {
        let inner = self.inner.lock();
        let Some(documents) = inner.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let limit = options.limit.map_or(usize::MAX, |l| l as usize);
        let mut matched: Vec<&Document> = documents.iter().filter(|d| filter.matches(d)).collect();
        if let Some(field) = options.sort {
            let position = |d: &Document| d.get(field).and_then(Value::as_f64).unwrap_or(f64::INFINITY);
            matched.sort_by(|a, b| position(a).total_cmp(&position(b)));
        }
        Ok(matched
            .into_iter()
            .skip(options.skip as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .map_or(0, |docs| docs.iter().filter(|d| filter.matches(d)).count()) as u64)
    }

    async fn insert_one(&self, collection: &str, mut document: Document) -> Result<(), DocumentError> {
        let mut inner = self.inner.lock();
        if let Some(key) = inner.collision(collection, &document) {
            return Err(DocumentError::DuplicateKey {
                collection: collection.to_string(),
                key,
            });
        }
        inner.assign_id(&mut document);
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(())
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        mut document: Document,
    ) -> Result<u64, DocumentError> {
        let mut inner = self.inner.lock();
        let Some(documents) = inner.collections.get_mut(collection) else {
            return Ok(0);
        };
        let Some(existing) = documents.iter_mut().find(|d| filter.matches(d)) else {
            return Ok(0);
        };
        if let Some(id) = existing.get(METADATA_FIELD).cloned() {
            document.insert(METADATA_FIELD.to_string(), id);
        }
        *existing = document;
        Ok(1)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let mut inner = self.inner.lock();
        let Some(documents) = inner.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = documents.len();
        documents.retain(|d| !filter.matches(d));
        Ok((before - documents.len()) as u64)
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        key_field: &str,
        documents: Vec<Document>,
    ) -> Result<BulkSummary, DocumentError> {
        if let Some(index) = documents.iter().position(|d| !d.contains_key(key_field)) {
            return Err(DocumentError::Rejected {
                status: 400,
                message: format!("document {} has no '{}' field", index, key_field),
            });
        }

        let mut inner = self.inner.lock();
        let mut summary = BulkSummary::default();
        for mut document in documents {
            let key = document.get(key_field).cloned();
            let stored = inner.collections.entry(collection.to_string()).or_default();
            match stored
                .iter()
                .position(|d| d.get(key_field) == key.as_ref())
            {
                Some(pos) => {
                    if let Some(id) = stored[pos].get(METADATA_FIELD).cloned() {
                        document.insert(METADATA_FIELD.to_string(), id);
                    }
                    stored[pos] = document;
                    summary.matched += 1;
                }
                None => {
                    inner.assign_id(&mut document);
                    inner
                        .collections
                        .entry(collection.to_string())
                        .or_default()
                        .push(document);
                    summary.upserted += 1;
                }
            }
        }
        Ok(summary)
    }
}

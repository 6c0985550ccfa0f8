//! Remote document-store driver contract
//!
//! A driver exposes a handful of collection-level operations. Filters are a
//! small conjunctive language ([`Filter`]) that a driver either renders into
//! its native query shape or evaluates in-process.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::DocumentError;
use crate::model::Record;

/// A stored document
pub type Document = Record;

/// Field drivers add to every document; never returned to callers
pub const METADATA_FIELD: &str = "_id";

/// Position of a record within its collection's list
pub const POSITION_FIELD: &str = "_pos";

/// Remove backend-internal metadata from a document
pub fn strip_metadata(mut document: Document) -> Document {
    document.remove(METADATA_FIELD);
    document.remove(POSITION_FIELD);
    document
}

/// Ordering and paging for [`DocumentStore::find`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Ascending numeric sort field; documents without it come last
    pub sort: Option<&'static str>,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn page(skip: usize, limit: usize) -> Self {
        Self {
            skip: skip as u64,
            limit: Some(limit as u64),
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, field: &'static str) -> Self {
        self.sort = Some(field);
        self
    }
}

/// Outcome of a bulk upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub matched: u64,
    pub upserted: u64,
}

/// One condition of a [`Filter`]
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Eq(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    Range { field: String, min: f64, max: f64 },
}

/// Conjunction of clauses; the empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: Value) -> Self {
        self.clauses.push(Clause::Eq(field.to_string(), value));
        self
    }

    pub fn is_in(mut self, field: &str, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::In(field.to_string(), values));
        self
    }

    pub fn not_in(mut self, field: &str, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::NotIn(field.to_string(), values));
        self
    }

    pub fn range(mut self, field: &str, min: f64, max: f64) -> Self {
        self.clauses.push(Clause::Range {
            field: field.to_string(),
            min,
            max,
        });
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Evaluate against a document
    ///
    /// Follows document-store conventions: a missing field never satisfies
    /// `Eq`, `In` or `Range`, and always satisfies `NotIn`.
    pub fn matches(&self, document: &Document) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq(field, expected) => document
                .get(field)
                .is_some_and(|v| values_equal(v, expected)),
            Clause::In(field, values) => document
                .get(field)
                .is_some_and(|v| values.iter().any(|x| values_equal(v, x))),
            Clause::NotIn(field, values) => document
                .get(field)
                .map_or(true, |v| !values.iter().any(|x| values_equal(v, x))),
            Clause::Range { field, min, max } => document
                .get(field)
                .and_then(Value::as_f64)
                .is_some_and(|n| n >= *min && n <= *max),
        })
    }

    /// Render as a Mongo-style query document
    pub fn to_json(&self) -> Value {
        let mut rendered: Vec<Value> = self
            .clauses
            .iter()
            .map(|clause| match clause {
                Clause::Eq(field, value) => json!({ field: value }),
                Clause::In(field, values) => json!({ field: { "$in": values } }),
                Clause::NotIn(field, values) => json!({ field: { "$nin": values } }),
                Clause::Range { field, min, max } => {
                    json!({ field: { "$gte": min, "$lte": max } })
                }
            })
            .collect();

        match rendered.len() {
            0 => json!({}),
            1 => rendered.remove(0),
            _ => json!({ "$and": rendered }),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Driver for a remote document store
///
/// Implementations must report unique-key collisions on insert as
/// [`DocumentError::DuplicateKey`] whatever their native error shape is.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Cheap round trip to check the store is reachable
    async fn ping(&self) -> Result<(), DocumentError>;

    /// Ensure `field` is a unique key of `collection`
    async fn ensure_index(&self, collection: &str, field: &str) -> Result<(), DocumentError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, DocumentError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError>;

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), DocumentError>;

    /// Replace the first matching document; returns how many matched (0 or 1)
    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<u64, DocumentError>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError>;

    /// Insert-or-replace every document by `key_field`, as one request
    async fn bulk_upsert(
        &self,
        collection: &str,
        key_field: &str,
        documents: Vec<Document>,
    ) -> Result<BulkSummary, DocumentError>;

    /// Release connections; safe to call more than once
    async fn close(&self) {}
}

//! HTTP document-store driver
//!
//! Talks to a Data-API style endpoint: every operation is
//! `POST {url}/action/{name}` with a JSON body naming the database and
//! collection, authenticated by an `api-key` header.
//!
//! Responses:
//! - `find` → `{"documents": [...]}`
//! - `count` → `{"count": n}`
//! - `replaceOne` → `{"matchedCount": n}`
//! - `deleteMany` → `{"deletedCount": n}`
//! - `bulkWrite` → `{"matchedCount": n, "upsertedCount": m}`
//!
//! A `409 Conflict`, or any error body carrying the `E11000` duplicate-key
//! code, becomes [`DocumentError::DuplicateKey`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use super::document::{BulkSummary, Document, DocumentStore, Filter, FindOptions};
use crate::config::RemoteConfig;
use crate::error::DocumentError;

/// Per-request timeout once connected
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpDocumentStore {
    client: Client,
    base_url: String,
    database: String,
    api_key: Option<String>,
}

impl HttpDocumentStore {
    pub fn new(config: &RemoteConfig) -> Result<Self, DocumentError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn payload(&self, collection: Option<&str>, body: Value) -> Value {
        let mut payload = json!({ "database": self.database });
        if let Some(collection) = collection {
            payload["collection"] = json!(collection);
        }
        if let (Some(target), Value::Object(extra)) = (payload.as_object_mut(), body) {
            target.extend(extra);
        }
        payload
    }

    async fn action(
        &self,
        name: &str,
        collection: Option<&str>,
        body: Value,
    ) -> Result<Value, DocumentError> {
        let url = format!("{}/action/{}", self.base_url, name);
        debug!("POST {} ({})", url, collection.unwrap_or("-"));

        let mut request = self.client.post(&url).json(&self.payload(collection, body));
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Value>().await?);
        }

        let message = response.text().await.unwrap_or_default();
        Err(classify_failure(status, message, collection.unwrap_or_default()))
    }
}

/// Map an error response onto the driver error taxonomy
fn classify_failure(status: StatusCode, message: String, collection: &str) -> DocumentError {
    if status == StatusCode::CONFLICT || message.contains("E11000") {
        DocumentError::DuplicateKey {
            collection: collection.to_string(),
            key: message,
        }
    } else {
        DocumentError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

fn read_count(response: &Value, field: &str) -> Result<u64, DocumentError> {
    response
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| DocumentError::Decode(format!("missing '{}' in response", field)))
}

fn read_documents(response: Value) -> Result<Vec<Document>, DocumentError> {
    match response {
        Value::Object(mut body) => match body.remove("documents") {
            Some(Value::Array(items)) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(doc) => Some(doc),
                    _ => None,
                })
                .collect()),
            _ => Err(DocumentError::Decode("missing 'documents' in response".into())),
        },
        _ => Err(DocumentError::Decode("expected a JSON object".into())),
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn ping(&self) -> Result<(), DocumentError> {
        self.action("ping", None, json!({})).await.map(|_| ())
    }

    async fn ensure_index(&self, collection: &str, field: &str) -> Result<(), DocumentError> {
        self.action(
            "createIndex",
            Some(collection),
            json!({ "keys": { field: 1 }, "unique": true }),
        )
        .await
        .map(|_| ())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, DocumentError> {
        let mut body = json!({ "filter": filter.to_json(), "skip": options.skip });
        if let Some(limit) = options.limit {
            body["limit"] = json!(limit);
        }
        if let Some(field) = options.sort {
            let mut sort = serde_json::Map::new();
            sort.insert(field.to_string(), json!(1));
            body["sort"] = Value::Object(sort);
        }
        let response = self.action("find", Some(collection), body).await?;
        read_documents(response)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let response = self
            .action("count", Some(collection), json!({ "filter": filter.to_json() }))
            .await?;
        read_count(&response, "count")
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), DocumentError> {
        self.action("insertOne", Some(collection), json!({ "document": document }))
            .await
            .map(|_| ())
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<u64, DocumentError> {
        let response = self
            .action(
                "replaceOne",
                Some(collection),
                json!({ "filter": filter.to_json(), "replacement": document }),
            )
            .await?;
        read_count(&response, "matchedCount")
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let response = self
            .action("deleteMany", Some(collection), json!({ "filter": filter.to_json() }))
            .await?;
        read_count(&response, "deletedCount")
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        key_field: &str,
        documents: Vec<Document>,
    ) -> Result<BulkSummary, DocumentError> {
        let operations: Vec<Value> = documents
            .into_iter()
            .map(|doc| {
                let key = doc.get(key_field).cloned().unwrap_or(Value::Null);
                json!({
                    "replaceOne": {
                        "filter": { key_field: key },
                        "replacement": doc,
                        "upsert": true
                    }
                })
            })
            .collect();

        let response = self
            .action(
                "bulkWrite",
                Some(collection),
                json!({ "operations": operations, "ordered": false }),
            )
            .await?;

        Ok(BulkSummary {
            matched: read_count(&response, "matchedCount")?,
            upserted: read_count(&response, "upsertedCount")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> HttpDocumentStore {
        HttpDocumentStore::new(&RemoteConfig {
            url: "https://data.example.com/api/".to_string(),
            database: "fleet".to_string(),
            api_key: Some("k".to_string()),
            connect_timeout: Duration::from_millis(100),
        })
        .unwrap()
    }

    #[test]
    fn test_payload_names_database_and_collection() {
        let store = store();
        assert_eq!(store.base_url, "https://data.example.com/api");

        let payload = store.payload(Some("bins"), json!({"filter": {}}));
        assert_eq!(
            payload,
            json!({"database": "fleet", "collection": "bins", "filter": {}})
        );

        let ping = store.payload(None, json!({}));
        assert_eq!(ping, json!({"database": "fleet"}));
    }

    #[test]
    fn test_conflict_is_duplicate_key() {
        let err = classify_failure(StatusCode::CONFLICT, "exists".into(), "bins");
        assert!(err.is_duplicate_key());

        let err = classify_failure(
            StatusCode::BAD_REQUEST,
            "E11000 duplicate key error collection: fleet.bins".into(),
            "bins",
        );
        assert!(err.is_duplicate_key());

        let err = classify_failure(StatusCode::SERVICE_UNAVAILABLE, "down".into(), "bins");
        assert_eq!(
            err,
            DocumentError::Rejected {
                status: 503,
                message: "down".into()
            }
        );
    }

    #[test]
    fn test_read_documents() {
        let docs = read_documents(json!({"documents": [{"id": 1}, 7, {"id": 2}]})).unwrap();
        assert_eq!(docs.len(), 2);

        assert!(matches!(
            read_documents(json!({"count": 1})),
            Err(DocumentError::Decode(_))
        ));
    }

    #[test]
    fn test_read_count() {
        assert_eq!(read_count(&json!({"deletedCount": 4}), "deletedCount").unwrap(), 4);
        assert!(read_count(&json!({}), "deletedCount").is_err());
    }
}

//! Store behavior against a misbehaving remote document store

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value};
use tempfile::TempDir;

use super::Store;
use crate::backend::document::{BulkSummary, Document, DocumentStore, Filter, FindOptions};
use crate::backend::memory::MemoryDocumentStore;
use crate::backend::BackendKind;
use crate::config::Config;
use crate::error::DocumentError;
use crate::model::{BINS, SENSORS};
use crate::query::BinQuery;

/// Memory store with switchable faults
#[derive(Default)]
struct FaultyStore {
    inner: MemoryDocumentStore,
    pings: AtomicUsize,
    ping_delay: Option<Duration>,
    ping_fails: bool,
    bulk_fails: AtomicBool,
    writes_fail: AtomicBool,
}

impl FaultyStore {
    fn down() -> DocumentError {
        DocumentError::Transport("connection reset".into())
    }

    fn check_writes(&self) -> Result<(), DocumentError> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(Self::down());
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn ping(&self) -> Result<(), DocumentError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.ping_delay {
            tokio::time::sleep(delay).await;
        }
        if self.ping_fails {
            return Err(Self::down());
        }
        self.inner.ping().await
    }

    async fn ensure_index(&self, collection: &str, field: &str) -> Result<(), DocumentError> {
        self.inner.ensure_index(collection, field).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>, DocumentError> {
        self.inner.find(collection, filter, options).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        self.inner.count(collection, filter).await
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), DocumentError> {
        self.check_writes()?;
        self.inner.insert_one(collection, document).await
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<u64, DocumentError> {
        self.check_writes()?;
        self.inner.replace_one(collection, filter, document).await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        self.check_writes()?;
        self.inner.delete_many(collection, filter).await
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        key_field: &str,
        documents: Vec<Document>,
    ) -> Result<BulkSummary, DocumentError> {
        self.check_writes()?;
        if self.bulk_fails.load(Ordering::SeqCst) {
            return Err(DocumentError::Rejected {
                status: 500,
                message: "bulk write unavailable".into(),
            });
        }
        self.inner.bulk_upsert(collection, key_field, documents).await
    }
}

fn config(temp_dir: &TempDir) -> Config {
    let mut config = Config::for_data_dir(temp_dir.path());
    config.connect_timeout_ms = 200;
    config
}

fn ids(documents: &[Document], field: &str) -> Vec<String> {
    let mut ids: Vec<String> = documents
        .iter()
        .filter_map(|d| d.get(field).and_then(Value::as_str).map(String::from))
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_concurrent_first_use_sets_up_once() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore {
        ping_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let store = Store::with_document_store(config(&temp_dir), driver.clone());

    let reads = (0..8).map(|_| {
        let store = store.clone();
        async move { store.get("users").await }
    });
    let values = join_all(reads).await;

    assert_eq!(driver.pings.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| *v == json!([])));
    assert_eq!(store.backend_kind(), Some(BackendKind::Remote));
}

#[tokio::test]
async fn test_unreachable_remote_falls_back_to_local() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore {
        ping_fails: true,
        ..Default::default()
    });
    let store = Store::with_document_store(config(&temp_dir), driver);

    store.set(BINS, json!([{"id": "A"}])).await.unwrap();

    assert_eq!(store.backend_kind(), Some(BackendKind::Local));
    let health = store.health_check();
    assert!(health.setup_error.unwrap().contains("connection reset"));
    assert_eq!(store.get(BINS).await, json!([{"id": "A"}]));
}

#[tokio::test]
async fn test_slow_remote_times_out_to_local() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore {
        ping_delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let store = Store::with_document_store(config(&temp_dir), driver);

    store.initialize().await;

    assert_eq!(store.backend_kind(), Some(BackendKind::Local));
    assert!(store.health_check().setup_error.unwrap().contains("200 ms"));
}

#[tokio::test]
async fn test_replace_removes_stale_records() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore::default());
    let store = Store::with_document_store(config(&temp_dir), driver.clone());

    store
        .update_collection(BINS, json!([{"id": "A"}, {"id": "B"}, {"id": "C"}]))
        .await
        .unwrap();
    store
        .update_collection(BINS, json!([{"id": "A", "fillLevel": 40}, {"id": "D"}]))
        .await
        .unwrap();

    assert_eq!(ids(&driver.inner.documents(BINS), "id"), vec!["A", "D"]);
    let bins = store.get(BINS).await;
    assert_eq!(bins.as_array().unwrap().len(), 2);
    assert!(bins.as_array().unwrap().iter().all(|b| b.get("_id").is_none()));
}

#[tokio::test]
async fn test_merge_keeps_absent_records() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore::default());
    let store = Store::with_document_store(config(&temp_dir), driver.clone());

    store
        .update_collection(SENSORS, json!([{"imei": "1", "fw": 1}, {"imei": "2", "fw": 1}]))
        .await
        .unwrap();
    store
        .update_collection(SENSORS, json!([{"imei": "2", "fw": 3}, {"imei": "3", "fw": 1}]))
        .await
        .unwrap();

    let stored = driver.inner.documents(SENSORS);
    assert_eq!(ids(&stored, "imei"), vec!["1", "2", "3"]);
    let two = stored.iter().find(|d| d["imei"] == "2").unwrap();
    assert_eq!(two["fw"], 3);
}

#[tokio::test]
async fn test_tombstoned_bins_stay_in_backend_but_hidden() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore::default());
    let store = Store::with_document_store(config(&temp_dir), driver.clone());

    store
        .set(BINS, json!([{"id": "A", "lat": 25.1, "lng": 55.1}, {"id": "B", "lat": 25.2, "lng": 55.2}]))
        .await
        .unwrap();
    store.add_deleted_bins(vec!["B".into()]).await.unwrap();

    let page = store.get_bins(&BinQuery::default()).await;
    assert_eq!(page.total, 1);
    assert_eq!(page.bins[0]["id"], "A");
    assert_eq!(driver.inner.len(BINS), 2);
    assert_eq!(store.get_deleted_bins().await, vec!["B".to_string()]);
}

#[tokio::test]
async fn test_data_survives_a_new_store() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore::default());

    let first = Store::with_document_store(config(&temp_dir), driver.clone());
    first.set(BINS, json!([{"id": "A", "lat": 1.0, "lng": 2.0}])).await.unwrap();
    first.set("analytics", json!({"daily": {"collected": 12}})).await.unwrap();
    first.set("theme", json!("dark")).await.unwrap();
    first.close().await;

    let second = Store::with_document_store(config(&temp_dir), driver);
    assert_eq!(second.get(BINS).await, json!([{"id": "A", "lat": 1.0, "lng": 2.0}]));
    assert_eq!(second.get("analytics").await["daily"]["collected"], 12);
    assert_eq!(second.get("theme").await, json!("dark"));
}

#[tokio::test]
async fn test_failed_bulk_write_falls_back_per_record() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore::default());
    driver.bulk_fails.store(true, Ordering::SeqCst);
    let store = Store::with_document_store(config(&temp_dir), driver.clone());

    store
        .update_collection(BINS, json!([{"id": "A"}, {"id": "B"}]))
        .await
        .unwrap();

    assert_eq!(ids(&driver.inner.documents(BINS), "id"), vec!["A", "B"]);
    assert!(store.health_check().pending_writes.is_empty());
}

#[tokio::test]
async fn test_rejected_write_is_retried_on_flush() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore::default());
    let store = Store::with_document_store(config(&temp_dir), driver.clone());
    store.initialize().await;

    driver.writes_fail.store(true, Ordering::SeqCst);
    store.set(BINS, json!([{"id": "A"}])).await.unwrap();

    // Reads see the write even though the remote store refused it
    assert_eq!(store.get(BINS).await, json!([{"id": "A"}]));
    assert_eq!(store.health_check().pending_writes, vec![BINS.to_string()]);
    assert!(driver.inner.is_empty(BINS));

    driver.writes_fail.store(false, Ordering::SeqCst);
    store.flush().await.unwrap();

    assert!(store.health_check().pending_writes.is_empty());
    assert_eq!(ids(&driver.inner.documents(BINS), "id"), vec!["A"]);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_writes_flushes_once() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(&temp_dir);
    config.backend = Some(BackendKind::Local);
    config.sync.debounce_ms = 100;
    let store = Store::new(config);
    store.initialize().await;

    for i in 0..5 {
        store
            .update_collection("complaints", json!([{"id": format!("c{}", i)}]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.health_check().flush_count, 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.health_check().flush_count, 1);
    assert!(store.config().data_path().exists());
}

#[tokio::test]
async fn test_set_replaces_merge_collection_on_both_backends() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore::default());
    let remote = Store::with_document_store(config(&temp_dir), driver.clone());
    let mut local_config = config(&temp_dir);
    local_config.data_dir = temp_dir.path().join("local");
    local_config.backend = Some(BackendKind::Local);
    let local = Store::new(local_config);

    for store in [&remote, &local] {
        store.set(SENSORS, json!([{"imei": "1", "fw": 1}])).await.unwrap();
        store.set(SENSORS, json!([{"imei": "2", "fw": 2}])).await.unwrap();
        assert_eq!(store.get(SENSORS).await, json!([{"imei": "2", "fw": 2}]));
    }
    assert_eq!(ids(&driver.inner.documents(SENSORS), "imei"), vec!["2"]);
}

#[tokio::test]
async fn test_remote_read_keeps_written_order() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore::default());
    let store = Store::with_document_store(config(&temp_dir), driver);

    store.set(BINS, json!([{"id": "A"}])).await.unwrap();
    store.set(BINS, json!([{"id": "D"}, {"id": "A"}])).await.unwrap();

    assert_eq!(store.get(BINS).await, json!([{"id": "D"}, {"id": "A"}]));
    let page = store.get_bins(&BinQuery::default()).await;
    assert_eq!(page.bins[0]["id"], "D");
}

#[tokio::test]
async fn test_live_reads_refresh_backup() {
    let temp_dir = TempDir::new().unwrap();
    let driver = Arc::new(FaultyStore::default());
    let reader = Store::with_document_store(config(&temp_dir), driver.clone());
    reader.initialize().await;

    let writer_dir = TempDir::new().unwrap();
    let writer = Store::with_document_store(config(&writer_dir), driver);
    writer.set(BINS, json!([{"id": "W"}])).await.unwrap();

    assert_eq!(reader.get(BINS).await, json!([{"id": "W"}]));
    assert_eq!(reader.get_all_data().await.get(BINS), Some(&json!([{"id": "W"}])));

    reader.flush().await.unwrap();
    let backup: Value =
        serde_json::from_slice(&std::fs::read(reader.config().data_path()).unwrap()).unwrap();
    assert_eq!(backup[BINS], json!([{"id": "W"}]));
}

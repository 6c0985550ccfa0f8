//! Store coordinator
//!
//! [`Store`] is the single entry point for reads and writes. It owns the
//! in-memory [`Snapshot`], a fallback map of every value written this
//! session, and the selected [`Backend`].
//!
//! ## Initialization
//!
//! The backend is chosen lazily by the first operation (or an explicit
//! [`Store::initialize`]). Concurrent callers share one setup: the remote
//! store is pinged under a timeout, unique indexes are created and every
//! registered key is loaded. Any failure downgrades to the local file for
//! the rest of the process, logged once.
//!
//! ## Writes
//!
//! A write lands in the snapshot and the fallback map before any backend
//! call, so reads see it immediately whatever the backend does. A failed
//! remote write marks the key dirty; the next flush pushes it again.
//! Each write then arms the scheduler: immediately for consistency-critical
//! keys, debounced for the rest.
//!
//! ## Flushes
//!
//! Every flush retries dirty keys (remote only) and rewrites the data file,
//! which is the store itself for the local backend and a backup otherwise.

mod fleet;
mod logs;
#[cfg(test)]
mod scenarios;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::document::DocumentStore;
use crate::backend::http::HttpDocumentStore;
use crate::backend::{Backend, BackendKind, LocalBackend, RemoteBackend};
use crate::config::{BackendConfig, Config};
use crate::error::{DocumentError, StoreError, StoreResult};
use crate::model::{
    merge_by_key, normalize_ids, records_of, validate_collection, Durability, KeyKind, KeySpec,
    Record, Registry, WritePolicy, DELETED_BINS,
};
use crate::scheduler::{Flush, SyncScheduler};
use crate::snapshot::Snapshot;

/// Result of [`Store::health_check`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub initialized: bool,
    pub backend: Option<BackendKind>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    /// Keys whose remote write failed and waits for the next flush
    pub pending_writes: Vec<String>,
    pub flush_count: u64,
    /// Why the remote backend was abandoned, if it was
    pub setup_error: Option<String>,
}

/// Result of [`Store::connection_status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub ok: bool,
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared handle to the data store
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: Config,
    registry: Registry,
    /// Driver supplied by the embedder; otherwise built from configuration
    driver: Option<Arc<dyn DocumentStore>>,
    file: LocalBackend,
    backend: OnceCell<Backend>,
    state: Mutex<State>,
    scheduler: SyncScheduler,
    closed: AtomicBool,
}

struct State {
    snapshot: Snapshot,
    fallback: HashMap<String, Value>,
    dirty: BTreeSet<String>,
    setup_error: Option<String>,
    /// Bumped by every local write
    writes: u64,
}

impl State {
    fn current(&self, key: &str) -> Option<Value> {
        self.snapshot
            .get(key)
            .or_else(|| self.fallback.get(key))
            .cloned()
    }

    fn put(&mut self, key: &str, value: Value) {
        self.fallback.insert(key.to_string(), value.clone());
        self.snapshot.insert(key, value);
        self.writes += 1;
    }

    /// Take a value read from the remote store into the snapshot, unless a
    /// local write happened since `writes_seen`
    fn refresh(&mut self, key: &str, value: &Value, writes_seen: u64) {
        if self.writes == writes_seen && !self.dirty.contains(key) {
            self.snapshot.data.insert(key.to_string(), value.clone());
        }
    }
}

impl Store {
    /// Store whose backend is chosen from `config`
    pub fn new(config: Config) -> Self {
        Self::build(config, None)
    }

    /// Store backed by the given remote driver
    ///
    /// Falls back to the local file like any remote backend. An explicit
    /// `backend = "local"` in `config` still wins.
    pub fn with_document_store(config: Config, driver: Arc<dyn DocumentStore>) -> Self {
        Self::build(config, Some(driver))
    }

    /// Create and initialize in one step
    pub async fn open(config: Config) -> Self {
        let store = Self::new(config);
        store.initialize().await;
        store
    }

    fn build(config: Config, driver: Option<Arc<dyn DocumentStore>>) -> Self {
        let registry = config.registry();
        let inner = Arc::new_cyclic(|weak: &Weak<StoreInner>| {
            let target: Weak<dyn Flush> = weak.clone();
            StoreInner {
                file: LocalBackend::new(config.data_path()),
                scheduler: SyncScheduler::new(
                    target,
                    config.sync.debounce(),
                    config.sync.full_sync_interval(),
                ),
                state: Mutex::new(State {
                    snapshot: Snapshot::empty(&registry),
                    fallback: HashMap::new(),
                    dirty: BTreeSet::new(),
                    setup_error: None,
                    writes: 0,
                }),
                backend: OnceCell::new(),
                closed: AtomicBool::new(false),
                registry,
                driver,
                config,
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Select and set up the backend; later calls return at once
    ///
    /// Never fails: an unusable remote store means the local file.
    pub async fn initialize(&self) {
        self.inner.backend().await;
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.backend.initialized()
    }

    /// Backend in use, once initialized
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.inner.backend.get().map(Backend::kind)
    }

    /// Read a key
    ///
    /// The remote backend is read live unless the key has writes it has not
    /// accepted yet. Missing keys read as `Null`; read failures fall back to
    /// the local value. Values read live also refresh the snapshot, so the
    /// backup file follows the remote store.
    pub async fn get(&self, key: &str) -> Value {
        let backend = self.inner.backend().await;
        if let Backend::Remote(remote) = backend {
            if !self.is_dirty(key) {
                let writes_seen = self.inner.state.lock().writes;
                match remote.fetch(key).await {
                    Ok(value) => {
                        self.inner.state.lock().refresh(key, &value, writes_seen);
                        return value;
                    }
                    Err(e) => warn!("Remote read of '{}' failed, using local copy: {}", key, e),
                }
            }
        }
        self.local_value(key).unwrap_or(Value::Null)
    }

    /// Write a key's whole value
    ///
    /// Collections must be arrays of objects carrying their key field,
    /// keyed maps objects and the tombstone list an array of ids.
    pub async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let spec = self.inner.registry.resolve(key);
        let value = normalize(&spec, value)?;
        let backend = self.inner.backend().await;
        self.inner.state.lock().put(key, value.clone());
        self.persist(backend, &spec, &value, WritePolicy::Replace).await;
        Ok(())
    }

    /// Write a collection with its write policy
    ///
    /// Replace collections take `records` as the new full list; merge
    /// collections lay `records` over the current ones by key. Keys that
    /// are not collections are written as-is.
    pub async fn update_collection(&self, name: &str, records: Value) -> StoreResult<()> {
        let spec = self.inner.registry.resolve(name);
        let KeyKind::Collection { key_field, policy } = spec.kind.clone() else {
            return self.set(name, records).await;
        };
        let incoming = validate_collection(name, &key_field, records)?;
        let backend = self.inner.backend().await;

        let value = {
            let mut state = self.inner.state.lock();
            let next = match policy {
                WritePolicy::Replace => incoming,
                WritePolicy::Merge => {
                    let existing = state.current(name).map(|v| records_of(&v)).unwrap_or_default();
                    merge_by_key(existing, incoming, &key_field)
                }
            };
            let value = records_value(next);
            state.put(name, value.clone());
            value
        };

        // The merged list is complete locally; upserting it leaves records
        // added remotely by other writers alone
        self.persist(backend, &spec, &value, policy).await;
        Ok(())
    }

    /// Apply several updates, each with its key's write policy
    ///
    /// Every value is checked before anything is written.
    pub async fn update_data(&self, updates: BTreeMap<String, Value>) -> StoreResult<()> {
        for (key, value) in &updates {
            let spec = self.inner.registry.resolve(key);
            match &spec.kind {
                KeyKind::Collection { key_field, .. } => {
                    validate_collection(key, key_field, value.clone())?;
                }
                _ => {
                    normalize(&spec, value.clone())?;
                }
            }
        }

        for (key, value) in updates {
            self.update_collection(&key, value).await?;
        }
        Ok(())
    }

    /// Copy of the whole snapshot
    pub async fn get_all_data(&self) -> Snapshot {
        self.inner.backend().await;
        self.inner.state.lock().snapshot.clone()
    }

    pub async fn get_deleted_bins(&self) -> Vec<String> {
        self.inner.backend().await;
        self.deleted_ids().into_iter().collect()
    }

    /// Replace the tombstone list
    pub async fn set_deleted_bins(&self, ids: Vec<String>) -> StoreResult<()> {
        let ids: Vec<Value> = ids.into_iter().map(Value::String).collect();
        self.set(DELETED_BINS, Value::Array(ids)).await
    }

    /// Add ids to the tombstone list; ids already present are not repeated
    pub async fn add_deleted_bins(&self, ids: Vec<String>) -> StoreResult<()> {
        self.modify(DELETED_BINS, |current| {
            let incoming: Vec<Value> = ids.into_iter().map(Value::String).collect();
            let existing = current.as_array().cloned().unwrap_or_default();
            let union = normalize_ids(existing.iter().chain(incoming.iter()));
            if union.len() == existing.len() {
                return None;
            }
            *current = Value::Array(union.into_iter().map(Value::String).collect());
            Some(())
        })
        .await;
        Ok(())
    }

    /// Flush now: retry pending remote writes and rewrite the data file
    pub async fn flush(&self) -> StoreResult<()> {
        self.inner.backend().await;
        self.inner.scheduler.flush_now().await
    }

    pub fn health_check(&self) -> HealthReport {
        let state = self.inner.state.lock();
        HealthReport {
            initialized: self.is_initialized(),
            backend: self.backend_kind(),
            last_sync: state.snapshot.last_sync,
            last_update: state.snapshot.last_update,
            pending_writes: state.dirty.iter().cloned().collect(),
            flush_count: self.inner.scheduler.flush_count(),
            setup_error: state.setup_error.clone(),
        }
    }

    /// Check the backend is reachable right now
    pub async fn connection_status(&self) -> ConnectionStatus {
        match self.inner.backend().await {
            Backend::Remote(remote) => {
                let result = remote.ping().await;
                ConnectionStatus {
                    ok: result.is_ok(),
                    backend: BackendKind::Remote,
                    error: result.err().map(|e| e.to_string()),
                }
            }
            Backend::Local(_) => ConnectionStatus {
                ok: true,
                backend: BackendKind::Local,
                error: self.inner.state.lock().setup_error.clone(),
            },
        }
    }

    /// Stop the timers, flush once more and release the driver
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.scheduler.stop();

        let Some(backend) = self.inner.backend.get() else {
            return;
        };
        if let Err(e) = self.inner.scheduler.flush_now().await {
            warn!("Final flush failed: {}", e);
        }
        if let Backend::Remote(remote) = backend {
            remote.close().await;
        }
        info!("Store closed");
    }

    fn local_value(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().current(key)
    }

    fn is_dirty(&self, key: &str) -> bool {
        self.inner.state.lock().dirty.contains(key)
    }

    fn deleted_ids(&self) -> BTreeSet<String> {
        self.local_value(DELETED_BINS)
            .and_then(|v| v.as_array().map(|ids| normalize_ids(ids.iter())))
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    fn deleted_set(&self) -> HashSet<String> {
        self.deleted_ids().into_iter().collect()
    }

    /// Read-modify-write of one key under the state lock
    ///
    /// `f` returns `None` to leave the value untouched, which skips the write.
    async fn modify<R, F>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Value) -> Option<R> + Send,
        R: Send,
    {
        let spec = self.inner.registry.resolve(key);
        let backend = self.inner.backend().await;

        let (result, value) = {
            let mut state = self.inner.state.lock();
            let mut value = state.current(key).unwrap_or_else(|| spec.empty_value());
            let result = f(&mut value)?;
            state.put(key, value.clone());
            (result, value)
        };

        self.persist(backend, &spec, &value, WritePolicy::Replace).await;
        Some(result)
    }

    /// Push a written value to the backend and arm the scheduler
    ///
    /// `policy` decides whether remote records of a collection that `value`
    /// lacks are removed.
    async fn persist(&self, backend: &Backend, spec: &KeySpec, value: &Value, policy: WritePolicy) {
        if let Backend::Remote(remote) = backend {
            let written = match policy {
                WritePolicy::Replace => remote.persist(&spec.name, value).await,
                WritePolicy::Merge => remote.upsert(&spec.name, value).await,
            };
            match written {
                Ok(()) => {
                    self.inner.state.lock().dirty.remove(&spec.name);
                }
                Err(e) => {
                    warn!(
                        "Remote write of '{}' failed, will retry on next sync: {}",
                        spec.name, e
                    );
                    self.inner.state.lock().dirty.insert(spec.name.clone());
                }
            }
        }

        match spec.durability {
            Durability::Immediate => self.inner.scheduler.flush_soon(),
            Durability::Debounced => self.inner.scheduler.schedule(),
        }
    }
}

impl StoreInner {
    async fn backend(&self) -> &Backend {
        self.backend.get_or_init(|| self.setup()).await
    }

    async fn setup(&self) -> Backend {
        let started = Instant::now();
        let backend = match self.connect_remote().await {
            Some(Ok((remote, data))) => {
                let mut snapshot = Snapshot {
                    data,
                    ..Snapshot::default()
                };
                snapshot.fill_missing(&self.registry);
                self.state.lock().snapshot = snapshot;
                Backend::Remote(remote)
            }
            Some(Err(e)) => {
                warn!(
                    "Remote backend unavailable, falling back to {:?}: {}",
                    self.file.path(),
                    e
                );
                self.state.lock().setup_error = Some(e.to_string());
                self.open_local()
            }
            None => self.open_local(),
        };

        self.scheduler.start();
        info!(
            "Store initialized with {} backend in {:?}",
            backend.kind(),
            started.elapsed()
        );
        backend
    }

    /// Connect and load everything; `None` when no remote store is configured
    async fn connect_remote(
        &self,
    ) -> Option<Result<(RemoteBackend, BTreeMap<String, Value>), DocumentError>> {
        if self.config.backend == Some(BackendKind::Local) {
            return None;
        }

        let (driver, timeout): (Arc<dyn DocumentStore>, Duration) = match &self.driver {
            Some(driver) => (
                driver.clone(),
                Duration::from_millis(self.config.connect_timeout_ms),
            ),
            None => match self.config.backend_config() {
                BackendConfig::Remote(remote) => match HttpDocumentStore::new(&remote) {
                    Ok(store) => (Arc::new(store) as Arc<dyn DocumentStore>, remote.connect_timeout),
                    Err(e) => return Some(Err(e)),
                },
                BackendConfig::Local(_) => return None,
            },
        };

        let connected = async {
            let remote = RemoteBackend::connect(driver, self.registry.clone(), timeout).await?;
            let data = remote.load_all().await?;
            Ok::<_, DocumentError>((remote, data))
        };
        Some(connected.await)
    }

    fn open_local(&self) -> Backend {
        let snapshot = match self.file.load() {
            Ok(Some(mut snapshot)) => {
                snapshot.fill_missing(&self.registry);
                debug!("Loaded {:?}", self.file.path());
                snapshot
            }
            Ok(None) => {
                let snapshot = if self.config.seed_defaults {
                    Snapshot::seeded(&self.registry)
                } else {
                    Snapshot::empty(&self.registry)
                };
                if let Err(e) = self.file.save(&snapshot) {
                    warn!("Could not write initial data file: {}", e);
                }
                snapshot
            }
            Err(e) => {
                warn!("Could not read data file, starting empty: {}", e);
                Snapshot::empty(&self.registry)
            }
        };

        self.state.lock().snapshot = snapshot;
        Backend::Local(self.file.clone())
    }

    /// Re-push keys whose remote write failed
    async fn retry_dirty(&self, remote: &RemoteBackend) -> StoreResult<()> {
        let pending: Vec<(String, Value)> = {
            let state = self.state.lock();
            state
                .dirty
                .iter()
                .filter_map(|key| state.current(key).map(|v| (key.clone(), v)))
                .collect()
        };

        let mut first_error = None;
        for (key, value) in pending {
            match remote.persist(&key, &value).await {
                Ok(()) => {
                    self.state.lock().dirty.remove(&key);
                    debug!("Retried write of '{}'", key);
                }
                Err(e) => {
                    warn!("Retry of '{}' failed: {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    fn write_file(&self) -> StoreResult<()> {
        let now = Utc::now();
        let mut snapshot = self.state.lock().snapshot.clone();
        snapshot.last_sync = Some(now);
        self.file.save(&snapshot)?;
        self.state.lock().snapshot.last_sync = Some(now);
        Ok(())
    }
}

#[async_trait]
impl Flush for StoreInner {
    async fn flush(&self) -> StoreResult<()> {
        let Some(backend) = self.backend.get() else {
            return Ok(());
        };
        let retried = match backend {
            Backend::Remote(remote) => self.retry_dirty(remote).await,
            Backend::Local(_) => Ok(()),
        };
        self.write_file()?;
        retried
    }
}

/// Check a value against its key's shape and put it in stored form
fn normalize(spec: &KeySpec, value: Value) -> StoreResult<Value> {
    match &spec.kind {
        KeyKind::Collection { key_field, .. } => Ok(records_value(validate_collection(
            &spec.name, key_field, value,
        )?)),
        KeyKind::KeyedMap if value.is_object() => Ok(value),
        KeyKind::KeyedMap => Err(StoreError::invalid(&spec.name, "expected an object")),
        KeyKind::Tombstones => match &value {
            Value::Array(ids) => Ok(Value::Array(
                normalize_ids(ids.iter()).into_iter().map(Value::String).collect(),
            )),
            _ => Err(StoreError::invalid(&spec.name, "expected an array of ids")),
        },
        KeyKind::Value => Ok(value),
    }
}

fn records_value(records: Vec<Record>) -> Value {
    Value::Array(records.into_iter().map(Value::Object).collect())
}

//! Depot Core Library
//!
//! A single logical data store for fleet operations data (users, bins,
//! routes, sensors, driver messages, ...), backed either by a remote
//! document store or by one JSON file on disk.
//!
//! # Architecture
//!
//! - **Store**: owns the in-memory snapshot and the selected backend; all
//!   reads and writes go through it
//! - **Backends**: remote document store (HTTP driver, or any
//!   [`DocumentStore`]) with the local file as backup, or the local file alone
//! - **Reconciler**: turns a full-collection write into bulk operations,
//!   falling back to per-record writes when a bulk request fails
//! - **Scheduler**: debounced and periodic flushes of the snapshot
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::open(Config::load()?).await;
//!
//! store.update_collection("bins", json!([{"id": "B-1", "lat": 25.2, "lng": 55.3}])).await?;
//! let page = store.get_bins(&BinQuery::default()).await;
//!
//! store.close().await;
//! ```
//!
//! # Modules
//!
//! - `store`: Store coordinator (main entry point)
//! - `backend`: Remote and local backends, document-store drivers
//! - `reconcile`: Bulk reconciliation of collections
//! - `query`: Bin and log paging
//! - `scheduler`: Flush timers
//! - `model`: Key registry and record helpers
//! - `snapshot`: Full image of the store
//! - `config`: Application configuration

pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod query;
pub mod reconcile;
pub mod scheduler;
pub mod snapshot;
pub mod store;

pub use backend::document::{DocumentStore, Filter, FindOptions};
pub use backend::memory::MemoryDocumentStore;
pub use backend::BackendKind;
pub use config::Config;
pub use error::{DocumentError, StorageError, StoreError, StoreResult};
pub use model::{Durability, Record, Registry, WritePolicy};
pub use query::{BinPage, BinQuery, BoundingBox, CursorQuery, LogPage};
pub use reconcile::BatchResult;
pub use snapshot::Snapshot;
pub use store::{ConnectionStatus, HealthReport, Store};

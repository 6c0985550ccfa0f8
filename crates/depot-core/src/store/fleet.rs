//! Bins, drivers, driver locations and routes

use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::{records_value, Store};
use crate::backend::Backend;
use crate::error::{StoreError, StoreResult};
use crate::model::{
    key_string, record_key, records_of, Record, BINS, DRIVER_LOCATIONS, ROUTES, USERS,
};
use crate::query::{page_bins, BinPage, BinQuery};

const DRIVER_ROLE: &str = "driver";

impl Store {
    /// List bins, tombstoned ones excluded
    ///
    /// On the remote backend the query runs in the store; if that fails the
    /// same filter runs over the local copy instead.
    pub async fn get_bins(&self, query: &BinQuery) -> BinPage {
        let backend = self.inner.backend().await;
        let deleted = self.deleted_set();

        if let Backend::Remote(remote) = backend {
            if !self.is_dirty(BINS) {
                match remote.query_bins(BINS, &deleted, query).await {
                    Ok(page) => return page,
                    Err(e) => warn!("Bin query failed, answering from local copy: {}", e),
                }
            }
        }

        let bins = self.local_value(BINS).map(|v| records_of(&v)).unwrap_or_default();
        page_bins(&bins, &deleted, query)
    }

    /// Lay `updates` over one bin; `None` if it is unknown or tombstoned
    ///
    /// The bin's `id` cannot be changed this way.
    pub async fn update_bin(&self, id: &str, updates: Record) -> Option<Record> {
        self.inner.backend().await;
        if self.deleted_set().contains(id) {
            return None;
        }
        self.update_record(BINS, "id", id, updates, |_| true).await
    }

    /// A user with the driver role
    pub async fn get_driver_by_id(&self, id: &str) -> Option<Record> {
        records_of(&self.get(USERS).await)
            .into_iter()
            .find(|user| record_key(user, "id").as_deref() == Some(id) && is_driver(user))
    }

    /// Lay `updates` over a driver's user record
    pub async fn update_driver_data(&self, id: &str, updates: Record) -> Option<Record> {
        self.update_record(USERS, "id", id, updates, is_driver).await
    }

    /// Record a driver's latest position, stamped with `updatedAt`
    pub async fn update_driver_location(&self, driver_id: &str, location: Value) -> StoreResult<Record> {
        let Value::Object(mut location) = location else {
            return Err(StoreError::invalid(DRIVER_LOCATIONS, "location must be an object"));
        };
        location.insert("updatedAt".to_string(), Value::String(Utc::now().to_rfc3339()));

        let stored = location.clone();
        self.modify(DRIVER_LOCATIONS, move |current| {
            if !current.is_object() {
                *current = Value::Object(Record::new());
            }
            let map = current.as_object_mut()?;
            map.insert(driver_id.to_string(), Value::Object(location));
            Some(())
        })
        .await;
        Ok(stored)
    }

    /// Latest position of every driver, by driver id
    pub async fn get_driver_locations(&self) -> Record {
        match self.get(DRIVER_LOCATIONS).await {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    /// Append a route, assigning `id` and `createdAt` if absent
    pub async fn add_route(&self, mut route: Record) -> Record {
        if route.get("id").and_then(key_string).is_none() {
            route.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }
        route
            .entry("createdAt")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

        let added = route.clone();
        self.modify(ROUTES, move |current| {
            let key = record_key(&route, "id");
            let mut routes: Vec<Record> = records_of(current)
                .into_iter()
                .filter(|r| record_key(r, "id") != key)
                .collect();
            routes.push(route);
            *current = records_value(routes);
            Some(())
        })
        .await;
        added
    }

    /// Lay `updates` over a route; `None` if it is unknown
    pub async fn update_route(&self, id: &str, updates: Record) -> Option<Record> {
        self.update_record(ROUTES, "id", id, updates, |_| true).await
    }

    /// Routes assigned to a driver
    pub async fn get_driver_routes(&self, driver_id: &str) -> Vec<Record> {
        records_of(&self.get(ROUTES).await)
            .into_iter()
            .filter(|route| record_key(route, "driverId").as_deref() == Some(driver_id))
            .collect()
    }

    /// Shallow-merge `updates` into the record of `collection` keyed `id`
    async fn update_record<P>(
        &self,
        collection: &str,
        key_field: &'static str,
        id: &str,
        mut updates: Record,
        accept: P,
    ) -> Option<Record>
    where
        P: Fn(&Record) -> bool + Send,
    {
        updates.remove(key_field);
        self.modify(collection, move |current| {
            let mut records = records_of(current);
            let record = records
                .iter_mut()
                .find(|r| record_key(r, key_field).as_deref() == Some(id) && accept(r))?;
            record.extend(updates);
            let updated = record.clone();
            *current = records_value(records);
            Some(updated)
        })
        .await
    }
}

fn is_driver(user: &Record) -> bool {
    user.get("role").and_then(Value::as_str) == Some(DRIVER_ROLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDocumentStore;
    use crate::config::Config;
    use crate::query::BoundingBox;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn rec(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn store(temp_dir: &TempDir) -> Store {
        let mut config = Config::for_data_dir(temp_dir.path());
        config.seed_defaults = false;
        Store::new(config)
    }

    #[tokio::test]
    async fn test_get_bins_bbox_and_tombstones() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store
            .set(
                BINS,
                json!([
                    {"id": "A", "lat": 25.1, "lng": 55.1},
                    {"id": "X", "lat": 25.1, "lng": 55.1},
                    {"id": "far", "lat": 1.0, "lng": 1.0}
                ]),
            )
            .await
            .unwrap();
        store.add_deleted_bins(vec!["X".into()]).await.unwrap();

        assert_eq!(store.get_bins(&BinQuery::default()).await.total, 2);

        let query = BinQuery {
            bbox: Some(BoundingBox::new(55.0, 25.0, 56.0, 26.0)),
            ..Default::default()
        };
        let page = store.get_bins(&query).await;
        assert_eq!(page.total, 1);
        assert_eq!(page.bins[0]["id"], "A");
    }

    #[tokio::test]
    async fn test_update_bin() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store
            .set(BINS, json!([{"id": "A", "fillLevel": 10}, {"id": "B"}]))
            .await
            .unwrap();

        let updated = store
            .update_bin("A", rec(json!({"fillLevel": 90, "id": "hijack"})))
            .await
            .unwrap();
        assert_eq!(Value::Object(updated), json!({"id": "A", "fillLevel": 90}));
        assert_eq!(store.get(BINS).await[0]["fillLevel"], 90);

        assert!(store.update_bin("missing", Record::new()).await.is_none());

        store.add_deleted_bins(vec!["B".into()]).await.unwrap();
        assert!(store.update_bin("B", rec(json!({"fillLevel": 5}))).await.is_none());
    }

    #[tokio::test]
    async fn test_drivers() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store
            .set(
                USERS,
                json!([
                    {"id": "u1", "role": "admin"},
                    {"id": "d1", "role": "driver", "name": "Sam"}
                ]),
            )
            .await
            .unwrap();

        assert!(store.get_driver_by_id("u1").await.is_none());
        assert_eq!(store.get_driver_by_id("d1").await.unwrap()["name"], "Sam");

        let updated = store
            .update_driver_data("d1", rec(json!({"status": "on-shift"})))
            .await
            .unwrap();
        assert_eq!(updated["status"], "on-shift");
        assert!(store.update_driver_data("u1", rec(json!({"x": 1}))).await.is_none());
    }

    #[tokio::test]
    async fn test_driver_locations() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let stored = store
            .update_driver_location("d1", json!({"lat": 25.2, "lng": 55.3}))
            .await
            .unwrap();
        assert!(stored.contains_key("updatedAt"));
        store
            .update_driver_location("d2", json!({"lat": 1.0, "lng": 2.0}))
            .await
            .unwrap();

        let locations = store.get_driver_locations().await;
        assert_eq!(locations.len(), 2);
        assert_eq!(locations["d1"]["lat"], 25.2);

        assert!(store.update_driver_location("d3", json!("nowhere")).await.is_err());
    }

    #[tokio::test]
    async fn test_routes() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let route = store.add_route(rec(json!({"driverId": "d1", "stops": ["A"]}))).await;
        let id = route["id"].as_str().unwrap().to_string();
        assert!(route.contains_key("createdAt"));
        store.add_route(rec(json!({"id": "r2", "driverId": "d2"}))).await;

        let mine = store.get_driver_routes("d1").await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0]["id"], id.as_str());

        let updated = store
            .update_route(&id, rec(json!({"status": "done"})))
            .await
            .unwrap();
        assert_eq!(updated["status"], "done");
        assert_eq!(updated["driverId"], "d1");
        assert!(store.update_route("nope", Record::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_remote_bins_fall_back_to_local_when_dirty() {
        let temp_dir = TempDir::new().unwrap();
        let driver = Arc::new(MemoryDocumentStore::new());
        let store = Store::with_document_store(Config::for_data_dir(temp_dir.path()), driver.clone());

        store.set(BINS, json!([{"id": "A"}, {"id": "B"}])).await.unwrap();
        // A local write the remote store has not accepted yet
        store.inner.state.lock().dirty.insert(BINS.to_string());
        store.inner.state.lock().put(BINS, json!([{"id": "A"}]));

        assert_eq!(store.get_bins(&BinQuery::default()).await.total, 1);
        assert_eq!(driver.len(BINS), 2);
    }
}

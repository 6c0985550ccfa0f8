//! Append logs: driver messages, chat audit and client error logs
//!
//! Appends fill in `id` and `timestamp` when the entry lacks them and drop
//! the oldest entries once a log grows past its retention limit.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::Store;
use crate::error::{StoreError, StoreResult};
use crate::model::{key_string, CHAT_AUDIT, CLIENT_ERRORS, DRIVER_MESSAGES};
use crate::query::{page_log, CursorQuery, LogPage};

impl Store {
    /// Every message of a driver, in append order
    pub async fn get_driver_messages(&self, driver_id: &str) -> Vec<Value> {
        match self.get(DRIVER_MESSAGES).await {
            Value::Object(mut threads) => match threads.remove(driver_id) {
                Some(Value::Array(messages)) => messages,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    pub async fn get_driver_messages_paginated(&self, driver_id: &str, query: &CursorQuery) -> LogPage {
        page_log(&self.get_driver_messages(driver_id).await, query)
    }

    /// Append a message to a driver's thread; returns the stored entry
    pub async fn add_driver_message(&self, driver_id: &str, message: Value) -> StoreResult<Value> {
        let entry = prepare_entry(DRIVER_MESSAGES, message)?;
        let limit = self.inner.config.retention.driver_messages;

        let stored = entry.clone();
        self.modify(DRIVER_MESSAGES, move |current| {
            if !current.is_object() {
                *current = Value::Object(Default::default());
            }
            let thread = current
                .as_object_mut()?
                .entry(driver_id)
                .or_insert_with(|| Value::Array(Vec::new()));
            if !thread.is_array() {
                *thread = Value::Array(Vec::new());
            }
            append_capped(thread.as_array_mut()?, entry, limit);
            Some(())
        })
        .await;
        Ok(stored)
    }

    pub async fn add_chat_audit_log(&self, entry: Value) -> StoreResult<Value> {
        let limit = self.inner.config.retention.chat_audit;
        self.append(CHAT_AUDIT, entry, limit).await
    }

    pub async fn get_chat_audit_log(&self, query: &CursorQuery) -> LogPage {
        page_log(&self.log_entries(CHAT_AUDIT).await, query)
    }

    pub async fn add_client_error_log(&self, entry: Value) -> StoreResult<Value> {
        let limit = self.inner.config.retention.client_errors;
        self.append(CLIENT_ERRORS, entry, limit).await
    }

    pub async fn get_client_error_logs(&self, query: &CursorQuery) -> LogPage {
        page_log(&self.log_entries(CLIENT_ERRORS).await, query)
    }

    pub async fn clear_client_error_logs(&self) -> StoreResult<()> {
        self.set(CLIENT_ERRORS, Value::Array(Vec::new())).await
    }

    async fn log_entries(&self, key: &str) -> Vec<Value> {
        match self.get(key).await {
            Value::Array(entries) => entries,
            _ => Vec::new(),
        }
    }

    /// Append to a global log collection
    async fn append(&self, key: &str, entry: Value, limit: usize) -> StoreResult<Value> {
        let entry = prepare_entry(key, entry)?;
        let stored = entry.clone();
        self.modify(key, move |current| {
            let id = entry.get("id").cloned();
            let mut entries = match current.take() {
                Value::Array(entries) => entries,
                _ => Vec::new(),
            };
            // Ids are the reconciliation key; a repeated id replaces the entry
            entries.retain(|e| e.get("id") != id.as_ref());
            append_capped(&mut entries, entry, limit);
            *current = Value::Array(entries);
            Some(())
        })
        .await;
        Ok(stored)
    }
}

/// Check a log entry and fill in `id` and `timestamp`
fn prepare_entry(key: &str, entry: Value) -> StoreResult<Value> {
    let Value::Object(mut entry) = entry else {
        return Err(StoreError::invalid(key, "log entry must be an object"));
    };
    if entry.get("id").and_then(key_string).is_none() {
        entry.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
    }
    if entry.get("timestamp").map_or(true, Value::is_null) {
        entry.insert("timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    Ok(Value::Object(entry))
}

/// Push and drop the oldest entries beyond `limit`
fn append_capped(entries: &mut Vec<Value>, entry: Value, limit: usize) {
    entries.push(entry);
    if limit > 0 && entries.len() > limit {
        let excess = entries.len() - limit;
        entries.drain(..excess);
    }
}

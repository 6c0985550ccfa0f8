//! Raw key command handlers

use anyhow::{Context, Result};
use tracing::debug;

use depot_core::Store;

use super::parse_json;
use crate::output::Output;

/// Print the value under a key
pub async fn get(store: &Store, key: &str, output: &Output) -> Result<()> {
    let value = store.get(key).await;
    output.print_value(&value);
    Ok(())
}

/// Replace the value under a key
pub async fn set(store: &Store, key: &str, value: &str, output: &Output) -> Result<()> {
    let value = parse_json(value)?;
    store
        .set(key, value)
        .await
        .with_context(|| format!("Failed to set '{}'", key))?;
    output.success(&format!("Stored '{}'", key));
    Ok(())
}

/// Write a collection with its write policy
pub async fn update(store: &Store, collection: &str, records: &str, output: &Output) -> Result<()> {
    let records = parse_json(records)?;
    debug!("Updating '{}' with {}", collection, records);
    store
        .update_collection(collection, records)
        .await
        .with_context(|| format!("Failed to update '{}'", collection))?;
    output.success(&format!("Updated '{}'", collection));
    Ok(())
}

//! Bin command handlers

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tracing::debug;

use depot_core::{BinQuery, BoundingBox, Store};

use super::parse_json;
use crate::output::Output;

/// List bins, optionally inside a bounding box
pub async fn list(
    store: &Store,
    bbox: Option<String>,
    limit: Option<usize>,
    offset: usize,
    output: &Output,
) -> Result<()> {
    let bbox = bbox
        .map(|text| text.parse::<BoundingBox>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let query = BinQuery {
        bbox,
        limit,
        offset,
    };

    debug!("Listing bins with {:?}", query);
    let page = store.get_bins(&query).await;
    output.print_bins(&page);
    Ok(())
}

/// Update fields of one bin
pub async fn update(store: &Store, id: &str, updates: &str, output: &Output) -> Result<()> {
    let Value::Object(updates) = parse_json(updates)? else {
        bail!("Bin updates must be a JSON object");
    };

    let bin = store
        .update_bin(id, updates)
        .await
        .ok_or_else(|| anyhow!("Bin not found: {}", id))?;

    output.success(&format!("Updated bin {}", id));
    output.print_value(&Value::Object(bin));
    Ok(())
}

/// Tombstone bins
pub async fn delete(store: &Store, ids: Vec<String>, output: &Output) -> Result<()> {
    let count = ids.len();
    store.add_deleted_bins(ids).await?;
    output.success(&format!("Marked {} bin(s) as deleted", count));
    Ok(())
}

//! Status and flush command handlers

use anyhow::{Context, Result};
use tracing::debug;

use depot_core::Store;

use crate::output::Output;

/// Show backend, connection and sync status
pub async fn show(store: &Store, output: &Output) -> Result<()> {
    let connection = store.connection_status().await;
    let health = store.health_check();
    output.print_status(&health, &connection);
    Ok(())
}

/// Retry pending remote writes and rewrite the data file
pub async fn flush(store: &Store, output: &Output) -> Result<()> {
    if let Err(e) = store.flush().await {
        debug!("Flush failed, recoverable: {}", e.is_recoverable());
        if let Some(hint) = e.recovery_suggestion() {
            output.message(hint);
        }
        return Err(e).context("Flush failed");
    }
    output.success(&format!(
        "Flushed to {}",
        store.config().data_path().display()
    ));

    let pending = store.health_check().pending_writes;
    if !pending.is_empty() {
        output.message(&format!(
            "Remote store still missing: {}",
            pending.join(", ")
        ));
    }
    Ok(())
}

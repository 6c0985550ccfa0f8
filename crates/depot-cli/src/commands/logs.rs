//! Driver message and error log command handlers

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde_json::json;

use depot_core::{CursorQuery, Store};

use crate::output::Output;

/// Cursor options shared by the log commands
#[derive(Args, Debug, Clone, Default)]
pub struct PageArgs {
    /// Maximum entries to show (at most 100)
    #[arg(short, long)]
    pub limit: Option<usize>,
    /// Only entries older than this RFC 3339 timestamp, newest first
    #[arg(long)]
    pub before: Option<DateTime<Utc>>,
    /// Only entries newer than this RFC 3339 timestamp
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,
}

impl From<PageArgs> for CursorQuery {
    fn from(args: PageArgs) -> Self {
        CursorQuery {
            limit: args.limit,
            before: args.before,
            since: args.since,
        }
    }
}

/// Show a page of a driver's messages
pub async fn messages(store: &Store, driver: &str, page: PageArgs, output: &Output) -> Result<()> {
    let page = store
        .get_driver_messages_paginated(driver, &page.into())
        .await;
    output.print_log(&page);
    Ok(())
}

/// Append a message to a driver's thread
pub async fn send(store: &Store, driver: &str, text: String, output: &Output) -> Result<()> {
    let message = store
        .add_driver_message(driver, json!({ "text": text, "from": "cli" }))
        .await
        .context("Failed to send message")?;

    output.success(&format!(
        "Sent message {} to {}",
        message["id"].as_str().unwrap_or("-"),
        driver
    ));
    Ok(())
}

/// Show or clear client error logs
pub async fn errors(store: &Store, clear: bool, page: PageArgs, output: &Output) -> Result<()> {
    if clear {
        store.clear_client_error_logs().await?;
        output.success("Cleared client error logs");
        return Ok(());
    }

    let page = store.get_client_error_logs(&page.into()).await;
    output.print_log(&page);
    Ok(())
}

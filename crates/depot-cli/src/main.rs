//! Depot CLI
//!
//! Command-line interface for Depot - inspect and edit the fleet data store.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use depot_core::{Config, Store};

mod commands;
mod output;

use output::{Output, OutputFormat};

/// Log filter variable; defaults to warnings only
const LOG_ENV: &str = "DEPOT_LOG";

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Depot - fleet data store over a remote document backend or a local file")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (defaults to ~/.config/depot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend, connection and sync status
    Status,
    /// Print the value stored under a key
    Get {
        /// Key (collection, keyed map or plain value)
        key: String,
    },
    /// Replace the value stored under a key
    Set {
        /// Key (collection, keyed map or plain value)
        key: String,
        /// JSON value, or - to read it from stdin
        value: String,
    },
    /// Write a collection with its replace or merge policy
    Update {
        /// Collection name
        collection: String,
        /// JSON array of records, or - to read it from stdin
        records: String,
    },
    /// List bins
    #[command(alias = "ls")]
    Bins {
        /// Bounding box: minLng,minLat,maxLng,maxLat
        #[arg(long, allow_hyphen_values = true)]
        bbox: Option<String>,
        /// Maximum bins to return
        #[arg(short, long)]
        limit: Option<usize>,
        /// Bins to skip
        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },
    /// Update fields of one bin
    BinUpdate {
        /// Bin id
        id: String,
        /// JSON object of fields to set
        updates: String,
    },
    /// Mark bins as deleted
    DeleteBins {
        /// Bin ids
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show a driver's messages
    Messages {
        /// Driver id
        driver: String,
        #[command(flatten)]
        page: commands::logs::PageArgs,
    },
    /// Send a message to a driver
    Send {
        /// Driver id
        driver: String,
        /// Message text
        text: String,
    },
    /// Show or clear client error logs
    Errors {
        /// Remove every client error log entry
        #[arg(long)]
        clear: bool,
        #[command(flatten)]
        page: commands::logs::PageArgs,
    },
    /// Write pending changes now
    Flush,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let store = Store::open(config).await;

    let result = match cli.command {
        Commands::Status => commands::status::show(&store, &output).await,
        Commands::Get { key } => commands::data::get(&store, &key, &output).await,
        Commands::Set { key, value } => commands::data::set(&store, &key, &value, &output).await,
        Commands::Update {
            collection,
            records,
        } => commands::data::update(&store, &collection, &records, &output).await,
        Commands::Bins {
            bbox,
            limit,
            offset,
        } => commands::bins::list(&store, bbox, limit, offset, &output).await,
        Commands::BinUpdate { id, updates } => {
            commands::bins::update(&store, &id, &updates, &output).await
        }
        Commands::DeleteBins { ids } => commands::bins::delete(&store, ids, &output).await,
        Commands::Messages { driver, page } => {
            commands::logs::messages(&store, &driver, page, &output).await
        }
        Commands::Send { driver, text } => {
            commands::logs::send(&store, &driver, text, &output).await
        }
        Commands::Errors { clear, page } => {
            commands::logs::errors(&store, clear, page, &output).await
        }
        Commands::Flush => commands::status::flush(&store, &output).await,
    };

    // Final flush so writes reach the backend before exit
    store.close().await;
    result
}

/// Log to stderr, filtered by DEPOT_LOG (e.g. `DEPOT_LOG=depot_core=debug`)
fn init_logging() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("depot_core=warn,depot_cli=warn"));

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;
use serde_json::Value;

use depot_core::{BinPage, ConnectionStatus, HealthReport, LogPage};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print any value as pretty JSON (human and JSON modes alike)
    pub fn print_value(&self, value: &Value) {
        match self.format {
            OutputFormat::Human | OutputFormat::Json => println!("{}", pretty(value)),
            OutputFormat::Quiet => {
                if let Some(text) = value.as_str() {
                    println!("{}", text);
                }
            }
        }
    }

    /// Print one page of bins
    pub fn print_bins(&self, page: &BinPage) {
        match self.format {
            OutputFormat::Human => {
                if page.bins.is_empty() {
                    println!("No bins found.");
                    return;
                }
                for bin in &page.bins {
                    println!(
                        "{:<16} | {:>9} {:>9} | {}",
                        truncate(&field(bin.get("id")), 16),
                        field(bin.get("lat")),
                        field(bin.get("lng")),
                        truncate(&field(bin.get("status")), 20)
                    );
                }
                println!("\n{} of {} bin(s)", page.bins.len(), page.total);
            }
            OutputFormat::Json => println!("{}", pretty(page)),
            OutputFormat::Quiet => {
                for bin in &page.bins {
                    println!("{}", field(bin.get("id")));
                }
            }
        }
    }

    /// Print one page of a log
    pub fn print_log(&self, page: &LogPage) {
        match self.format {
            OutputFormat::Human => {
                if page.entries.is_empty() {
                    println!("No entries found.");
                    return;
                }
                for entry in &page.entries {
                    let text = entry
                        .get("text")
                        .or_else(|| entry.get("message"))
                        .map(|v| field(Some(v)))
                        .unwrap_or_else(|| entry.to_string());
                    println!(
                        "[{}] {}",
                        field(entry.get("timestamp")),
                        truncate_line(&text, 80)
                    );
                }
                if let (true, Some(before)) = (page.has_more, page.next_before) {
                    println!("\nMore entries before {}", before.to_rfc3339());
                }
            }
            OutputFormat::Json => println!("{}", pretty(page)),
            OutputFormat::Quiet => {
                for entry in &page.entries {
                    println!("{}", field(entry.get("id")));
                }
            }
        }
    }

    /// Print health and connection details
    pub fn print_status(&self, health: &HealthReport, connection: &ConnectionStatus) {
        match self.format {
            OutputFormat::Json => {
                println!(
                    "{}",
                    pretty(&serde_json::json!({
                        "health": health,
                        "connection": connection
                    }))
                );
            }
            OutputFormat::Quiet => {
                println!("{}", if connection.ok { "ok" } else { "error" });
            }
            OutputFormat::Human => {
                println!("Depot Status");
                println!("============");
                println!();
                println!("Backend:     {}", connection.backend);
                println!(
                    "Connection:  {}",
                    if connection.ok { "ok" } else { "unreachable" }
                );
                if let Some(ref error) = connection.error {
                    println!("  Error:     {}", error);
                }
                if let Some(ref error) = health.setup_error {
                    println!("Fallback:    remote setup failed ({})", error);
                }
                println!();
                println!(
                    "Last update: {}",
                    health.last_update.format("%Y-%m-%d %H:%M:%S")
                );
                match health.last_sync {
                    Some(at) => println!("Last sync:   {}", at.format("%Y-%m-%d %H:%M:%S")),
                    None => println!("Last sync:   never"),
                }
                if !health.pending_writes.is_empty() {
                    println!("Pending:     {}", health.pending_writes.join(", "));
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn pretty<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Display form of a scalar field; strings without quotes
fn field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Truncate to first line and max length
fn truncate_line(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    truncate(first_line, max_len)
}

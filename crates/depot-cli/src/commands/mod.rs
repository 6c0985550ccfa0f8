//! Command handlers

pub mod bins;
pub mod data;
pub mod logs;
pub mod status;

use std::io::Read;

use anyhow::{Context, Result};
use serde_json::Value;

/// Parse a JSON argument; `-` reads it from stdin
pub fn parse_json(arg: &str) -> Result<Value> {
    let text = if arg == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read JSON from stdin")?;
        buffer
    } else {
        arg.to_string()
    };
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON: {}", text.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json() {
        assert_eq!(parse_json(r#"[{"id": "A"}]"#).unwrap(), json!([{"id": "A"}]));
        assert_eq!(parse_json("42").unwrap(), json!(42));
        assert!(parse_json("{oops").is_err());
    }
}

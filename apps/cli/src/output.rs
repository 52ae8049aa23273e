//! Output formatting utilities

use crate::OutputFormat;
use serde::Serialize;

/// Print output in the specified format
pub fn print_output<T: Serialize + std::fmt::Display>(
    value: &T,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!("{}", value);
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Shorten long strings for table cells
pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let kept: String = value.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("http://host/a/very/long/path.bin", 12), "http://ho...");
    }
}

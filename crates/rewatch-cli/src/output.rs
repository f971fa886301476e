//! Output formatting for CLI

use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "table" => OutputFormat::Table,
            _ => OutputFormat::Text,
        }
    }
}

/// Pretty JSON for machine consumers
pub fn to_json<T: Serialize>(data: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(data)?)
}

/// Render rows as a table
pub fn to_table<T: Tabled>(rows: impl IntoIterator<Item = T>) -> String {
    Table::new(rows).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Tabled)]
    struct Row {
        name: &'static str,
        value: u32,
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(OutputFormat::from("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from("table"), OutputFormat::Table);
        assert_eq!(OutputFormat::from("anything"), OutputFormat::Text);
    }

    #[test]
    fn test_table_has_headers() {
        let table = to_table([Row { name: "720p", value: 1 }]);
        assert!(table.contains("name"));
        assert!(table.contains("720p"));
    }
}

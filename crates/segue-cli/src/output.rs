//! Output formatting for CLI

use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format options
pub enum OutputFormat {
    Text,
    Json,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

/// Pretty JSON rendering of `data`
pub fn to_json<T: Serialize>(data: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(data)?)
}

/// Render rows as a rounded table
pub fn table<T: Tabled>(rows: impl IntoIterator<Item = T>) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

/// One property/value line of a summary table
#[derive(Tabled)]
pub struct PropertyRow {
    pub property: &'static str,
    pub value: String,
}

impl PropertyRow {
    pub fn new(property: &'static str, value: impl ToString) -> Self {
        Self {
            property,
            value: value.to_string(),
        }
    }
}

/// Seconds with millisecond precision
pub fn secs(value: f64) -> String {
    format!("{value:.3}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!(OutputFormat::from("JSON"), OutputFormat::Json));
        assert!(matches!(OutputFormat::from("table"), OutputFormat::Text));
    }

    #[test]
    fn test_property_table() {
        let rendered = table(vec![PropertyRow::new("Segments", 3)]);
        assert!(rendered.contains("Segments"));
        assert!(rendered.contains('3'));
    }
}

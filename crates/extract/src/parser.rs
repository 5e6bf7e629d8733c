use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::schema::{COLUMN_COUNT, Cell, Column, ExtractedRow};

const FIELD_SEPARATOR: char = '\t';

static KEY_VALUE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*]\s*)?\**([A-Za-z0-9_ ]+?)\**\s*:\s*(.+?)\s*$").expect("valid key-value regex")
});

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("valid fenced block regex"));

/// One way of turning model text into rows. `None` means the strategy does not
/// recognise the text at all; `Some` with zero rows means it recognised the
/// shape but nothing usable came out.
pub trait ParseStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, text: &str) -> Option<Vec<ExtractedRow>>;
}

/// Header line with the first column name, then tab-separated data lines.
pub struct TabularStrategy;

impl ParseStrategy for TabularStrategy {
    fn name(&self) -> &'static str {
        "tabular"
    }

    fn parse(&self, text: &str) -> Option<Vec<ExtractedRow>> {
        let marker = Column::IdStudy.name();
        let mut lines = text.lines();

        lines.find(|line| {
            let line = line.trim_start();
            line.contains(&format!("{}{}", marker, FIELD_SEPARATOR))
                || (line.starts_with(marker) && line.contains(FIELD_SEPARATOR))
        })?;

        let mut rows = Vec::new();
        for (line_no, line) in lines.enumerate() {
            let line = line.trim_end_matches('\r');
            if !line.contains(FIELD_SEPARATOR) {
                continue;
            }

            let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
            match ExtractedRow::from_fields(&fields) {
                Some(row) => rows.push(row),
                None => warn!(
                    line = line_no + 1,
                    fields = fields.len(),
                    expected = COLUMN_COUNT,
                    "Dropping row with wrong field count"
                ),
            }
        }

        Some(rows)
    }
}

/// A JSON object (or array of objects) keyed by column names.
pub struct JsonObjectStrategy;

impl ParseStrategy for JsonObjectStrategy {
    fn name(&self) -> &'static str {
        "json_object"
    }

    fn parse(&self, text: &str) -> Option<Vec<ExtractedRow>> {
        let value = parse_json_candidates(text)?;

        let objects: Vec<&serde_json::Map<String, Value>> = match &value {
            Value::Object(map) => vec![map],
            Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
            _ => return None,
        };

        let rows: Vec<ExtractedRow> = objects
            .into_iter()
            .filter_map(|map| {
                let mut row = ExtractedRow::missing();
                let mut recognised = 0;
                for (key, value) in map {
                    if let Some(column) = lookup_column(key) {
                        row.set(column, Cell::parse(&json_scalar(value)));
                        recognised += 1;
                    }
                }
                (recognised > 0).then_some(row)
            })
            .collect();

        (!rows.is_empty()).then_some(rows)
    }
}

/// `Column: value` lines, one row per response.
pub struct KeyValueStrategy;

impl ParseStrategy for KeyValueStrategy {
    fn name(&self) -> &'static str {
        "key_value"
    }

    fn parse(&self, text: &str) -> Option<Vec<ExtractedRow>> {
        let mut row = ExtractedRow::missing();
        let mut recognised = 0;

        for line in text.lines() {
            let Some(captures) = KEY_VALUE_LINE.captures(line) else {
                continue;
            };
            if let Some(column) = lookup_column(&captures[1]) {
                row.set(column, Cell::parse(&captures[2]));
                recognised += 1;
            }
        }

        (recognised > 0).then(|| vec![row])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Rows {
        rows: Vec<ExtractedRow>,
        strategy: &'static str,
    },
    /// Nothing recognisable; the raw text is kept for diagnostics.
    Unstructured(String),
}

impl ParsedResponse {
    pub fn rows(&self) -> &[ExtractedRow] {
        match self {
            ParsedResponse::Rows { rows, .. } => rows,
            ParsedResponse::Unstructured(_) => &[],
        }
    }

    pub fn into_rows(self) -> Vec<ExtractedRow> {
        match self {
            ParsedResponse::Rows { rows, .. } => rows,
            ParsedResponse::Unstructured(_) => Vec::new(),
        }
    }

    pub fn is_unstructured(&self) -> bool {
        matches!(self, ParsedResponse::Unstructured(_))
    }
}

/// Tries its strategies in order; the first one that recognises the text wins.
pub struct ResponseParser {
    strategies: Vec<Box<dyn ParseStrategy>>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::with_strategies(vec![
            Box::new(TabularStrategy),
            Box::new(JsonObjectStrategy),
            Box::new(KeyValueStrategy),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ParseStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn parse(&self, raw: &str) -> ParsedResponse {
        for strategy in &self.strategies {
            if let Some(rows) = strategy.parse(raw) {
                debug!(strategy = strategy.name(), rows = rows.len(), "Parsed model response");
                return ParsedResponse::Rows {
                    rows,
                    strategy: strategy.name(),
                };
            }
        }

        warn!(chars = raw.len(), "No parse strategy recognised the response");
        ParsedResponse::Unstructured(raw.to_string())
    }
}

/// Find a JSON value in free text: fenced block, then brace span, then the whole text.
pub fn extract_json(text: &str) -> Option<Value> {
    parse_json_candidates(text)
}

fn parse_json_candidates(text: &str) -> Option<Value> {
    let fenced = FENCED_JSON
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim());

    let braces = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    };

    let brackets = match (text.find('['), text.rfind(']')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    };

    [fenced, braces, brackets, Some(text.trim())]
        .into_iter()
        .flatten()
        .find_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .filter(|value| value.is_object() || value.is_array())
}

fn lookup_column(key: &str) -> Option<Column> {
    let wanted = normalise_key(key);
    Column::ALL
        .iter()
        .copied()
        .find(|column| normalise_key(column.name()) == wanted)
}

fn normalise_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn json_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Missing, header_line};

    fn data_line(study: &str, estimate: &str, inflation: &str) -> String {
        let mut fields = vec!["NA".to_string(); COLUMN_COUNT];
        fields[0] = study.to_string();
        fields[1] = estimate.to_string();
        fields[Column::ResultsInflation.index()] = inflation.to_string();
        fields.join("\t")
    }

    #[test]
    fn test_tabular_rows_keep_order() {
        let text = format!(
            "Here is the table:\n{}\n{}\n{}\n{}\n",
            header_line(),
            data_line("1", "1", "0.02"),
            data_line("1", "2", "-0.01"),
            data_line("1", "3", "0"),
        );

        let parsed = ResponseParser::new().parse(&text);
        let rows = parsed.rows();

        assert!(matches!(parsed, ParsedResponse::Rows { strategy: "tabular", .. }));
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].value(Column::IdEstimate), Some("2"));
        assert_eq!(rows[1].value(Column::ResultsInflation), Some("-0.01"));
        assert_eq!(rows[2].value(Column::ResultsInflation), Some("0"));
    }

    #[test]
    fn test_wrong_width_row_dropped_without_aborting() {
        let text = format!(
            "{}\n{}\nshort\trow\n{}\n",
            header_line(),
            data_line("1", "1", "0.02"),
            data_line("1", "2", "0.03"),
        );

        let rows = ResponseParser::new().parse(&text).into_rows();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].value(Column::ResultsInflation), Some("0.03"));
    }

    #[test]
    fn test_header_without_valid_rows_is_empty_table() {
        let text = format!("{}\nonly\ttwo\n", header_line());
        let parsed = ResponseParser::new().parse(&text);

        assert!(matches!(parsed, ParsedResponse::Rows { ref rows, .. } if rows.is_empty()));
    }

    #[test]
    fn test_json_object_recovery() {
        let text = r#"I could not produce a table. {"Author": "Smith, J. (2020)", "Year": 2020, "unknown_key": 1, "DOI": null}"#;

        let parsed = ResponseParser::new().parse(text);
        let rows = parsed.rows();

        assert!(matches!(parsed, ParsedResponse::Rows { strategy: "json_object", .. }));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value(Column::Author), Some("Smith, J. (2020)"));
        assert_eq!(rows[0].value(Column::Year), Some("2020"));
        assert_eq!(*rows[0].get(Column::Doi), Cell::Missing(Missing::Unknown));
    }

    #[test]
    fn test_key_value_recovery() {
        let text = "- **Author**: Smith, J. (2020)\nAuthor_Affiliation: Cannot find affiliation\nNotes: none";

        let rows = ResponseParser::new().parse(text).into_rows();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value(Column::Author), Some("Smith, J. (2020)"));
        assert_eq!(*rows[0].get(Column::AuthorAffiliation), Cell::Missing(Missing::NotFound));
    }

    #[test]
    fn test_unrecognised_text_is_unstructured() {
        let parsed = ResponseParser::new().parse("The paper does not discuss inflation.");

        assert_eq!(
            parsed,
            ParsedResponse::Unstructured("The paper does not discuss inflation.".to_string())
        );
    }

    #[test]
    fn test_extract_json_prefers_fenced_block() {
        let text = "Result:\n```json\n{\"has_inflation_data\": true}\n```\nDone {not json}";
        let value = extract_json(text).unwrap();

        assert_eq!(value["has_inflation_data"], Value::Bool(true));
        assert!(extract_json("no json here").is_none());
    }
}

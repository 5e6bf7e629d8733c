use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use crate::config::RecoveryConfig;
use crate::schema::{Cell, Column, ExtractedRow};

pub const RECOVERED_TABLE: &str = "Text";
pub const RECOVERED_ASSUMPTION: &str = "From main text";

static INFLATION_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:inflation|π|\bpi)\s*[=:]\s*(-?\d+(?:\.\d+)?)\s*(%)?").expect("valid inflation value regex")
});

/// Outcome rows read straight from document text, for studies where no model
/// response carried an outcome value.
///
/// Only `inflation = x`, `π: x` and `pi = x` statements in the first
/// `scan_chars` characters are considered. Values written as percentages
/// (a `%` suffix, or a magnitude above 1) are rescaled to fractions.
pub fn recover_outcomes(text: &str, config: &RecoveryConfig) -> Vec<ExtractedRow> {
    let scanned = match text.char_indices().nth(config.scan_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    };

    let rows: Vec<ExtractedRow> = INFLATION_VALUE
        .captures_iter(scanned)
        .filter_map(|caps| {
            let value: f64 = caps[1].parse().ok()?;
            let is_percent = caps.get(2).is_some() || value.abs() > 1.0;
            Some(if is_percent { value / 100.0 } else { value })
        })
        .take(config.max_rows)
        .enumerate()
        .map(|(i, value)| {
            let mut row = ExtractedRow::missing();
            row.set(Column::IdEstimate, Cell::value((i + 1).to_string()));
            row.set(Column::ResultsTable, Cell::value(RECOVERED_TABLE));
            row.set(Column::ResultsInflation, Cell::value(value.to_string()));
            row.set(Column::ResultsInflationAssumption, Cell::value(RECOVERED_ASSUMPTION));
            row
        })
        .collect();

    debug!(scanned_chars = scanned.chars().count(), rows = rows.len(), "Text recovery scan");
    rows
}

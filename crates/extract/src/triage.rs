use ingest::Chunk;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::parser::extract_json;
use crate::schema::{Cell, Column};

/// Screening outcome for a document (or one chunk of it).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageResult {
    pub has_target_data: bool,
    /// 1-based page numbers, sorted and deduplicated.
    pub relevant_positions: Vec<u32>,
    pub confidence: f64,
    /// Basic study information seen while screening; only real values are kept.
    pub preliminary_values: BTreeMap<Column, String>,
    pub estimated_row_count: u32,
    pub estimated_parameter_count: u32,
    pub target_tables: Vec<String>,
    pub parameter_locations: Vec<String>,
}

/// How conflicting basic-info values from several chunks are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasicInfoPolicy {
    /// First real value in page order wins.
    #[default]
    FirstNonMissing,
    /// Values from the highest-confidence chunk win; page order breaks ties.
    MostConfident,
}

const BASIC_INFO_KEYS: &[(&str, Column)] = &[
    ("author", Column::Author),
    ("author_affiliation", Column::AuthorAffiliation),
    ("year", Column::Year),
    ("journal", Column::JournalName),
    ("model_type", Column::BaseModelType),
    ("doi", Column::Doi),
    ("country", Column::Country),
];

const DEFAULT_CONFIDENCE: f64 = 0.5;

impl TriageResult {
    /// Decode the screening JSON for one chunk. Positions outside the chunk
    /// are discarded and confidence is clamped into [0, 1].
    pub fn from_response(text: &str, chunk: &Chunk) -> Option<Self> {
        let value = extract_json(text)?;
        let object = value.as_object()?;

        let mut relevant_positions: Vec<u32> = object
            .get("relevant_pdf_positions")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(as_count).collect())
            .unwrap_or_default();
        relevant_positions.retain(|page| chunk.contains(*page));
        relevant_positions.sort_unstable();
        relevant_positions.dedup();

        let confidence = object
            .get("confidence_score")
            .and_then(as_float)
            .unwrap_or(DEFAULT_CONFIDENCE)
            .clamp(0.0, 1.0);

        let mut preliminary_values = BTreeMap::new();
        if let Some(info) = object.get("basic_info").and_then(Value::as_object) {
            for (key, column) in BASIC_INFO_KEYS {
                let cell = info.get(*key).map(as_text).map(|raw| Cell::parse(&raw));
                if let Some(Cell::Value(v)) = cell {
                    preliminary_values.insert(*column, v);
                }
            }
        }

        Some(Self {
            has_target_data: object
                .get("has_inflation_data")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            relevant_positions,
            confidence,
            preliminary_values,
            estimated_row_count: object
                .get("estimated_inflation_values")
                .and_then(as_count)
                .unwrap_or(0),
            estimated_parameter_count: object
                .get("estimated_parameter_values")
                .and_then(as_count)
                .unwrap_or(0),
            target_tables: string_list(object.get("tables_with_inflation")),
            parameter_locations: string_list(object.get("parameter_tables"))
                .into_iter()
                .chain(string_list(object.get("parameter_locations")))
                .collect(),
        })
    }

    /// Combine per-chunk results, given in page order.
    pub fn aggregate(results: &[TriageResult], policy: BasicInfoPolicy) -> TriageResult {
        let mut combined = TriageResult::default();

        for result in results {
            combined.has_target_data |= result.has_target_data;
            combined.relevant_positions.extend(&result.relevant_positions);
            combined.confidence = combined.confidence.max(result.confidence);
            combined.estimated_row_count += result.estimated_row_count;
            combined.estimated_parameter_count += result.estimated_parameter_count;
            push_unique(&mut combined.target_tables, &result.target_tables);
            push_unique(&mut combined.parameter_locations, &result.parameter_locations);
        }
        combined.relevant_positions.sort_unstable();
        combined.relevant_positions.dedup();

        let mut ordered: Vec<&TriageResult> = results.iter().collect();
        if policy == BasicInfoPolicy::MostConfident {
            ordered.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        }
        for result in ordered {
            for (column, value) in &result.preliminary_values {
                combined
                    .preliminary_values
                    .entry(*column)
                    .or_insert_with(|| value.clone());
            }
        }

        combined
    }

    /// Whether later stages may restrict themselves to `relevant_positions`.
    pub fn scopes_extraction(&self, min_confidence: f64) -> bool {
        self.confidence > min_confidence && !self.relevant_positions.is_empty()
    }
}

fn push_unique(into: &mut Vec<String>, from: &[String]) {
    for item in from {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

fn as_count(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(as_text)
                .filter(|s| !s.trim().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_result(positions: &[u32], confidence: f64, author: Option<&str>, rows: u32) -> TriageResult {
        let mut preliminary_values = BTreeMap::new();
        if let Some(author) = author {
            preliminary_values.insert(Column::Author, author.to_string());
        }
        TriageResult {
            has_target_data: !positions.is_empty(),
            relevant_positions: positions.to_vec(),
            confidence,
            preliminary_values,
            estimated_row_count: rows,
            ..TriageResult::default()
        }
    }

    #[test]
    fn test_from_response_filters_positions_to_chunk() {
        let text = r#"```json
        {"has_inflation_data": true, "confidence_score": 1.7,
         "relevant_pdf_positions": [12, 3, "14", 35, 12],
         "tables_with_inflation": ["Table 2"],
         "basic_info": {"author": "Smith, J. (2020)", "year": "NA", "doi": "10.1/x"},
         "estimated_inflation_values": "4"}
        ```"#;
        let chunk = Chunk::new(11, 20, 40);

        let triage = TriageResult::from_response(text, &chunk).unwrap();

        assert!(triage.has_target_data);
        assert_eq!(triage.relevant_positions, vec![12, 14]);
        assert_eq!(triage.confidence, 1.0);
        assert_eq!(triage.estimated_row_count, 4);
        assert_eq!(triage.preliminary_values.get(&Column::Author).map(String::as_str), Some("Smith, J. (2020)"));
        assert!(!triage.preliminary_values.contains_key(&Column::Year));
        assert_eq!(triage.target_tables, vec!["Table 2".to_string()]);
    }

    #[test]
    fn test_from_response_rejects_non_json() {
        assert!(TriageResult::from_response("no data here", &Chunk::new(1, 5, 5)).is_none());
    }

    #[test]
    fn test_aggregate_unions_and_sums() {
        let results = vec![
            chunk_result(&[], 0.2, None, 0),
            chunk_result(&[14, 12], 0.9, Some("Smith"), 2),
            chunk_result(&[12, 31], 0.4, Some("Jones"), 1),
        ];

        let combined = TriageResult::aggregate(&results, BasicInfoPolicy::FirstNonMissing);

        assert!(combined.has_target_data);
        assert_eq!(combined.relevant_positions, vec![12, 14, 31]);
        assert_eq!(combined.confidence, 0.9);
        assert_eq!(combined.estimated_row_count, 3);
        assert_eq!(combined.preliminary_values[&Column::Author], "Smith");
    }

    #[test]
    fn test_most_confident_policy_prefers_confident_chunk() {
        let results = vec![
            chunk_result(&[2], 0.3, Some("Smith"), 1),
            chunk_result(&[8], 0.8, Some("Jones"), 1),
        ];

        let combined = TriageResult::aggregate(&results, BasicInfoPolicy::MostConfident);

        assert_eq!(combined.preliminary_values[&Column::Author], "Jones");
    }

    #[test]
    fn test_aggregate_of_nothing_has_no_data() {
        let combined = TriageResult::aggregate(&[], BasicInfoPolicy::FirstNonMissing);

        assert!(!combined.has_target_data);
        assert!(!combined.scopes_extraction(0.1));
    }

    #[test]
    fn test_low_confidence_does_not_scope() {
        let triage = chunk_result(&[3], 0.1, None, 1);

        assert!(!triage.scopes_extraction(0.1));
        assert!(chunk_result(&[3], 0.5, None, 1).scopes_extraction(0.1));
    }
}

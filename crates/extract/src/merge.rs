use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MergeConfig;
use crate::schema::{Cell, Column, ColumnOwner, ExtractedRow, Missing, ValueKind};
use crate::triage::TriageResult;

/// Which stage's value survives for columns both structure and results fill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedFieldPrecedence {
    /// Per-outcome values override the study-level answer.
    #[default]
    ResultsWins,
    StructureWins,
}

const PLAUSIBLE_RANGES: &[(Column, f64, f64)] = &[
    (Column::HouseholdsDiscountFactor, 0.9, 1.0),
    (Column::LaborShareOfOutput, 0.5, 0.8),
    (Column::Ar1CoefficientOfTfp, 0.8, 1.0),
    (Column::ResultsInflation, -0.1, 0.1),
];

/// Stage rows for one study, as handed to the merger.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageRows<'a> {
    pub triage: Option<&'a TriageResult>,
    pub metadata: &'a [ExtractedRow],
    pub structure: &'a [ExtractedRow],
    pub results: &'a [ExtractedRow],
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedStudy {
    pub rows: Vec<ExtractedRow>,
    pub warnings: Vec<String>,
    /// The results stage's own estimate numbering was replaced.
    pub renumbered: bool,
}

pub struct ResultMerger {
    config: MergeConfig,
}

impl ResultMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn merge(&self, study_id: u32, stages: StageRows<'_>) -> MergedStudy {
        let mut base = ExtractedRow::missing();

        if let Some(triage) = stages.triage {
            for (column, value) in &triage.preliminary_values {
                if column.owner() == ColumnOwner::Metadata {
                    base.set(*column, checked(*column, &Cell::value(value.clone())));
                }
            }
        }
        if let Some(metadata) = stages.metadata.first() {
            overlay_columns(&mut base, metadata, Column::owned_by_metadata);
        }
        let structure = stages.structure.first();
        if let Some(structure) = structure {
            overlay_columns(&mut base, structure, Column::owned_by_structure);
        }
        if stages.structure.len() > 1 {
            debug!(rows = stages.structure.len(), "Structure stage returned several rows, using the first");
        }

        let mut rows: Vec<ExtractedRow> = if stages.results.is_empty() {
            vec![base.clone()]
        } else {
            stages
                .results
                .iter()
                .map(|result| {
                    let mut row = base.clone();
                    overlay_columns(&mut row, result, Column::owned_by_results);
                    if self.config.shared_field_precedence == SharedFieldPrecedence::StructureWins {
                        if let Some(structure) = structure {
                            overlay_columns(&mut row, structure, |c| c.owner() == ColumnOwner::Shared);
                        }
                    }
                    row
                })
                .collect()
        };

        let renumbered = renumber(&mut rows, stages.results);
        for row in &mut rows {
            row.set(Column::IdStudy, Cell::value(study_id.to_string()));
        }

        let warnings = plausibility_warnings(&rows);
        for message in &warnings {
            warn!(study_id, "{}", message);
        }

        MergedStudy {
            rows,
            warnings,
            renumbered,
        }
    }
}

fn overlay_columns(target: &mut ExtractedRow, source: &ExtractedRow, owned: impl Fn(Column) -> bool) {
    for (column, cell) in source.iter() {
        if owned(column) && column.kind() != ValueKind::Identity {
            let incoming = checked(column, cell);
            let mut current = target.get(column).clone();
            current.overlay(&incoming);
            target.set(column, current);
        }
    }
}

/// Type check one incoming cell; values of the wrong shape become unknown.
fn checked(column: Column, cell: &Cell) -> Cell {
    let Cell::Value(raw) = cell else {
        return cell.clone();
    };
    let value = raw.trim();

    let accepted = match column.kind() {
        ValueKind::Identity | ValueKind::Text => Some(value.to_string()),
        ValueKind::Integer => {
            (!value.is_empty() && value.chars().all(|c| c.is_ascii_digit())).then(|| value.to_string())
        }
        ValueKind::Binary => matches!(value, "0" | "1").then(|| value.to_string()),
        ValueKind::Numeric => coerce_number(value).map(|n| n.to_string()),
    };

    match accepted {
        Some(v) => Cell::Value(v),
        None => {
            debug!(column = column.name(), value, "Discarding value of the wrong type");
            Cell::Missing(Missing::Unknown)
        }
    }
}

fn coerce_number(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Estimate ids are 1..N in results order; returns whether the model's own
/// numbering disagreed.
fn renumber(rows: &mut [ExtractedRow], results: &[ExtractedRow]) -> bool {
    let consistent = results
        .iter()
        .enumerate()
        .all(|(i, row)| row.value(Column::IdEstimate).map(str::trim) == Some((i + 1).to_string().as_str()));

    for (i, row) in rows.iter_mut().enumerate() {
        row.set(Column::IdEstimate, Cell::value((i + 1).to_string()));
    }

    if !consistent {
        debug!(rows = rows.len(), "Re-indexed estimate ids");
    }
    !consistent
}

fn plausibility_warnings(rows: &[ExtractedRow]) -> Vec<String> {
    PLAUSIBLE_RANGES
        .iter()
        .filter_map(|(column, min, max)| {
            let outside = rows
                .iter()
                .filter_map(|row| row.value(*column))
                .filter_map(|v| v.parse::<f64>().ok())
                .filter(|v| v < min || v > max)
                .count();
            (outside > 0).then(|| {
                format!(
                    "{}: {} value(s) outside expected range {}-{}",
                    column.name(),
                    outside,
                    min,
                    max
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row(values: &[(Column, &str)]) -> ExtractedRow {
        let mut row = ExtractedRow::missing();
        for (column, value) in values {
            row.set(*column, Cell::parse(value));
        }
        row
    }

    fn merger() -> ResultMerger {
        ResultMerger::new(MergeConfig::default())
    }

    fn assert_complete(rows: &[ExtractedRow]) {
        for row in rows {
            let rendered = row.render();
            assert_eq!(rendered.len(), 47);
            assert!(rendered.iter().all(|v| !v.is_empty()));
        }
    }

    #[test]
    fn test_empty_stages_yield_one_placeholder() {
        let merged = merger().merge(7, StageRows::default());

        assert_eq!(merged.rows.len(), 1);
        assert_complete(&merged.rows);
        assert_eq!(merged.rows[0], ExtractedRow::placeholder(7));
    }

    #[test]
    fn test_metadata_broadcast_and_results_per_row() {
        let metadata = [row(&[(Column::Author, "Smith, J. (2020)"), (Column::Year, "2020")])];
        let structure = [row(&[(Column::HhIncluded, "1")])];
        let results = [
            row(&[(Column::IdEstimate, "1"), (Column::ResultsInflation, "0.02")]),
            row(&[(Column::IdEstimate, "2"), (Column::ResultsInflation, "-0.005")]),
            row(&[(Column::IdEstimate, "3"), (Column::ResultsInflation, "0.0")]),
        ];

        let merged = merger().merge(
            2,
            StageRows {
                triage: None,
                metadata: &metadata,
                structure: &structure,
                results: &results,
            },
        );

        assert_eq!(merged.rows.len(), 3);
        assert!(!merged.renumbered);
        assert_complete(&merged.rows);
        for (i, row) in merged.rows.iter().enumerate() {
            assert_eq!(row.value(Column::IdStudy), Some("2"));
            assert_eq!(row.value(Column::IdEstimate), Some((i + 1).to_string().as_str()));
            assert_eq!(row.value(Column::Author), Some("Smith, J. (2020)"));
            assert_eq!(row.value(Column::HhIncluded), Some("1"));
        }
        assert_eq!(merged.rows[1].value(Column::ResultsInflation), Some("-0.005"));
        assert_eq!(merged.rows[2].value(Column::ResultsInflation), Some("0"));
    }

    #[test]
    fn test_shared_field_precedence_is_configurable() {
        let structure = [row(&[(Column::ZeroLowerBound, "0"), (Column::FlexiblePriceAssumption, "1")])];
        let results = [row(&[(Column::ResultsInflation, "0.01"), (Column::ZeroLowerBound, "1")])];
        let stages = StageRows {
            triage: None,
            metadata: &[],
            structure: &structure,
            results: &results,
        };

        let results_win = merger().merge(1, stages);
        assert_eq!(results_win.rows[0].value(Column::ZeroLowerBound), Some("1"));
        assert_eq!(results_win.rows[0].value(Column::FlexiblePriceAssumption), Some("1"));

        let structure_wins = ResultMerger::new(MergeConfig {
            shared_field_precedence: SharedFieldPrecedence::StructureWins,
        })
        .merge(1, stages);
        assert_eq!(structure_wins.rows[0].value(Column::ZeroLowerBound), Some("0"));
    }

    #[test]
    fn test_type_checks_blank_bad_values() {
        let metadata = [row(&[(Column::Year, "2020a"), (Column::NumCitations, "42")])];
        let structure = [row(&[(Column::HhIncluded, "yes"), (Column::FirmsIncluded, "0")])];
        let results = [row(&[(Column::ResultsInflation, "2%"), (Column::HouseholdsDiscountFactor, " 0.990 ")])];

        let merged = merger().merge(
            1,
            StageRows {
                triage: None,
                metadata: &metadata,
                structure: &structure,
                results: &results,
            },
        );
        let row = &merged.rows[0];

        assert_eq!(row.value(Column::Year), None);
        assert_eq!(row.value(Column::NumCitations), Some("42"));
        assert_eq!(row.value(Column::HhIncluded), None);
        assert_eq!(row.value(Column::FirmsIncluded), Some("0"));
        assert_eq!(row.value(Column::ResultsInflation), None);
        assert_eq!(row.value(Column::HouseholdsDiscountFactor), Some("0.99"));
        assert_complete(&merged.rows);
    }

    #[test]
    fn test_triage_seeds_have_lowest_precedence() {
        let mut preliminary_values = BTreeMap::new();
        preliminary_values.insert(Column::Author, "Seed".to_string());
        preliminary_values.insert(Column::AuthorAffiliation, "Harvard".to_string());
        let triage = TriageResult {
            preliminary_values,
            ..TriageResult::default()
        };
        let metadata = [row(&[(Column::Author, "Smith"), (Column::AuthorAffiliation, "Cannot find affiliation")])];

        let merged = merger().merge(
            1,
            StageRows {
                triage: Some(&triage),
                metadata: &metadata,
                structure: &[],
                results: &[],
            },
        );

        assert_eq!(merged.rows[0].value(Column::Author), Some("Smith"));
        assert_eq!(merged.rows[0].value(Column::AuthorAffiliation), Some("Harvard"));
    }

    #[test]
    fn test_not_found_survives_to_export() {
        let metadata = [row(&[(Column::AuthorAffiliation, "Cannot find affiliation")])];

        let merged = merger().merge(
            1,
            StageRows {
                metadata: &metadata,
                ..StageRows::default()
            },
        );

        let rendered = merged.rows[0].render();
        assert_eq!(rendered[Column::AuthorAffiliation.index()], "Cannot find affiliation");
    }

    #[test]
    fn test_inconsistent_estimate_ids_are_renumbered() {
        let results = [
            row(&[(Column::IdEstimate, "4"), (Column::ResultsInflation, "0.01")]),
            row(&[(Column::ResultsInflation, "0.02")]),
        ];

        let merged = merger().merge(
            3,
            StageRows {
                results: &results,
                ..StageRows::default()
            },
        );

        assert!(merged.renumbered);
        assert_eq!(merged.rows[0].value(Column::IdEstimate), Some("1"));
        assert_eq!(merged.rows[1].value(Column::IdEstimate), Some("2"));
    }

    #[test]
    fn test_model_cannot_override_study_id() {
        let results = [row(&[(Column::IdStudy, "99"), (Column::ResultsInflation, "0.01")])];

        let merged = merger().merge(
            5,
            StageRows {
                results: &results,
                ..StageRows::default()
            },
        );

        assert_eq!(merged.rows[0].value(Column::IdStudy), Some("5"));
    }

    #[test]
    fn test_implausible_values_only_warn() {
        let results = [row(&[(Column::ResultsInflation, "0.5"), (Column::LaborShareOfOutput, "0.67")])];

        let merged = merger().merge(
            1,
            StageRows {
                results: &results,
                ..StageRows::default()
            },
        );

        assert_eq!(merged.warnings.len(), 1);
        assert!(merged.warnings[0].starts_with("Results_Inflation"));
        assert_eq!(merged.rows[0].value(Column::ResultsInflation), Some("0.5"));
    }
}

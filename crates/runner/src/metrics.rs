use chrono::{DateTime, Utc};
use extract::{StageKind, StageOutput, StageStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Lifecycle of one document's study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyStatus {
    Pending,
    Screening,
    Extracting,
    Merging,
    Success,
    EmptyResult,
    Failed,
    Skipped,
}

impl StudyStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StudyStatus::Success | StudyStatus::EmptyResult | StudyStatus::Failed | StudyStatus::Skipped
        )
    }

    pub fn can_transition_to(self, next: StudyStatus) -> bool {
        use StudyStatus::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Screening) | (Pending, Skipped) => true,
            (Screening, EmptyResult) | (Screening, Extracting) => true,
            (Extracting, Merging) => true,
            (Merging, Success) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub validated: usize,
    pub escalated: usize,
    pub partial: usize,
    pub failed: usize,
    pub exhausted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowCountVerdict {
    Match,
    /// Fewer outcome rows than triage estimated, but some.
    Shortfall,
    /// Triage estimated outcomes and none were extracted.
    NoneFound,
    /// More outcome rows than triage estimated.
    Bonus,
}

/// Triage's estimated outcome count against the rows the results stage produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCountCheck {
    pub expected: u32,
    pub actual: usize,
    pub verdict: RowCountVerdict,
}

impl RowCountCheck {
    pub fn new(expected: u32, actual: usize) -> Self {
        let verdict = match actual.cmp(&(expected as usize)) {
            Ordering::Equal => RowCountVerdict::Match,
            Ordering::Greater => RowCountVerdict::Bonus,
            Ordering::Less if actual == 0 => RowCountVerdict::NoneFound,
            Ordering::Less => RowCountVerdict::Shortfall,
        };
        Self {
            expected,
            actual,
            verdict,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCountStats {
    pub checked: usize,
    pub matched: usize,
    pub shortfall: usize,
    pub none_found: usize,
    pub bonus: usize,
    pub expected_total: u64,
    pub actual_total: u64,
}

impl RowCountStats {
    pub fn record(&mut self, check: &RowCountCheck) {
        self.checked += 1;
        self.expected_total += u64::from(check.expected);
        self.actual_total += check.actual as u64;
        match check.verdict {
            RowCountVerdict::Match => self.matched += 1,
            RowCountVerdict::Shortfall => self.shortfall += 1,
            RowCountVerdict::NoneFound => self.none_found += 1,
            RowCountVerdict::Bonus => self.bonus += 1,
        }
    }

    /// Extracted outcome rows as a percentage of triage's estimate.
    pub fn extraction_rate(&self) -> Option<f64> {
        (self.expected_total > 0).then(|| self.actual_total as f64 / self.expected_total as f64 * 100.0)
    }
}

/// Run-level totals, reported at the end of a run and exported with the data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_files: usize,
    pub successful: usize,
    pub empty_results: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Successful studies whose results stage yielded no outcome rows.
    pub studies_without_rows: usize,
    /// Studies whose outcome rows came from the document text scan.
    pub recovered_studies: usize,
    pub total_rows: usize,
    pub model_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub rate_limit_delays: u64,
    pub cache_hits: usize,
    pub stages: BTreeMap<StageKind, StageCounts>,
    pub row_counts: RowCountStats,
    pub elapsed_secs: f64,
}

impl RunStats {
    pub fn record_outcome(&mut self, status: StudyStatus, rows: usize) {
        self.total_files += 1;
        self.total_rows += rows;
        match status {
            StudyStatus::Success => self.successful += 1,
            StudyStatus::EmptyResult => self.empty_results += 1,
            StudyStatus::Skipped => self.skipped += 1,
            _ => self.failed += 1,
        }
    }

    pub fn record_stage(&mut self, output: &StageOutput) {
        let counts = self.stages.entry(output.kind).or_default();
        match output.status {
            StageStatus::Validated => counts.validated += 1,
            StageStatus::Escalated => counts.escalated += 1,
            StageStatus::Partial => counts.partial += 1,
            StageStatus::Failed => counts.failed += 1,
            StageStatus::Exhausted => counts.exhausted += 1,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_files == 0 {
            0.0
        } else {
            self.successful as f64 / self.total_files as f64 * 100.0
        }
    }

    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Documents processed: {}", self.total_files);
        let _ = writeln!(
            out,
            "  successful: {} ({:.1}%), no target data: {}, failed: {}, skipped: {}",
            self.successful,
            self.success_rate(),
            self.empty_results,
            self.failed,
            self.skipped
        );
        if self.studies_without_rows > 0 {
            let _ = writeln!(out, "  studies without outcome rows: {}", self.studies_without_rows);
        }
        if self.recovered_studies > 0 {
            let _ = writeln!(out, "  studies with outcomes recovered from text: {}", self.recovered_studies);
        }
        let _ = writeln!(out, "Rows extracted: {}", self.total_rows);
        let _ = writeln!(
            out,
            "Model calls: {} ({} input / {} output tokens), cache hits: {}",
            self.model_calls, self.input_tokens, self.output_tokens, self.cache_hits
        );
        let _ = writeln!(out, "Estimated cost: ${:.2}", self.cost_usd);
        let _ = writeln!(out, "Rate-limit delays: {}", self.rate_limit_delays);
        for (stage, counts) in &self.stages {
            let _ = writeln!(
                out,
                "  {}: {} validated, {} after fallback, {} partial, {} failed, {} exhausted",
                stage, counts.validated, counts.escalated, counts.partial, counts.failed, counts.exhausted
            );
        }
        let counts = &self.row_counts;
        if counts.checked > 0 {
            let _ = writeln!(
                out,
                "Outcome rows vs triage estimate: {}/{} matched, {} short, {} none, {} bonus",
                counts.matched, counts.checked, counts.shortfall, counts.none_found, counts.bonus
            );
            if let Some(rate) = counts.extraction_rate() {
                let _ = writeln!(
                    out,
                    "  expected {}, extracted {} ({:.1}%)",
                    counts.expected_total, counts.actual_total, rate
                );
            }
        }
        let _ = writeln!(out, "Elapsed: {:.1}s", self.elapsed_secs);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub file: String,
    pub study_id: u32,
    pub status: StudyStatus,
    pub message: String,
    pub rows: usize,
    /// Present once the results stage has run.
    #[serde(default)]
    pub row_check: Option<RowCountCheck>,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use StudyStatus::*;

        assert!(Pending.can_transition_to(Screening));
        assert!(Screening.can_transition_to(EmptyResult));
        assert!(Screening.can_transition_to(Extracting));
        assert!(Merging.can_transition_to(Success));
        assert!(Extracting.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Success));
        assert!(!Success.can_transition_to(Failed));
        assert!(!EmptyResult.can_transition_to(Extracting));
    }

    #[test]
    fn test_outcomes_counted() {
        let mut stats = RunStats::default();
        stats.record_outcome(StudyStatus::Success, 3);
        stats.record_outcome(StudyStatus::EmptyResult, 1);
        stats.record_outcome(StudyStatus::Failed, 1);
        stats.record_outcome(StudyStatus::Skipped, 0);

        assert_eq!(stats.total_files, 4);
        assert_eq!(stats.total_rows, 5);
        assert_eq!(stats.success_rate(), 25.0);
        assert!(stats.render_summary().contains("failed: 1, skipped: 1"));
    }

    #[test]
    fn test_stage_counts() {
        let mut stats = RunStats::default();
        let mut output = StageOutput::empty(StageKind::Results);
        output.status = StageStatus::Escalated;
        stats.record_stage(&output);

        assert_eq!(stats.stages[&StageKind::Results].escalated, 1);
    }

    #[test]
    fn test_row_count_verdicts() {
        assert_eq!(RowCountCheck::new(3, 3).verdict, RowCountVerdict::Match);
        assert_eq!(RowCountCheck::new(0, 0).verdict, RowCountVerdict::Match);
        assert_eq!(RowCountCheck::new(4, 2).verdict, RowCountVerdict::Shortfall);
        assert_eq!(RowCountCheck::new(4, 0).verdict, RowCountVerdict::NoneFound);
        assert_eq!(RowCountCheck::new(1, 5).verdict, RowCountVerdict::Bonus);
    }

    #[test]
    fn test_row_counts_aggregate_into_summary() {
        let mut stats = RunStats::default();
        stats.row_counts.record(&RowCountCheck::new(3, 3));
        stats.row_counts.record(&RowCountCheck::new(5, 0));

        assert_eq!(stats.row_counts.checked, 2);
        assert_eq!(stats.row_counts.none_found, 1);
        assert_eq!(stats.row_counts.extraction_rate(), Some(37.5));
        let summary = stats.render_summary();
        assert!(summary.contains("1/2 matched"));
        assert!(summary.contains("expected 8, extracted 3 (37.5%)"));
        assert!(!RunStats::default().render_summary().contains("triage estimate"));
    }
}

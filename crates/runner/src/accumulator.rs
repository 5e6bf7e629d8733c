use anyhow::anyhow;
use chrono::{DateTime, Utc};
use extract::{
    BudgetExhausted, Dataset, ExtractedRow, ExtractionConfig, ExtractionPlan, ModelClient,
    ResultMerger, RetryingApiClient, StageError, StageExtractor, StageKind, StageOutput,
    StageRows, StageStatus, TriageExtractor, TriageOutcome,
};
use ingest::{DocumentChunker, DocumentEntry, DocumentLoader, SourceDocument};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CachedStudy, StageCache};
use crate::config::{AppConfig, OperationMode, RunConfig};
use crate::diagnostics::DiagnosticsWriter;
use crate::metrics::{ProcessingLogEntry, RowCountCheck, RowCountVerdict, RunStats, StudyStatus};

/// Everything a run produced, complete or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: OperationMode,
    pub started_at: DateTime<Utc>,
    pub dataset: Dataset,
    pub stats: RunStats,
    pub log: Vec<ProcessingLogEntry>,
}

impl RunReport {
    fn new(mode: OperationMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            dataset: Dataset::new(),
            stats: RunStats::default(),
            log: Vec::new(),
        }
    }

    fn record(&mut self, study: &Study, outcome: StudyOutcome, cost_usd: f64) {
        info!(
            study_id = study.id,
            file = %study.file,
            status = ?study.status,
            rows = outcome.rows.len(),
            cost_usd,
            "Document classified"
        );

        self.stats.record_outcome(study.status, outcome.rows.len());
        for stage in &outcome.stages {
            self.stats.record_stage(stage);
        }
        if study.status == StudyStatus::Success && outcome.without_outcome_rows {
            self.stats.studies_without_rows += 1;
        }
        if outcome.stages.iter().any(|s| s.recovered) {
            self.stats.recovered_studies += 1;
        }
        if let Some(check) = &outcome.row_check {
            self.stats.row_counts.record(check);
        }

        self.log.push(ProcessingLogEntry {
            file: study.file.clone(),
            study_id: study.id,
            status: study.status,
            message: outcome.message,
            rows: outcome.rows.len(),
            row_check: outcome.row_check,
            cost_usd,
            timestamp: Utc::now(),
        });
        self.dataset.extend_study(outcome.rows);
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    /// No further model calls are possible today; `partial` holds what was collected.
    #[error("run aborted after {} documents: {source}", .partial.stats.total_files)]
    DailyBudgetExhausted {
        partial: Box<RunReport>,
        source: BudgetExhausted,
    },
}

/// One document's progress through the pipeline.
#[derive(Debug)]
struct Study {
    id: u32,
    file: String,
    status: StudyStatus,
}

impl Study {
    fn new(id: u32, file: &str) -> Self {
        Self {
            id,
            file: file.to_string(),
            status: StudyStatus::Pending,
        }
    }

    fn advance(&mut self, next: StudyStatus) {
        if !self.status.can_transition_to(next) {
            warn!(study_id = self.id, from = ?self.status, to = ?next, "Unexpected study transition");
        }
        debug!(study_id = self.id, from = ?self.status, to = ?next, "Study transition");
        self.status = next;
    }
}

struct StudyOutcome {
    rows: Vec<ExtractedRow>,
    message: String,
    stages: Vec<StageOutput>,
    without_outcome_rows: bool,
    row_check: Option<RowCountCheck>,
}

impl StudyOutcome {
    fn new(rows: Vec<ExtractedRow>, message: impl Into<String>) -> Self {
        Self {
            rows,
            message: message.into(),
            stages: Vec::new(),
            without_outcome_rows: false,
            row_check: None,
        }
    }
}

/// Runs every document through triage, the three extraction stages and the
/// merger, assigning study ids in processing order.
pub struct StudyAccumulator {
    mode: OperationMode,
    extraction: Arc<ExtractionConfig>,
    run: RunConfig,
    client: RetryingApiClient,
    triage: TriageExtractor,
    extractors: Vec<StageExtractor>,
    merger: ResultMerger,
    cache: Option<StageCache>,
    diagnostics: DiagnosticsWriter,
    next_study_id: u32,
}

impl StudyAccumulator {
    pub fn new(config: &AppConfig, client: Arc<dyn ModelClient>) -> Self {
        let extraction = Arc::new(config.extraction.clone());
        let extractors = vec![
            StageExtractor::metadata(extraction.clone()),
            StageExtractor::structure(extraction.clone()),
            StageExtractor::results(extraction.clone()),
        ];

        Self {
            mode: config.mode,
            client: RetryingApiClient::new(client, &extraction),
            triage: TriageExtractor::new(extraction.clone()),
            extractors,
            merger: ResultMerger::new(extraction.merge.clone()),
            cache: config.run.use_cache.then(|| StageCache::new(&config.run.cache_dir)),
            diagnostics: DiagnosticsWriter::new(&config.run.diagnostics_dir),
            run: config.run.clone(),
            extraction,
            next_study_id: 1,
        }
    }

    pub fn client(&self) -> &RetryingApiClient {
        &self.client
    }

    /// Process `entries` in order. Per-document failures are classified and the
    /// run continues; only the daily token budget ends it early.
    pub async fn process_all(
        &mut self,
        entries: &[DocumentEntry],
        loader: &dyn DocumentLoader,
    ) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let mut report = RunReport::new(self.mode);
        let mut pace_next = false;

        info!(documents = entries.len(), mode = self.mode.name(), "Starting run");

        for entry in entries {
            let mut study = Study::new(self.next_study_id, &entry.name);
            self.next_study_id += 1;
            let cost_before = self.client.costs().total_cost();

            let outcome = if entry.size_bytes > self.run.max_file_size_bytes {
                warn!(
                    file = %entry.name,
                    size_bytes = entry.size_bytes,
                    limit = self.run.max_file_size_bytes,
                    "Skipping oversize document"
                );
                study.advance(StudyStatus::Skipped);
                let message = format!(
                    "file size {} bytes exceeds limit of {} bytes",
                    entry.size_bytes, self.run.max_file_size_bytes
                );
                StudyOutcome::new(self.placeholder(study.id), message)
            } else {
                if pace_next {
                    sleep(Duration::from_millis(self.run.document_pacing_ms)).await;
                }
                pace_next = true;

                match self.extract_study(&mut study, entry, loader).await {
                    Ok(outcome) => outcome,
                    Err(StageError::DailyBudget(e)) => {
                        error!(file = %entry.name, error = %e, "Daily token budget exhausted, aborting run");
                        study.advance(StudyStatus::Failed);
                        let outcome = StudyOutcome::new(self.placeholder(study.id), e.to_string());
                        let cost = self.client.costs().total_cost() - cost_before;
                        report.record(&study, outcome, cost);
                        self.finalize(&mut report, started);
                        return Err(RunError::DailyBudgetExhausted {
                            partial: Box::new(report),
                            source: e,
                        });
                    }
                    Err(StageError::Document(e)) => {
                        let message = format!("{:#}", e);
                        warn!(file = %entry.name, error = %message, "Document failed");
                        study.advance(StudyStatus::Failed);
                        self.diagnostics
                            .write_error(study.id, &entry.stem(), &entry.name, None, &message);
                        StudyOutcome::new(self.placeholder(study.id), message)
                    }
                }
            };

            let cost = self.client.costs().total_cost() - cost_before;
            report.record(&study, outcome, cost);
        }

        self.finalize(&mut report, started);
        info!(
            documents = report.stats.total_files,
            rows = report.stats.total_rows,
            cost_usd = report.stats.cost_usd,
            "Run complete"
        );
        Ok(report)
    }

    async fn extract_study(
        &mut self,
        study: &mut Study,
        entry: &DocumentEntry,
        loader: &dyn DocumentLoader,
    ) -> Result<StudyOutcome, StageError> {
        study.advance(StudyStatus::Screening);
        let fingerprint = entry.fingerprint();

        let cached = match self.cache.as_mut() {
            Some(cache) => cache.load(&fingerprint, self.mode),
            None => None,
        };

        let (triage, stages) = match cached {
            Some(cached) => {
                info!(file = %entry.name, "Using cached stage outputs");
                (cached.triage, cached.stages)
            }
            None => {
                let document = loader.load(entry).await?;
                info!(
                    file = %entry.name,
                    pages = document.page_count(),
                    size_bytes = document.size_bytes(),
                    "Document loaded"
                );
                if document.page_count() == 0 {
                    return Err(anyhow!("{} has no pages", entry.name).into());
                }
                let (triage, stages) = self.run_stages(&document).await?;
                self.store(&fingerprint, entry, &triage, &stages);
                (triage, stages)
            }
        };

        Ok(self.classify(study, entry, triage, stages))
    }

    /// Triage, then metadata, structure and results; stops at the first
    /// stage that ran out of retries.
    async fn run_stages(
        &mut self,
        document: &SourceDocument,
    ) -> Result<(TriageOutcome, Vec<StageOutput>), StageError> {
        let chunks = DocumentChunker::new(self.extraction.chunking.clone()).chunk(document.page_count());
        let triage = self.triage.screen(&mut self.client, document, &chunks).await?;
        if triage.exhausted || triage.found_nothing() {
            return Ok((triage, Vec::new()));
        }

        let plan = ExtractionPlan::new(document.page_count(), &triage.result, &self.extraction);
        info!(
            document = document.name(),
            chunks = plan.chunks.len(),
            scopes = plan.targeted.len(),
            scoped_by_triage = plan.scoped_by_triage,
            "Extraction planned"
        );

        let mut stages = Vec::with_capacity(self.extractors.len());
        for extractor in &self.extractors {
            let scopes = match extractor.kind() {
                StageKind::Metadata => plan.metadata.as_slice(),
                _ => plan.targeted.as_slice(),
            };
            let output = extractor
                .extract(&mut self.client, document, scopes, &triage.result)
                .await?;
            let exhausted = output.status == StageStatus::Exhausted;
            stages.push(output);
            if exhausted {
                break;
            }
        }
        Ok((triage, stages))
    }

    fn classify(
        &self,
        study: &mut Study,
        entry: &DocumentEntry,
        triage: TriageOutcome,
        stages: Vec<StageOutput>,
    ) -> StudyOutcome {
        let stem = entry.stem();

        if triage.exhausted {
            study.advance(StudyStatus::Failed);
            let message = "triage call retries exhausted";
            self.diagnostics.write_error(study.id, &stem, &entry.name, None, message);
            return StudyOutcome::new(self.placeholder(study.id), message);
        }
        if triage.found_nothing() {
            study.advance(StudyStatus::EmptyResult);
            self.diagnostics.write_debug(study.id, &stem, &entry.name, &triage, &stages);
            return StudyOutcome::new(
                vec![ExtractedRow::placeholder(study.id)],
                "no target data found",
            );
        }

        study.advance(StudyStatus::Extracting);
        if let Some(stage) = stages.iter().find(|s| s.status == StageStatus::Exhausted) {
            study.advance(StudyStatus::Failed);
            let message = format!("{} stage retries exhausted", stage.kind);
            self.diagnostics.write_error(study.id, &stem, &entry.name, Some(stage), &message);
            let mut outcome = StudyOutcome::new(self.placeholder(study.id), message);
            outcome.stages = stages;
            return outcome;
        }

        let row_check = stages
            .iter()
            .find(|s| s.kind == StageKind::Results)
            .map(|results| reconcile(study.id, &triage, results));

        if stages.iter().all(|s| s.rows.is_empty()) {
            study.advance(StudyStatus::Failed);
            let message = "no stage produced rows";
            let results = stages.iter().find(|s| s.kind == StageKind::Results);
            self.diagnostics.write_error(study.id, &stem, &entry.name, results, message);
            let mut outcome = StudyOutcome::new(self.placeholder(study.id), message);
            outcome.stages = stages;
            outcome.row_check = row_check;
            return outcome;
        }

        study.advance(StudyStatus::Merging);
        let merged = self.merger.merge(
            study.id,
            StageRows {
                triage: Some(&triage.result),
                metadata: rows_of(&stages, StageKind::Metadata),
                structure: rows_of(&stages, StageKind::Structure),
                results: rows_of(&stages, StageKind::Results),
            },
        );
        study.advance(StudyStatus::Success);
        self.diagnostics.write_debug(study.id, &stem, &entry.name, &triage, &stages);

        let without_outcome_rows = rows_of(&stages, StageKind::Results).is_empty();
        let mut message = format!("{} rows", merged.rows.len());
        if without_outcome_rows {
            message.push_str(", no outcome rows extracted");
        }
        if stages.iter().any(|s| s.recovered) {
            message.push_str(", outcomes recovered from text");
        }
        if merged.renumbered {
            message.push_str(", estimates renumbered");
        }
        if !merged.warnings.is_empty() {
            message.push_str(&format!(", {} plausibility warnings", merged.warnings.len()));
        }

        StudyOutcome {
            rows: merged.rows,
            message,
            stages,
            without_outcome_rows,
            row_check,
        }
    }

    /// Only complete pipelines are cached. Exhausted stages, unparsed triage
    /// chunks and stages that all came back empty are retried next run.
    fn store(&self, fingerprint: &str, entry: &DocumentEntry, triage: &TriageOutcome, stages: &[StageOutput]) {
        let Some(cache) = &self.cache else {
            return;
        };
        let nothing_extracted = !stages.is_empty() && stages.iter().all(|s| s.rows.is_empty());
        if triage.exhausted
            || triage.is_incomplete()
            || nothing_extracted
            || stages.iter().any(|s| s.status == StageStatus::Exhausted)
        {
            debug!(file = %entry.name, "Stage outputs not cached");
            return;
        }

        let cached = CachedStudy {
            document: entry.name.clone(),
            mode: self.mode,
            triage: triage.clone(),
            stages: stages.to_vec(),
            created_at: Utc::now(),
        };
        if let Err(e) = cache.store(fingerprint, &cached) {
            warn!(file = %entry.name, error = %e, "Failed to write stage cache");
        }
    }

    fn placeholder(&self, study_id: u32) -> Vec<ExtractedRow> {
        if self.run.placeholder_rows {
            vec![ExtractedRow::placeholder(study_id)]
        } else {
            Vec::new()
        }
    }

    fn finalize(&self, report: &mut RunReport, started: Instant) {
        let costs = self.client.costs();
        let stats = &mut report.stats;
        stats.model_calls = costs.total_calls();
        stats.input_tokens = costs.total_input_tokens();
        stats.output_tokens = costs.total_output_tokens();
        stats.cost_usd = costs.total_cost();
        stats.rate_limit_delays = self.client.rate_limit_delays();
        stats.cache_hits = self.cache.as_ref().map_or(0, StageCache::hits);
        stats.elapsed_secs = started.elapsed().as_secs_f64();
    }
}

/// Compare triage's outcome estimate with what the results stage returned.
fn reconcile(study_id: u32, triage: &TriageOutcome, results: &StageOutput) -> RowCountCheck {
    let check = RowCountCheck::new(triage.result.estimated_row_count, results.rows.len());
    match check.verdict {
        RowCountVerdict::Match => info!(
            study_id,
            rows = check.actual,
            "Outcome rows match triage estimate"
        ),
        RowCountVerdict::Bonus => info!(
            study_id,
            expected = check.expected,
            actual = check.actual,
            "More outcome rows than triage estimated"
        ),
        RowCountVerdict::Shortfall => warn!(
            study_id,
            expected = check.expected,
            actual = check.actual,
            "Fewer outcome rows than triage estimated"
        ),
        RowCountVerdict::NoneFound => error!(
            study_id,
            expected = check.expected,
            "Triage estimated outcomes but none were extracted"
        ),
    }
    check
}

fn rows_of(stages: &[StageOutput], kind: StageKind) -> &[ExtractedRow] {
    stages
        .iter()
        .find(|s| s.kind == kind)
        .map(|s| s.rows.as_slice())
        .unwrap_or_default()
}

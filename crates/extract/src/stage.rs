use anyhow::Context;
use ingest::{Chunk, DocumentChunker, ExtractionScope, SourceDocument};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ExtractionConfig, ModelTier, StageSettings, ValidationConfig};
use crate::error::{CallError, StageError};
use crate::llm::ModelRequest;
use crate::parser::ResponseParser;
use crate::prompt::{self, TemplateVariant};
use crate::recovery::recover_outcomes;
use crate::retry::RetryingApiClient;
use crate::schema::{Column, ExtractedRow, ValueKind};
use crate::triage::TriageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Triage,
    Metadata,
    Structure,
    Results,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Triage => "triage",
            StageKind::Metadata => "metadata",
            StageKind::Structure => "structure",
            StageKind::Results => "results",
        }
    }

    pub fn owns(self, column: Column) -> bool {
        match self {
            StageKind::Triage => false,
            StageKind::Metadata => column.owned_by_metadata(),
            StageKind::Structure => column.owned_by_structure(),
            StageKind::Results => column.owned_by_results() && column != Column::IdEstimate,
        }
    }

    fn settings(self, config: &ExtractionConfig) -> &StageSettings {
        match self {
            StageKind::Triage => &config.stages.triage,
            StageKind::Metadata => &config.stages.metadata,
            StageKind::Structure => &config.stages.structure,
            StageKind::Results => &config.stages.results,
        }
    }

    /// Whether `rows` satisfy this stage's minimum content requirements.
    pub fn validate(self, rows: &[ExtractedRow], config: &ValidationConfig) -> bool {
        let Some(first) = rows.first() else {
            return false;
        };

        match self {
            StageKind::Triage => true,
            StageKind::Metadata => {
                first.get(Column::Author).is_present() && first.get(Column::Year).is_present()
            }
            StageKind::Structure => {
                let has_indicator = first.iter().any(|(column, cell)| {
                    column.owned_by_structure() && column.kind() == ValueKind::Binary && cell.is_present()
                });
                has_indicator && first.populated_count(|c| self.owns(c)) >= config.min_structure_fields
            }
            StageKind::Results => rows.iter().all(|row| {
                has_outcome(row) && row.populated_count(|c| self.owns(c)) >= config.min_results_fields
            }),
        }
    }

    /// Populated owned cells across all rows; ranks partial outputs.
    pub fn score(self, rows: &[ExtractedRow]) -> usize {
        rows.iter().map(|row| row.populated_count(|c| self.owns(c))).sum()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn has_outcome(row: &ExtractedRow) -> bool {
    row.get(Column::ResultsInflation).is_present()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// First attempt passed validation.
    Validated,
    /// A later attempt in the chain passed validation.
    Escalated,
    /// Nothing passed validation; the best partial output was kept.
    Partial,
    /// No usable output.
    Failed,
    /// A call gave up after its retry ceiling.
    Exhausted,
}

impl StageStatus {
    pub fn is_validated(self) -> bool {
        matches!(self, StageStatus::Validated | StageStatus::Escalated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub kind: StageKind,
    pub status: StageStatus,
    pub rows: Vec<ExtractedRow>,
    pub attempts: u32,
    pub model: Option<String>,
    /// Raw responses no parse strategy recognised.
    pub unstructured: Vec<String>,
    pub errors: Vec<String>,
    /// Rows came from the text pattern scan, not a model response.
    #[serde(default)]
    pub recovered: bool,
}

impl StageOutput {
    pub fn empty(kind: StageKind) -> Self {
        Self {
            kind,
            status: StageStatus::Failed,
            rows: Vec::new(),
            attempts: 0,
            model: None,
            unstructured: Vec::new(),
            errors: Vec::new(),
            recovered: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Attempt {
    tier: ModelTier,
    variant: TemplateVariant,
    only_if_no_rows: bool,
}

/// Ordered attempts for a stage; the first validated output ends the chain.
fn attempt_chain(kind: StageKind, config: &ExtractionConfig) -> Vec<Attempt> {
    let settings = kind.settings(config);
    let mut chain = vec![Attempt {
        tier: settings.tier,
        variant: TemplateVariant::Standard,
        only_if_no_rows: false,
    }];

    if settings.fallback_to_capable && settings.tier == ModelTier::Cheap {
        chain.push(Attempt {
            tier: ModelTier::Capable,
            variant: TemplateVariant::Standard,
            only_if_no_rows: false,
        });
    }
    if kind == StageKind::Results && config.simplified_results_retry {
        chain.push(Attempt {
            tier: ModelTier::Capable,
            variant: TemplateVariant::Simplified,
            only_if_no_rows: true,
        });
    }
    chain
}

/// Which pages each stage sees for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionPlan {
    pub chunks: Vec<Chunk>,
    pub metadata: Option<ExtractionScope>,
    pub targeted: Vec<ExtractionScope>,
    /// Whether triage narrowed the targeted stages.
    pub scoped_by_triage: bool,
}

impl ExtractionPlan {
    pub fn new(page_count: u32, triage: &TriageResult, config: &ExtractionConfig) -> Self {
        let chunker = DocumentChunker::new(config.chunking.clone());
        let chunks = chunker.chunk(page_count);
        let metadata = chunks.first().map(ExtractionScope::from);

        let scoped_by_triage = triage.scopes_extraction(config.triage.min_confidence);
        let targeted = if scoped_by_triage {
            chunker.batch_pages(&triage.relevant_positions)
        } else {
            chunks.iter().map(ExtractionScope::from).collect()
        };

        Self {
            chunks,
            metadata,
            targeted,
            scoped_by_triage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageOutcome {
    pub result: TriageResult,
    pub chunks_screened: usize,
    pub chunks_parsed: usize,
    pub exhausted: bool,
}

impl TriageOutcome {
    /// Every screened chunk answered and none reported target data.
    pub fn found_nothing(&self) -> bool {
        self.chunks_parsed > 0 && self.chunks_parsed == self.chunks_screened && !self.result.has_target_data
    }

    /// Some chunk answered with text that was not a verdict.
    pub fn is_incomplete(&self) -> bool {
        self.chunks_parsed < self.chunks_screened
    }
}

/// Screens every chunk with the cheap model and aggregates the verdicts.
pub struct TriageExtractor {
    config: Arc<ExtractionConfig>,
}

impl TriageExtractor {
    pub fn new(config: Arc<ExtractionConfig>) -> Self {
        Self { config }
    }

    pub async fn screen(
        &self,
        client: &mut RetryingApiClient,
        document: &SourceDocument,
        chunks: &[Chunk],
    ) -> Result<TriageOutcome, StageError> {
        let settings = &self.config.stages.triage;
        let model = self.config.models.model_for(settings.tier).to_string();
        let mut outcome = TriageOutcome::default();
        let mut per_chunk = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let blob = document
                .extract_page_range(chunk.start, chunk.end)
                .with_context(|| format!("failed to extract pages {}-{}", chunk.start, chunk.end))?;
            let request = ModelRequest {
                model: model.clone(),
                label: format!("{}:{}", StageKind::Triage, chunk.label),
                instruction: prompt::build_triage_prompt(chunk.start, chunk.end),
                document: Some(blob),
                max_output_tokens: settings.max_output_tokens,
                temperature: settings.temperature,
                estimated_input_tokens: client.limiter().estimate_cost(chunk.page_count()),
            };

            outcome.chunks_screened += 1;
            match client.call(&request).await {
                Ok(response) => match TriageResult::from_response(&response.text, chunk) {
                    Some(result) => {
                        debug!(
                            chunk = %chunk.label,
                            has_target_data = result.has_target_data,
                            positions = result.relevant_positions.len(),
                            confidence = result.confidence,
                            "Chunk screened"
                        );
                        per_chunk.push(result);
                    }
                    None => warn!(chunk = %chunk.label, "Triage response was not valid JSON"),
                },
                Err(CallError::DailyBudget(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(chunk = %chunk.label, error = %e, "Triage call failed");
                    outcome.exhausted = true;
                    break;
                }
            }
        }

        outcome.chunks_parsed = per_chunk.len();
        outcome.result = TriageResult::aggregate(&per_chunk, self.config.triage.basic_info_policy);
        info!(
            document = document.name(),
            chunks = chunks.len(),
            parsed = outcome.chunks_parsed,
            has_target_data = outcome.result.has_target_data,
            positions = outcome.result.relevant_positions.len(),
            confidence = outcome.result.confidence,
            estimated_rows = outcome.result.estimated_row_count,
            "Triage complete"
        );
        Ok(outcome)
    }
}

type PromptBuilder = fn(&TriageResult, TemplateVariant) -> String;

/// Runs one deep-extraction stage over its scopes.
pub struct StageExtractor {
    kind: StageKind,
    prompt: PromptBuilder,
    config: Arc<ExtractionConfig>,
    parser: ResponseParser,
}

impl StageExtractor {
    pub fn metadata(config: Arc<ExtractionConfig>) -> Self {
        Self::with_prompt(StageKind::Metadata, |context, _| prompt::build_metadata_prompt(context), config)
    }

    pub fn structure(config: Arc<ExtractionConfig>) -> Self {
        Self::with_prompt(StageKind::Structure, |context, _| prompt::build_structure_prompt(context), config)
    }

    pub fn results(config: Arc<ExtractionConfig>) -> Self {
        Self::with_prompt(StageKind::Results, prompt::build_results_prompt, config)
    }

    fn with_prompt(kind: StageKind, prompt: PromptBuilder, config: Arc<ExtractionConfig>) -> Self {
        Self {
            kind,
            prompt,
            config,
            parser: ResponseParser::new(),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub async fn extract(
        &self,
        client: &mut RetryingApiClient,
        document: &SourceDocument,
        scopes: &[ExtractionScope],
        context: &TriageResult,
    ) -> Result<StageOutput, StageError> {
        let mut per_scope = Vec::with_capacity(scopes.len());

        for scope in scopes {
            let output = self.extract_scope(client, document, scope, context).await?;
            let stop = self.kind != StageKind::Results
                && (output.status.is_validated() || output.status == StageStatus::Exhausted);
            per_scope.push(output);
            if stop {
                break;
            }
        }

        let mut combined = match self.kind {
            StageKind::Results => self.concatenate(per_scope),
            _ => self.pick_best(per_scope),
        };
        if self.kind == StageKind::Results
            && combined.rows.is_empty()
            && combined.status != StageStatus::Exhausted
            && self.config.recovery.enabled
        {
            self.recover_from_text(document, &mut combined);
        }

        info!(
            stage = %self.kind,
            status = ?combined.status,
            rows = combined.rows.len(),
            attempts = combined.attempts,
            "Stage complete"
        );
        Ok(combined)
    }

    async fn extract_scope(
        &self,
        client: &mut RetryingApiClient,
        document: &SourceDocument,
        scope: &ExtractionScope,
        context: &TriageResult,
    ) -> Result<StageOutput, StageError> {
        let blob = document
            .extract_pages(&scope.pages)
            .with_context(|| format!("failed to extract {} for {} stage", scope.label, self.kind))?;
        let estimated_input_tokens = client.limiter().estimate_cost(scope.page_count());
        let settings = self.kind.settings(&self.config);
        let validation = &self.config.validation;

        let mut output = StageOutput::empty(self.kind);
        let mut best: Option<(usize, Vec<ExtractedRow>, String)> = None;
        let mut any_rows = false;

        for (index, attempt) in attempt_chain(self.kind, &self.config).into_iter().enumerate() {
            if attempt.only_if_no_rows && any_rows {
                continue;
            }
            if index > 0 {
                info!(
                    stage = %self.kind,
                    scope = %scope.label,
                    tier = ?attempt.tier,
                    variant = ?attempt.variant,
                    "Falling back to next attempt"
                );
            }

            let model = self.config.models.model_for(attempt.tier).to_string();
            let request = ModelRequest {
                model: model.clone(),
                label: format!("{}:{}", self.kind, scope.label),
                instruction: self.instruction(context, attempt.variant),
                document: Some(blob.clone()),
                max_output_tokens: settings.max_output_tokens,
                temperature: settings.temperature,
                estimated_input_tokens,
            };

            output.attempts += 1;
            let response = match client.call(&request).await {
                Ok(response) => response,
                Err(CallError::DailyBudget(e)) => return Err(e.into()),
                Err(e) => {
                    output.errors.push(e.to_string());
                    output.status = StageStatus::Exhausted;
                    break;
                }
            };

            let parsed = self.parser.parse(&response.text);
            if parsed.is_unstructured() {
                output.unstructured.push(response.text.clone());
            }
            let mut rows = parsed.into_rows();
            if self.kind == StageKind::Results {
                let before = rows.len();
                rows.retain(has_outcome);
                if rows.len() < before {
                    debug!(dropped = before - rows.len(), "Dropped result rows without an outcome value");
                }
            }
            any_rows |= !rows.is_empty();

            if self.kind.validate(&rows, validation) {
                output.status = if index == 0 {
                    StageStatus::Validated
                } else {
                    StageStatus::Escalated
                };
                output.rows = rows;
                output.model = Some(model);
                return Ok(output);
            }

            warn!(
                stage = %self.kind,
                scope = %scope.label,
                model = %model,
                rows = rows.len(),
                "Stage output failed validation"
            );
            let score = self.kind.score(&rows);
            if score > 0 && best.as_ref().is_none_or(|(best_score, _, _)| score > *best_score) {
                best = Some((score, rows, model));
            }
        }

        if let Some((_, rows, model)) = best {
            if output.status != StageStatus::Exhausted {
                output.status = StageStatus::Partial;
            }
            output.rows = rows;
            output.model = Some(model);
        }
        Ok(output)
    }

    fn instruction(&self, context: &TriageResult, variant: TemplateVariant) -> String {
        (self.prompt)(context, variant)
    }

    /// Last strategy of the results chain: pattern-scan the document text.
    fn recover_from_text(&self, document: &SourceDocument, output: &mut StageOutput) {
        let text = match document.text() {
            Ok(text) => text,
            Err(e) => {
                warn!(document = document.name(), error = %e, "No text available for outcome recovery");
                return;
            }
        };

        let rows = recover_outcomes(&text, &self.config.recovery);
        if rows.is_empty() {
            return;
        }
        warn!(
            document = document.name(),
            rows = rows.len(),
            "No outcome rows from the model, recovered values from document text"
        );
        output.rows = rows;
        output.status = StageStatus::Partial;
        output.recovered = true;
    }

    /// First validated scope wins, else the highest-scoring partial (earliest on ties).
    fn pick_best(&self, outputs: Vec<StageOutput>) -> StageOutput {
        let mut combined = StageOutput::empty(self.kind);
        let attempts: u32 = outputs.iter().map(|o| o.attempts).sum();
        let exhausted = outputs.iter().any(|o| o.status == StageStatus::Exhausted);
        let mut unstructured = Vec::new();
        let mut errors = Vec::new();
        let mut chosen: Option<StageOutput> = None;

        for output in outputs {
            unstructured.extend(output.unstructured.iter().cloned());
            errors.extend(output.errors.iter().cloned());

            let better = match &chosen {
                None => true,
                Some(current) if current.status.is_validated() => false,
                Some(_) if output.status.is_validated() => true,
                Some(current) => self.kind.score(&output.rows) > self.kind.score(&current.rows),
            };
            if better {
                chosen = Some(output);
            }
        }

        if let Some(chosen) = chosen {
            combined = chosen;
        }
        if exhausted && !combined.status.is_validated() {
            combined.status = StageStatus::Exhausted;
        }
        combined.attempts = attempts;
        combined.unstructured = unstructured;
        combined.errors = errors;
        combined
    }

    /// Rows from every scope in page order.
    fn concatenate(&self, outputs: Vec<StageOutput>) -> StageOutput {
        let mut combined = StageOutput::empty(self.kind);
        if outputs.is_empty() {
            return combined;
        }

        let all_validated = outputs.iter().all(|o| o.status.is_validated());
        let any_escalated = outputs.iter().any(|o| o.status == StageStatus::Escalated);
        let exhausted = outputs.iter().any(|o| o.status == StageStatus::Exhausted);

        for output in outputs {
            combined.attempts += output.attempts;
            combined.rows.extend(output.rows);
            combined.unstructured.extend(output.unstructured);
            combined.errors.extend(output.errors);
            if output.model.is_some() {
                combined.model = output.model;
            }
        }

        combined.status = if exhausted {
            StageStatus::Exhausted
        } else if all_validated && any_escalated {
            StageStatus::Escalated
        } else if all_validated {
            StageStatus::Validated
        } else if !combined.rows.is_empty() {
            StageStatus::Partial
        } else {
            StageStatus::Failed
        };
        combined
    }
}

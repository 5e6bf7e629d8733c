use ingest::ChunkerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::merge::SharedFieldPrecedence;
use crate::triage::BasicInfoPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub models: ModelConfig,
    pub stages: StagesConfig,
    pub rate_limit: RateLimitConfig,
    pub chunking: ChunkerConfig,
    pub retry: RetryConfig,
    pub triage: TriageConfig,
    pub merge: MergeConfig,
    pub validation: ValidationConfig,
    pub recovery: RecoveryConfig,
    /// Extra results attempt with a reduced template when nothing parseable came back.
    pub simplified_results_retry: bool,
    /// USD per million tokens, keyed by model identifier.
    pub pricing: BTreeMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Cheap,
    Capable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub cheap: String,
    pub capable: String,
}

impl ModelConfig {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Cheap => &self.cheap,
            ModelTier::Capable => &self.capable,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cheap: "claude-3-5-sonnet-20241022".to_string(),
            capable: "claude-opus-4-20250514".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    pub tier: ModelTier,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Retry once on the capable model when the first attempt fails validation.
    pub fallback_to_capable: bool,
}

impl StageSettings {
    fn new(tier: ModelTier, max_output_tokens: u32, temperature: f32) -> Self {
        Self {
            tier,
            max_output_tokens,
            temperature,
            fallback_to_capable: tier == ModelTier::Cheap,
        }
    }
}

/// A partial stage table overlays that stage's own defaults, not a shared one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StagesOverrides")]
pub struct StagesConfig {
    pub triage: StageSettings,
    pub metadata: StageSettings,
    pub structure: StageSettings,
    pub results: StageSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StageOverrides {
    tier: Option<ModelTier>,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
    fallback_to_capable: Option<bool>,
}

impl StageOverrides {
    fn apply(self, base: StageSettings) -> StageSettings {
        StageSettings {
            tier: self.tier.unwrap_or(base.tier),
            max_output_tokens: self.max_output_tokens.unwrap_or(base.max_output_tokens),
            temperature: self.temperature.unwrap_or(base.temperature),
            fallback_to_capable: self.fallback_to_capable.unwrap_or(base.fallback_to_capable),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StagesOverrides {
    triage: StageOverrides,
    metadata: StageOverrides,
    structure: StageOverrides,
    results: StageOverrides,
}

impl From<StagesOverrides> for StagesConfig {
    fn from(overrides: StagesOverrides) -> Self {
        let defaults = StagesConfig::default();
        Self {
            triage: overrides.triage.apply(defaults.triage),
            metadata: overrides.metadata.apply(defaults.metadata),
            structure: overrides.structure.apply(defaults.structure),
            results: overrides.results.apply(defaults.results),
        }
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        let mut triage = StageSettings::new(ModelTier::Cheap, 1500, 0.0);
        triage.fallback_to_capable = false;

        Self {
            triage,
            metadata: StageSettings::new(ModelTier::Cheap, 4000, 0.0),
            structure: StageSettings::new(ModelTier::Cheap, 4000, 0.0),
            results: StageSettings::new(ModelTier::Capable, 8000, 0.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub tokens_per_day: u64,
    pub min_request_spacing_ms: u64,
    pub request_history: usize,
    pub token_history: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 50,
            tokens_per_minute: 40_000,
            tokens_per_day: 1_000_000,
            min_request_spacing_ms: 2000,
            request_history: 100,
            token_history: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 5000,
            multiplier: 2.0,
            max_backoff_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Triage at or below this confidence is not trusted to scope later stages.
    pub min_confidence: f64,
    pub basic_info_policy: BasicInfoPolicy,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.1,
            basic_info_policy: BasicInfoPolicy::FirstNonMissing,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub shared_field_precedence: SharedFieldPrecedence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Populated structure-owned cells required besides the binary indicator.
    pub min_structure_fields: usize,
    /// Populated results-owned cells required per row, outcome included.
    pub min_results_fields: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_structure_fields: 3,
            min_results_fields: 2,
        }
    }
}

/// Pattern scan of the document text when the results stage found no outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub scan_chars: usize,
    pub max_rows: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_chars: 20_000,
            max_rows: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    #[serde(default)]
    pub cache_write_per_mtok: f64,
    #[serde(default)]
    pub cache_read_per_mtok: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        let models = ModelConfig::default();
        let mut pricing = BTreeMap::new();
        pricing.insert(
            models.cheap.clone(),
            ModelPricing {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
                cache_write_per_mtok: 3.75,
                cache_read_per_mtok: 0.30,
            },
        );
        pricing.insert(
            models.capable.clone(),
            ModelPricing {
                input_per_mtok: 15.0,
                output_per_mtok: 75.0,
                cache_write_per_mtok: 18.75,
                cache_read_per_mtok: 1.50,
            },
        );

        Self {
            models,
            stages: StagesConfig::default(),
            rate_limit: RateLimitConfig::default(),
            chunking: ChunkerConfig::default(),
            retry: RetryConfig::default(),
            triage: TriageConfig::default(),
            merge: MergeConfig::default(),
            validation: ValidationConfig::default(),
            recovery: RecoveryConfig::default(),
            simplified_results_retry: true,
            pricing,
        }
    }
}

impl ExtractionConfig {
    /// Price of a model, falling back to the capable tier for unknown identifiers.
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.pricing
            .get(model)
            .or_else(|| self.pricing.get(&self.models.capable))
            .copied()
            .unwrap_or(ModelPricing {
                input_per_mtok: 15.0,
                output_per_mtok: 75.0,
                cache_write_per_mtok: 18.75,
                cache_read_per_mtok: 1.50,
            })
    }

    /// Cheap model everywhere, no escalation.
    pub fn economy(mut self) -> Self {
        for settings in self.stages.all_mut() {
            settings.tier = ModelTier::Cheap;
            settings.fallback_to_capable = false;
        }
        self.simplified_results_retry = false;
        self
    }

    /// Capable model everywhere.
    pub fn full(mut self) -> Self {
        for settings in self.stages.all_mut() {
            settings.tier = ModelTier::Capable;
            settings.fallback_to_capable = false;
        }
        self
    }
}

impl StagesConfig {
    fn all_mut(&mut self) -> [&mut StageSettings; 4] {
        [
            &mut self.triage,
            &mut self.metadata,
            &mut self.structure,
            &mut self.results,
        ]
    }
}

use anyhow::{Context, Result};
use extract::ExtractionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: OperationMode,
    pub extraction: ExtractionConfig,
    pub run: RunConfig,
    pub citations: CitationConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Cheap screening and study-level stages, capable model for results
    #[default]
    Smart,
    /// Cheap model everywhere, no escalation
    Economy,
    /// Capable model for every stage
    Full,
}

impl OperationMode {
    pub fn name(self) -> &'static str {
        match self {
            OperationMode::Smart => "smart",
            OperationMode::Economy => "economy",
            OperationMode::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Larger files are skipped without any model call.
    pub max_file_size_bytes: u64,
    pub document_pacing_ms: u64,
    pub use_cache: bool,
    pub cache_dir: PathBuf,
    pub diagnostics_dir: PathBuf,
    pub export_dir: PathBuf,
    /// Failed and skipped documents still contribute one all-"NA" row.
    pub placeholder_rows: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 32 * 1024 * 1024,
            document_pacing_ms: 3000,
            use_cache: true,
            cache_dir: PathBuf::from("cache"),
            diagnostics_dir: PathBuf::from("diagnostics"),
            export_dir: PathBuf::from("output"),
            placeholder_rows: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationConfig {
    pub enabled: bool,
    pub base_url: String,
    pub attempts: u32,
    pub retry_pause_ms: u64,
    pub lookup_pause_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for CitationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.elsevier.com/content/abstract/citation-count".to_string(),
            attempts: 3,
            retry_pause_ms: 2000,
            lookup_pause_ms: 1000,
            request_timeout_secs: 30,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::smart_mode()
    }
}

impl AppConfig {
    pub fn smart_mode() -> Self {
        Self {
            mode: OperationMode::Smart,
            extraction: ExtractionConfig::default(),
            run: RunConfig::default(),
            citations: CitationConfig::default(),
        }
    }

    pub fn economy_mode() -> Self {
        Self::smart_mode().with_mode(OperationMode::Economy)
    }

    pub fn full_mode() -> Self {
        Self::smart_mode().with_mode(OperationMode::Full)
    }

    /// Apply a mode preset to the stage model tiers.
    pub fn with_mode(mut self, mode: OperationMode) -> Self {
        self.mode = mode;
        self.extraction = match mode {
            OperationMode::Smart => self.extraction,
            OperationMode::Economy => self.extraction.economy(),
            OperationMode::Full => self.extraction.full(),
        };
        self
    }

    /// Defaults, overlaid by an optional TOML file, then the mode preset.
    pub fn load(path: Option<&Path>, mode: Option<OperationMode>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                toml::from_str::<AppConfig>(&text)
                    .with_context(|| format!("Failed to parse config file: {:?}", path))?
            }
            None => Self::default(),
        };

        let mode = mode.unwrap_or(config.mode);
        Ok(config.with_mode(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::{ModelTier, SharedFieldPrecedence};

    #[test]
    fn test_presets() {
        let smart = AppConfig::smart_mode();
        assert_eq!(smart.extraction.stages.triage.tier, ModelTier::Cheap);
        assert_eq!(smart.extraction.stages.results.tier, ModelTier::Capable);
        assert_eq!(smart.run.max_file_size_bytes, 33_554_432);

        let economy = AppConfig::economy_mode();
        assert_eq!(economy.extraction.stages.results.tier, ModelTier::Cheap);

        let full = AppConfig::full_mode();
        assert_eq!(full.extraction.stages.metadata.tier, ModelTier::Capable);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
mode = "economy"

[run]
document_pacing_ms = 0

[extraction.rate_limit]
tokens_per_minute = 80000

[extraction.merge]
shared_field_precedence = "structure_wins"
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(path.as_path()), None).unwrap();

        assert_eq!(config.mode, OperationMode::Economy);
        assert_eq!(config.run.document_pacing_ms, 0);
        assert_eq!(config.run.max_file_size_bytes, 33_554_432);
        assert_eq!(config.extraction.rate_limit.tokens_per_minute, 80_000);
        assert_eq!(config.extraction.rate_limit.requests_per_minute, 50);
        assert_eq!(
            config.extraction.merge.shared_field_precedence,
            SharedFieldPrecedence::StructureWins
        );
        assert_eq!(config.extraction.stages.results.tier, ModelTier::Cheap);
    }

    #[test]
    fn test_partial_stage_table_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[extraction.stages.results]
max_output_tokens = 6000
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(path.as_path()), None).unwrap();

        let results = &config.extraction.stages.results;
        assert_eq!(results.max_output_tokens, 6000);
        assert_eq!(results.tier, ModelTier::Capable);
        assert!(!results.fallback_to_capable);
        assert!(config.extraction.stages.metadata.fallback_to_capable);
    }

    #[test]
    fn test_cli_mode_overrides_file() {
        let config = AppConfig::load(None, Some(OperationMode::Full)).unwrap();

        assert_eq!(config.mode, OperationMode::Full);
        assert_eq!(config.extraction.stages.triage.tier, ModelTier::Capable);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load(Some(Path::new("/nonexistent/config.toml")), None).is_err());
    }
}

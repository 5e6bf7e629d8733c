pub mod config;
pub mod cost;
pub mod error;
pub mod llm;
pub mod merge;
pub mod parser;
pub mod prompt;
pub mod rate_limit;
pub mod recovery;
pub mod retry;
pub mod schema;
pub mod stage;
pub mod triage;

pub use config::{
    ExtractionConfig, MergeConfig, ModelConfig, ModelPricing, ModelTier, RateLimitConfig,
    RecoveryConfig, RetryConfig, StageSettings, StagesConfig, TriageConfig, ValidationConfig,
};
pub use cost::{CostTracker, ModelUsage};
pub use error::{ApiError, BudgetExhausted, CallError, StageError};
pub use llm::{AnthropicClient, ModelClient, ModelRequest, ModelResponse, TokenUsage};
pub use merge::{MergedStudy, ResultMerger, SharedFieldPrecedence, StageRows};
pub use parser::{ParseStrategy, ParsedResponse, ResponseParser};
pub use rate_limit::{Admission, DenialReason, RateLimiter, UsageRecord};
pub use recovery::recover_outcomes;
pub use retry::RetryingApiClient;
pub use schema::{COLUMN_COUNT, Cell, Column, Dataset, ExtractedRow, Missing, NA};
pub use stage::{
    ExtractionPlan, StageExtractor, StageKind, StageOutput, StageStatus, TriageExtractor,
    TriageOutcome,
};
pub use triage::{BasicInfoPolicy, TriageResult};

use thiserror::Error;

/// Failure surfaced by the model boundary for a single call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("request failed with status {status}: {message}")]
    Request { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ApiError::RateLimited(_))
    }
}

/// The daily token ceiling was reached. Not recoverable within a run.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("daily token budget exhausted: {used} of {budget} tokens used")]
pub struct BudgetExhausted {
    pub used: u64,
    pub budget: u64,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    DailyBudget(#[from] BudgetExhausted),

    #[error("{label}: gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        last: ApiError,
    },
}

/// Errors that stop a stage from producing any output at all.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    DailyBudget(#[from] BudgetExhausted),

    #[error(transparent)]
    Document(#[from] anyhow::Error),
}

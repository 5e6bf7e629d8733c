use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::config::{ExtractionConfig, ModelPricing, RetryConfig};
use crate::cost::CostTracker;
use crate::error::{ApiError, CallError};
use crate::llm::{ModelClient, ModelRequest, ModelResponse};
use crate::rate_limit::{RateLimiter, UsageRecord};

/// Single entry point for model calls: admission control, bounded retry and
/// usage accounting around a [`ModelClient`].
pub struct RetryingApiClient {
    client: Arc<dyn ModelClient>,
    limiter: RateLimiter,
    retry: RetryConfig,
    pricing: BTreeMap<String, ModelPricing>,
    default_pricing: ModelPricing,
    costs: CostTracker,
    rate_limit_retries: u64,
}

impl RetryingApiClient {
    pub fn new(client: Arc<dyn ModelClient>, config: &ExtractionConfig) -> Self {
        Self {
            client,
            limiter: RateLimiter::new(config.rate_limit.clone(), config.chunking.clone()),
            retry: config.retry.clone(),
            pricing: config.pricing.clone(),
            default_pricing: config.pricing_for(&config.models.capable),
            costs: CostTracker::new(),
            rate_limit_retries: 0,
        }
    }

    pub async fn call(&mut self, request: &ModelRequest) -> Result<ModelResponse, CallError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.limiter.await_capacity(request.estimated_input_tokens).await?;

            let started = Instant::now();
            match self.client.complete(request).await {
                Ok(response) => {
                    self.limiter.record(UsageRecord {
                        at: Instant::now(),
                        input_tokens: request.estimated_input_tokens,
                        output_tokens: response.usage.output_tokens,
                        label: request.label.clone(),
                    });
                    let pricing = self.pricing_for(&request.model);
                    let cost = self.costs.add(&request.model, &response.usage, pricing);

                    info!(
                        operation = %request.label,
                        model = %request.model,
                        attempt,
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        cost_usd = cost,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Model call succeeded"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        warn!(
                            operation = %request.label,
                            attempts = attempt,
                            error = %e,
                            "Model call failed after max attempts"
                        );
                        return Err(CallError::RetriesExhausted {
                            label: request.label.clone(),
                            attempts: attempt,
                            last: e,
                        });
                    }

                    let backoff = self.backoff(&e, attempt);
                    if e.is_rate_limit() {
                        self.rate_limit_retries += 1;
                    }
                    warn!(
                        operation = %request.label,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Model call failed, retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    /// Exponential for rate limits, linear otherwise; `attempt` is 1-based.
    pub fn backoff(&self, error: &ApiError, attempt: u32) -> Duration {
        let initial = self.retry.initial_backoff_ms as f64;
        let millis = if error.is_rate_limit() {
            initial * self.retry.multiplier.powi(attempt.saturating_sub(1) as i32)
        } else {
            initial * attempt as f64
        };
        Duration::from_millis(millis.min(self.retry.max_backoff_ms as f64) as u64)
    }

    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Waits imposed by admission control plus retries after rate-limit errors.
    pub fn rate_limit_delays(&self) -> u64 {
        self.limiter.wait_count() + self.rate_limit_retries
    }

    fn pricing_for(&self, model: &str) -> ModelPricing {
        self.pricing.get(model).copied().unwrap_or(self.default_pricing)
    }
}

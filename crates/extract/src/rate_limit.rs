use ingest::{ChunkerConfig, DocumentChunker};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{error, info};

use crate::config::RateLimitConfig;
use crate::error::BudgetExhausted;

const WINDOW: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);
const MIN_REQUEST_WAIT: Duration = Duration::from_secs(5);
const MIN_TOKEN_WAIT: Duration = Duration::from_secs(10);
const MAX_TOKEN_WAIT: Duration = Duration::from_secs(60);

/// One completed external call.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub at: Instant,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub label: String,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    DailyBudget,
    RequestRate,
    TokenRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied {
        reason: DenialReason,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Request and token accounting against per-minute and per-day ceilings.
///
/// Rolling histories are bounded; the oldest entries are evicted first.
pub struct RateLimiter {
    config: RateLimitConfig,
    chunker: DocumentChunker,
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
    daily_tokens: u64,
    day_started: Instant,
    last_request: Option<Instant>,
    waits: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, chunking: ChunkerConfig) -> Self {
        Self {
            config,
            chunker: DocumentChunker::new(chunking),
            requests: VecDeque::new(),
            tokens: VecDeque::new(),
            daily_tokens: 0,
            day_started: Instant::now(),
            last_request: None,
            waits: 0,
        }
    }

    /// Estimated request size for `pages` pages, capped at the per-request ceiling.
    pub fn estimate_cost(&self, pages: u32) -> u64 {
        let ceiling = self.chunker.config().max_tokens_per_request as u64;
        self.chunker.estimated_tokens(pages).min(ceiling)
    }

    pub fn may_proceed(&mut self, tokens: u64) -> Admission {
        let now = Instant::now();
        self.reset_daily_if_due(now);
        self.evaluate(tokens, now)
    }

    /// Wait until a request of `tokens` may be sent. Fails only when the daily
    /// budget would be exceeded.
    pub async fn await_capacity(&mut self, tokens: u64) -> Result<(), BudgetExhausted> {
        loop {
            match self.may_proceed(tokens) {
                Admission::Granted => break,
                Admission::Denied {
                    reason: DenialReason::DailyBudget,
                    ..
                } => {
                    error!(
                        used = self.daily_tokens,
                        requested = tokens,
                        budget = self.config.tokens_per_day,
                        "Daily token budget exhausted"
                    );
                    return Err(BudgetExhausted {
                        used: self.daily_tokens,
                        budget: self.config.tokens_per_day,
                    });
                }
                Admission::Denied { reason, retry_after } => {
                    self.waits += 1;
                    info!(
                        reason = ?reason,
                        wait_secs = retry_after.as_secs_f64(),
                        requests_last_minute = self.requests_last_minute(),
                        tokens_last_minute = self.tokens_last_minute(),
                        "Rate limit reached, waiting"
                    );
                    sleep(retry_after).await;
                }
            }
        }

        let spacing = Duration::from_millis(self.config.min_request_spacing_ms);
        if let Some(last) = self.last_request {
            let elapsed = Instant::now().saturating_duration_since(last);
            if elapsed < spacing {
                let wait = spacing - elapsed;
                info!(wait_secs = wait.as_secs_f64(), "Minimum request spacing");
                sleep(wait).await;
            }
        }
        self.last_request = Some(Instant::now());
        Ok(())
    }

    pub fn record(&mut self, usage: UsageRecord) {
        let total = usage.total_tokens();

        self.requests.push_back(usage.at);
        while self.requests.len() > self.request_capacity() {
            self.requests.pop_front();
        }
        self.tokens.push_back((usage.at, total));
        while self.tokens.len() > self.config.token_history.max(1) {
            self.tokens.pop_front();
        }
        self.daily_tokens += total;
        self.last_request = Some(self.last_request.map_or(usage.at, |last| last.max(usage.at)));

        info!(
            label = %usage.label,
            requests_last_minute = self.requests_last_minute(),
            requests_per_minute = self.config.requests_per_minute,
            tokens_last_minute = self.tokens_last_minute(),
            tokens_per_minute = self.config.tokens_per_minute,
            daily_tokens = self.daily_tokens,
            tokens_per_day = self.config.tokens_per_day,
            "Usage recorded"
        );
    }

    pub fn daily_tokens_used(&self) -> u64 {
        self.daily_tokens
    }

    /// Times a call had to wait for rate-limit capacity.
    pub fn wait_count(&self) -> u64 {
        self.waits
    }

    pub fn requests_last_minute(&self) -> usize {
        let now = Instant::now();
        self.requests
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < WINDOW)
            .count()
    }

    pub fn tokens_last_minute(&self) -> u64 {
        let now = Instant::now();
        self.tokens
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) < WINDOW)
            .map(|(_, tokens)| tokens)
            .sum()
    }

    fn reset_daily_if_due(&mut self, now: Instant) {
        if now.saturating_duration_since(self.day_started) >= DAY {
            info!(previous = self.daily_tokens, "Daily token counter reset");
            self.daily_tokens = 0;
            self.day_started = now;
        }
    }

    /// Never below the per-minute ceiling, or the request-rate check could not deny.
    fn request_capacity(&self) -> usize {
        self.config
            .request_history
            .max(self.config.requests_per_minute as usize)
            .max(1)
    }

    fn evaluate(&self, tokens: u64, now: Instant) -> Admission {
        if self.daily_tokens + tokens > self.config.tokens_per_day {
            return Admission::Denied {
                reason: DenialReason::DailyBudget,
                retry_after: Duration::ZERO,
            };
        }

        let in_window: Vec<Instant> = self
            .requests
            .iter()
            .copied()
            .filter(|at| now.saturating_duration_since(*at) < WINDOW)
            .collect();
        if in_window.len() >= self.config.requests_per_minute as usize {
            let oldest_age = in_window
                .iter()
                .map(|at| now.saturating_duration_since(*at))
                .max()
                .unwrap_or(Duration::ZERO);
            let until_exit = (WINDOW + Duration::from_secs(1)).saturating_sub(oldest_age);
            return Admission::Denied {
                reason: DenialReason::RequestRate,
                retry_after: until_exit.max(MIN_REQUEST_WAIT),
            };
        }

        let recent_tokens = self.tokens_last_minute_at(now);
        let projected = recent_tokens + tokens;
        // an empty window always admits, however large the request
        if projected > self.config.tokens_per_minute && recent_tokens > 0 {
            let excess = projected - self.config.tokens_per_minute;
            let wait = Duration::from_secs(excess / 1000).clamp(MIN_TOKEN_WAIT, MAX_TOKEN_WAIT);
            return Admission::Denied {
                reason: DenialReason::TokenRate,
                retry_after: wait,
            };
        }

        Admission::Granted
    }

    fn tokens_last_minute_at(&self, now: Instant) -> u64 {
        self.tokens
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) < WINDOW)
            .map(|(_, tokens)| tokens)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default(), ChunkerConfig::default())
    }

    fn usage(tokens: u64) -> UsageRecord {
        UsageRecord {
            at: Instant::now(),
            input_tokens: tokens,
            output_tokens: 0,
            label: "test".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_is_capped() {
        let limiter = limiter();

        assert_eq!(limiter.estimate_cost(2), 9000);
        assert_eq!(limiter.estimate_cost(200), 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_always_admitted() {
        let mut limiter = limiter();

        assert!(limiter.may_proceed(500_000).is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_denial_is_monotone() {
        let mut limiter = limiter();
        limiter.record(usage(30_000));

        let denied = limiter.may_proceed(20_000);
        assert!(matches!(
            denied,
            Admission::Denied { reason: DenialReason::TokenRate, retry_after } if retry_after == Duration::from_secs(10)
        ));
        assert!(limiter.may_proceed(5_000).is_granted());
        assert!(limiter.may_proceed(10_000).is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_rate_waits_for_oldest_to_exit() {
        let mut limiter = RateLimiter::new(
            RateLimitConfig {
                requests_per_minute: 2,
                ..RateLimitConfig::default()
            },
            ChunkerConfig::default(),
        );
        limiter.record(usage(10));
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.record(usage(10));

        match limiter.may_proceed(10) {
            Admission::Denied { reason, retry_after } => {
                assert_eq!(reason, DenialReason::RequestRate);
                assert_eq!(retry_after, Duration::from_secs(31));
            }
            Admission::Granted => panic!("third request inside the window must wait"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_budget_is_fatal() {
        let mut limiter = RateLimiter::new(
            RateLimitConfig {
                tokens_per_day: 10_000,
                ..RateLimitConfig::default()
            },
            ChunkerConfig::default(),
        );
        limiter.record(usage(9_000));

        let err = limiter.await_capacity(2_000).await.unwrap_err();
        assert_eq!(err, BudgetExhausted { used: 9_000, budget: 10_000 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_counter_resets_after_a_day() {
        let mut limiter = RateLimiter::new(
            RateLimitConfig {
                tokens_per_day: 10_000,
                ..RateLimitConfig::default()
            },
            ChunkerConfig::default(),
        );
        limiter.record(usage(9_000));
        tokio::time::advance(DAY).await;

        assert!(limiter.may_proceed(2_000).is_granted());
        assert_eq!(limiter.daily_tokens_used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_spacing_between_requests() {
        let mut limiter = limiter();
        limiter.record(usage(100));
        let start = Instant::now();

        limiter.await_capacity(100).await.unwrap();

        assert!(Instant::now() - start >= Duration::from_millis(2000));
        assert_eq!(limiter.wait_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_capacity_waits_out_token_window() {
        let mut limiter = limiter();
        limiter.record(usage(39_000));
        let start = Instant::now();

        limiter.await_capacity(5_000).await.unwrap();

        assert!(Instant::now() - start >= WINDOW);
        assert!(limiter.wait_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let mut limiter = RateLimiter::new(
            RateLimitConfig {
                request_history: 3,
                token_history: 3,
                requests_per_minute: 2,
                tokens_per_minute: u64::MAX / 2,
                ..RateLimitConfig::default()
            },
            ChunkerConfig::default(),
        );
        for _ in 0..10 {
            limiter.record(usage(1));
        }

        assert_eq!(limiter.requests_last_minute(), 3);
        assert_eq!(limiter.tokens_last_minute(), 3);
        assert_eq!(limiter.daily_tokens_used(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_ceiling_above_history_still_denies() {
        let mut limiter = RateLimiter::new(
            RateLimitConfig {
                request_history: 5,
                requests_per_minute: 8,
                tokens_per_minute: u64::MAX / 2,
                ..RateLimitConfig::default()
            },
            ChunkerConfig::default(),
        );
        for _ in 0..7 {
            limiter.record(usage(1));
        }
        assert!(limiter.may_proceed(1).is_granted());

        limiter.record(usage(1));
        assert_eq!(limiter.requests_last_minute(), 8);
        assert!(matches!(
            limiter.may_proceed(1),
            Admission::Denied { reason: DenialReason::RequestRate, .. }
        ));
    }
}

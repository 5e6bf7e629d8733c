use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::ModelPricing;
use crate::llm::TokenUsage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
}

/// Token and spend totals per model.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostTracker {
    by_model: BTreeMap<String, ModelUsage>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one call and return its price.
    pub fn add(&mut self, model: &str, usage: &TokenUsage, pricing: ModelPricing) -> f64 {
        let cost = price(usage, pricing);
        let entry = self.by_model.entry(model.to_string()).or_default();

        entry.calls += 1;
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.cache_write_tokens += usage.cache_write_tokens;
        entry.cache_read_tokens += usage.cache_read_tokens;
        entry.cost_usd += cost;
        cost
    }

    pub fn total_cost(&self) -> f64 {
        self.by_model.values().map(|u| u.cost_usd).sum()
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.by_model.values().map(|u| u.input_tokens).sum()
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.by_model.values().map(|u| u.output_tokens).sum()
    }

    pub fn total_calls(&self) -> u64 {
        self.by_model.values().map(|u| u.calls).sum()
    }

    pub fn by_model(&self) -> &BTreeMap<String, ModelUsage> {
        &self.by_model
    }
}

fn price(usage: &TokenUsage, pricing: ModelPricing) -> f64 {
    const PER: f64 = 1_000_000.0;
    usage.input_tokens as f64 / PER * pricing.input_per_mtok
        + usage.output_tokens as f64 / PER * pricing.output_per_mtok
        + usage.cache_write_tokens as f64 / PER * pricing.cache_write_per_mtok
        + usage.cache_read_tokens as f64 / PER * pricing.cache_read_per_mtok
}

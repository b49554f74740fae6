//! Per-model pricing table and cost formula (spec §4.6 step 7, §9 Open
//! Question 3).
//!
//! Open Question 3 ("the exact cost formula per model dimension ... must be
//! provided as input") is resolved here: pricing is an externally supplied,
//! statically loaded table keyed by model, with one micro-unit rate per
//! dimension (prompt/output/cache-create/cache-read). This restructures
//! `budget/pricing.rs`'s `PricingInfo`/dollar-and-cent, live-OpenRouter-fetch
//! model into a static table of integer micro-unit rates, since spec §3/§4.3
//! require money to be stored as integers scaled by 10^6 rather than float
//! dollars.

use std::collections::HashMap;
use std::sync::Arc;

use crate::usage::UsageDelta;

/// Micro-units (10^-6 currency units) per token, per dimension.
#[derive(Debug, Clone, Copy)]
pub struct ModelRate {
    pub prompt_per_token: i64,
    pub output_per_token: i64,
    pub cache_create_per_token: i64,
    pub cache_read_per_token: i64,
}

pub struct PricingTable {
    rates: HashMap<String, ModelRate>,
    default_rate: ModelRate,
}

pub type SharedPricingTable = Arc<PricingTable>;

impl PricingTable {
    /// Seeds a small default table; a deployment overrides/extends this from
    /// its own model-config input per Open Question 3.
    pub fn with_defaults() -> Arc<Self> {
        let mut rates = HashMap::new();
        rates.insert(
            "claude-opus".to_string(),
            ModelRate {
                prompt_per_token: 15,
                output_per_token: 75,
                cache_create_per_token: 19,
                cache_read_per_token: 2,
            },
        );
        rates.insert(
            "claude-sonnet".to_string(),
            ModelRate {
                prompt_per_token: 3,
                output_per_token: 15,
                cache_create_per_token: 4,
                cache_read_per_token: 1,
            },
        );
        rates.insert(
            "gpt-4o".to_string(),
            ModelRate {
                prompt_per_token: 5,
                output_per_token: 15,
                cache_create_per_token: 5,
                cache_read_per_token: 3,
            },
        );
        rates.insert(
            "gemini-1.5-pro".to_string(),
            ModelRate {
                prompt_per_token: 4,
                output_per_token: 12,
                cache_create_per_token: 4,
                cache_read_per_token: 1,
            },
        );

        Arc::new(Self {
            rates,
            default_rate: ModelRate {
                prompt_per_token: 1,
                output_per_token: 2,
                cache_create_per_token: 1,
                cache_read_per_token: 1,
            },
        })
    }

    pub fn set_rate(&mut self, model: impl Into<String>, rate: ModelRate) {
        self.rates.insert(model.into(), rate);
    }

    fn rate_for(&self, model: &str) -> ModelRate {
        self.rates
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, r)| *r)
            .unwrap_or(self.default_rate)
    }

    /// `cost = Σ tokens(dimension) × unitPrice(model, dimension) ×
    /// effectivePriceRate(user, key)` (spec §4.6 step 7). `price_rate` is the
    /// product of the user's billing multiplier and any key-level override;
    /// the result is truncated to whole micro-units.
    pub fn cost_for(&self, model: &str, delta: &UsageDelta, price_rate: f64) -> i64 {
        let rate = self.rate_for(model);
        let raw = delta.input_tokens as f64 * rate.prompt_per_token as f64
            + delta.output_tokens as f64 * rate.output_per_token as f64
            + delta.cache_creation_input_tokens as f64 * rate.cache_create_per_token as f64
            + delta.cache_read_input_tokens as f64 * rate.cache_read_per_token as f64;
        (raw * price_rate).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_falls_back_to_default_rate() {
        let table = PricingTable::with_defaults();
        let delta = UsageDelta {
            input_tokens: 1000,
            output_tokens: 1000,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        };
        let cost = table.cost_for("some-unlisted-model", &delta, 1.0);
        assert_eq!(cost, 1000 * 1 + 1000 * 2);
    }

    #[test]
    fn price_rate_multiplier_scales_cost() {
        let table = PricingTable::with_defaults();
        let delta = UsageDelta {
            input_tokens: 100,
            output_tokens: 0,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        };
        let base = table.cost_for("claude-sonnet", &delta, 1.0);
        let doubled = table.cost_for("claude-sonnet", &delta, 2.0);
        assert_eq!(doubled, base * 2);
    }

    #[test]
    fn zero_price_rate_is_free() {
        let table = PricingTable::with_defaults();
        let delta = UsageDelta {
            input_tokens: 1000,
            output_tokens: 1000,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        };
        assert_eq!(table.cost_for("claude-opus", &delta, 0.0), 0);
    }
}

//! Cost computation from token usage.

mod money;
mod tariff;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use money::{Money, MoneyError, NANOS_PER_UNIT};
pub use tariff::{
    ModelRate, ModelRateConfig, RateConfig, RateTriple, STANDARD_TIER, Tariff, TariffBuilder,
    TariffConfig, TariffError, TierRate, normalize_tier,
};

/// Note attached to costs computed from the tariff's default rate.
pub const NOTE_DEFAULT_PRICING: &str = "default pricing";
/// Note attached to zero-cost results for models the tariff does not know.
pub const NOTE_UNKNOWN_MODEL: &str = "unknown model pricing";
/// Note attached to costs clamped at [`Money::MAX`] because the exact figure overflowed.
pub const NOTE_COST_OVERFLOW: &str = "cost overflow, clamped to maximum";

/// Token usage reported by the upstream for a single request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    /// Subset of `prompt_tokens` served from the prompt cache.
    pub cached_prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, cached_prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            cached_prompt_tokens,
            completion_tokens,
        }
    }

    /// Cached tokens, clamped to `[0, prompt_tokens]`.
    pub fn cached_tokens(&self) -> i64 {
        self.cached_prompt_tokens.clamp(0, self.prompt_tokens.max(0))
    }

    pub fn non_cached_tokens(&self) -> i64 {
        self.prompt_tokens.max(0) - self.cached_tokens()
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens <= 0 && self.completion_tokens <= 0
    }
}

/// Result of pricing one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostBreakdown {
    /// Model name after tariff resolution (the raw name when unknown).
    pub model: String,
    pub requested_tier: String,
    pub actual_tier: String,
    pub cached_tokens: i64,
    pub non_cached_tokens: i64,
    pub completion_tokens: i64,
    pub prompt_cost: Money,
    pub completion_cost: Money,
    pub total_cost: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<&'static str>,
}

impl CostBreakdown {
    /// True when the requested service tier had no override and standard rates applied.
    pub fn tier_fallback(&self) -> bool {
        self.requested_tier != self.actual_tier
    }

    pub fn is_priced(&self) -> bool {
        self.note != Some(NOTE_UNKNOWN_MODEL)
    }
}

impl std::fmt::Display for CostBreakdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "model={} tier={} prompt={} (cached {} / uncached {}) completion={} ({} tokens) total={}",
            self.model,
            self.actual_tier,
            self.prompt_cost,
            self.cached_tokens,
            self.non_cached_tokens,
            self.completion_cost,
            self.completion_tokens,
            self.total_cost,
        )?;
        if let Some(note) = self.note {
            write!(f, " [{note}]")?;
        }
        Ok(())
    }
}

impl Tariff {
    /// Price `usage` for `raw_model` at the requested service tier.
    ///
    /// Unknown models without a default rate are not an error: the result has zero
    /// cost, the token counts echoed back, and [`NOTE_UNKNOWN_MODEL`] as note.
    pub fn compute_cost(&self, raw_model: &str, usage: &Usage, tier: Option<&str>) -> CostBreakdown {
        let model = self.resolve_model_name(raw_model).to_string();
        let cached_tokens = usage.cached_tokens();
        let non_cached_tokens = usage.non_cached_tokens();
        let completion_tokens = usage.completion_tokens.max(0);

        let (tier_rate, note) = match self.find(raw_model) {
            Some((_, rate)) => (rate.tier_rate(tier), None),
            None => match self.get_tier_rate(raw_model, tier) {
                Some(rate) => (rate, Some(NOTE_DEFAULT_PRICING)),
                None => {
                    return CostBreakdown {
                        model,
                        requested_tier: normalize_tier(tier),
                        actual_tier: STANDARD_TIER.to_string(),
                        cached_tokens,
                        non_cached_tokens,
                        completion_tokens,
                        prompt_cost: Money::ZERO,
                        completion_cost: Money::ZERO,
                        total_cost: Money::ZERO,
                        note: Some(NOTE_UNKNOWN_MODEL),
                    };
                }
            },
        };

        if tier_rate.is_fallback() {
            tracing::debug!(
                model = %model,
                requested_tier = %tier_rate.requested_tier,
                actual_tier = %tier_rate.actual_tier,
                "No override for requested service tier, using standard rates"
            );
        }

        let rate = tier_rate.rate;
        let prompt_cost = rate
            .prompt
            .checked_multiply(non_cached_tokens)
            .zip(rate.cached_prompt.checked_multiply(cached_tokens))
            .and_then(|(uncached, cached)| uncached.checked_add(cached));
        let completion_cost = rate.completion.checked_multiply(completion_tokens);
        let total_cost = prompt_cost
            .zip(completion_cost)
            .and_then(|(prompt, completion)| prompt.checked_add(completion));

        let (prompt_cost, completion_cost, total_cost, note) =
            match (prompt_cost, completion_cost, total_cost) {
                (Some(prompt), Some(completion), Some(total)) => (prompt, completion, total, note),
                (prompt, completion, _) => {
                    tracing::warn!(
                        model = %model,
                        non_cached_tokens,
                        cached_tokens,
                        completion_tokens,
                        "Cost exceeds the representable range, charging the maximum"
                    );
                    (
                        prompt.unwrap_or(Money::MAX),
                        completion.unwrap_or(Money::MAX),
                        Money::MAX,
                        Some(NOTE_COST_OVERFLOW),
                    )
                }
            };

        CostBreakdown {
            model,
            requested_tier: tier_rate.requested_tier,
            actual_tier: tier_rate.actual_tier,
            cached_tokens,
            non_cached_tokens,
            completion_tokens,
            prompt_cost,
            completion_cost,
            total_cost,
            note,
        }
    }
}

/// Prices usage against the current tariff snapshot.
///
/// The tariff is swapped as a whole; readers hold an `Arc` to the snapshot they
/// started with, so a reload never observes a half-updated table.
#[derive(Debug)]
pub struct PricingEngine {
    tariff: RwLock<Arc<Tariff>>,
}

impl PricingEngine {
    pub fn new(tariff: Tariff) -> Self {
        Self {
            tariff: RwLock::new(Arc::new(tariff)),
        }
    }

    pub fn tariff(&self) -> Arc<Tariff> {
        Arc::clone(&self.tariff.read())
    }

    /// Install a new tariff, returning the previous one.
    pub fn replace_tariff(&self, tariff: Tariff) -> Arc<Tariff> {
        let new = Arc::new(tariff);
        tracing::info!(
            version = new.version().unwrap_or("unversioned"),
            models = new.len(),
            "Tariff replaced"
        );
        std::mem::replace(&mut *self.tariff.write(), new)
    }

    pub fn resolve_model_name(&self, raw: &str) -> String {
        self.tariff.read().resolve_model_name(raw).to_string()
    }

    pub fn get_tier_rate(&self, raw_model: &str, tier: Option<&str>) -> Option<TierRate> {
        self.tariff.read().get_tier_rate(raw_model, tier)
    }

    pub fn compute_cost(&self, raw_model: &str, usage: &Usage, tier: Option<&str>) -> CostBreakdown {
        self.tariff().compute_cost(raw_model, usage, tier)
    }
}

//! Tariff tables: per-model token rates, service-tier overrides and aliases.
//!
//! Rates are configured as exact decimals in USD per one million tokens and
//! converted once, at load time, into per-token [`Money`]. Costs are then plain
//! integer multiplication, so splitting a charge never changes its total.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::money::{Money, MoneyError};

/// Name of the tier every model is priced at unless an override applies.
pub const STANDARD_TIER: &str = "standard";

const TOKENS_PER_RATE_UNIT: i64 = 1_000_000;

#[derive(Debug, Error)]
pub enum TariffError {
    #[error("Failed to read tariff file {1}: {0}")]
    Io(std::io::Error, PathBuf),

    #[error("Failed to parse tariff file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid rate for {context}: {reason}")]
    InvalidRate { context: String, reason: String },

    #[error("Invalid tariff: {0}")]
    Invalid(String),
}

/// One rate triple as written in configuration, in USD per 1M tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateConfig {
    pub prompt: Decimal,

    /// Defaults to `prompt` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_prompt: Option<Decimal>,

    pub completion: Decimal,
}

/// A model entry in the tariff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelRateConfig {
    pub prompt: Decimal,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_prompt: Option<Decimal>,

    pub completion: Decimal,

    /// Alternative names that match this model exactly (never by prefix).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    /// Service-tier overrides keyed by tier name (e.g. `flex`, `priority`, `batch`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tiers: HashMap<String, RateConfig>,
}

impl ModelRateConfig {
    fn standard(&self) -> RateConfig {
        RateConfig {
            prompt: self.prompt,
            cached_prompt: self.cached_prompt,
            completion: self.completion,
        }
    }
}

/// The `[pricing]` configuration table, also the shape of a standalone tariff file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TariffConfig {
    /// Standalone TOML tariff file. When set, inline models are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Free-form tariff version label, reported in logs and the admin API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Rate applied to models with no matching entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<RateConfig>,

    #[serde(default)]
    pub models: HashMap<String, ModelRateConfig>,
}

impl TariffConfig {
    /// Read a standalone tariff file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TariffError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| TariffError::Io(e, path.to_path_buf()))?;
        let config: TariffConfig = toml::from_str(&contents)?;
        if config.file.is_some() {
            return Err(TariffError::Invalid(format!(
                "tariff file {} must not reference another file",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Resolve the effective tariff: the referenced file if any, otherwise the inline tables.
    pub fn load(&self) -> Result<Tariff, TariffError> {
        match &self.file {
            Some(path) => Tariff::from_config(&Self::from_file(path)?),
            None => Tariff::from_config(self),
        }
    }
}

/// Per-token rates for one pricing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateTriple {
    pub prompt: Money,
    pub cached_prompt: Money,
    pub completion: Money,
}

impl RateTriple {
    fn from_config(config: &RateConfig, context: &str) -> Result<Self, TariffError> {
        let prompt = per_token(config.prompt, &format!("{context}.prompt"))?;
        let cached_prompt = match config.cached_prompt {
            Some(rate) => per_token(rate, &format!("{context}.cached_prompt"))?,
            None => prompt,
        };
        let completion = per_token(config.completion, &format!("{context}.completion"))?;
        Ok(Self {
            prompt,
            cached_prompt,
            completion,
        })
    }

    /// Build a triple directly from USD-per-1M decimals.
    pub fn per_million(
        prompt: Decimal,
        cached_prompt: Decimal,
        completion: Decimal,
    ) -> Result<Self, TariffError> {
        Self::from_config(
            &RateConfig {
                prompt,
                cached_prompt: Some(cached_prompt),
                completion,
            },
            "rate",
        )
    }
}

/// Convert a USD-per-1M rate to an exact per-token amount.
fn per_token(per_million: Decimal, context: &str) -> Result<Money, TariffError> {
    let invalid = |reason: String| TariffError::InvalidRate {
        context: context.to_string(),
        reason,
    };

    if per_million.is_sign_negative() && !per_million.is_zero() {
        return Err(invalid(format!("rate {per_million} is negative")));
    }

    let per_token_usd = per_million / Decimal::from(TOKENS_PER_RATE_UNIT);
    let rate = Money::from_decimal(per_token_usd).map_err(|e: MoneyError| invalid(e.to_string()))?;

    if rate.checked_multiply(TOKENS_PER_RATE_UNIT).is_none() {
        return Err(invalid(format!(
            "rate {per_million} per 1M tokens overflows the money range"
        )));
    }

    if rate.to_decimal() != per_token_usd.normalize() {
        tracing::warn!(
            rate = %context,
            per_million = %per_million,
            per_token_nanos = rate.nanos(),
            "Rate is finer than one nano-unit per token, rounded"
        );
    }

    Ok(rate)
}

/// Rates for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRate {
    pub standard: RateTriple,
    pub tiers: HashMap<String, RateTriple>,
    pub aliases: Vec<String>,
}

impl ModelRate {
    pub fn new(standard: RateTriple) -> Self {
        Self {
            standard,
            tiers: HashMap::new(),
            aliases: Vec::new(),
        }
    }

    pub fn with_tier(mut self, tier: &str, rate: RateTriple) -> Self {
        self.tiers.insert(normalize_tier(Some(tier)), rate);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Rate for a requested tier, falling back to standard when there is no override.
    pub fn tier_rate(&self, tier: Option<&str>) -> TierRate {
        let requested = normalize_tier(tier);
        match self.tiers.get(&requested) {
            Some(rate) if requested != STANDARD_TIER => TierRate {
                rate: *rate,
                actual_tier: requested.clone(),
                requested_tier: requested,
            },
            _ => TierRate {
                rate: self.standard,
                actual_tier: STANDARD_TIER.to_string(),
                requested_tier: requested,
            },
        }
    }
}

/// The outcome of a tier lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierRate {
    pub rate: RateTriple,
    pub requested_tier: String,
    pub actual_tier: String,
}

impl TierRate {
    /// True when a non-standard tier was requested but standard rates were applied.
    pub fn is_fallback(&self) -> bool {
        self.requested_tier != self.actual_tier
    }
}

/// Canonical tier name: lowercase, with "default" and absent meaning standard.
pub fn normalize_tier(tier: Option<&str>) -> String {
    match tier.map(str::trim) {
        None | Some("") => STANDARD_TIER.to_string(),
        Some(t) if t.eq_ignore_ascii_case("default") => STANDARD_TIER.to_string(),
        Some(t) => t.to_ascii_lowercase(),
    }
}

/// An immutable, validated pricing table.
#[derive(Debug, Clone, Default)]
pub struct Tariff {
    version: Option<String>,
    models: HashMap<String, ModelRate>,
    aliases: HashMap<String, String>,
    /// Model names ordered longest first, for prefix resolution.
    by_length: Vec<String>,
    default: Option<RateTriple>,
}

impl Tariff {
    pub fn builder() -> TariffBuilder {
        TariffBuilder::default()
    }

    pub fn from_config(config: &TariffConfig) -> Result<Self, TariffError> {
        let mut builder = Tariff::builder();
        if let Some(version) = &config.version {
            builder = builder.version(version.clone());
        }
        if let Some(default) = &config.default {
            builder = builder.default_rate(RateTriple::from_config(default, "default")?);
        }

        for (name, model) in &config.models {
            let context = format!("models.{name}");
            let mut rate = ModelRate::new(RateTriple::from_config(&model.standard(), &context)?);
            for (tier, tier_config) in &model.tiers {
                if tier.trim().is_empty() {
                    return Err(TariffError::Invalid(format!(
                        "model '{name}' has a tier with an empty name"
                    )));
                }
                let tier_rate =
                    RateTriple::from_config(tier_config, &format!("{context}.tiers.{tier}"))?;
                rate = rate.with_tier(tier, tier_rate);
            }
            rate.aliases = model.aliases.clone();
            builder = builder.model(name.clone(), rate);
        }

        builder.build()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn default_rate(&self) -> Option<&RateTriple> {
        self.default.as_ref()
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Map an observed model name onto a configured one.
    ///
    /// Exact model keys win, then exact aliases, then the longest configured name
    /// that prefixes `raw`. Unknown names come back unchanged.
    pub fn resolve_model_name<'a>(&'a self, raw: &'a str) -> &'a str {
        if let Some((name, _)) = self.models.get_key_value(raw) {
            return name;
        }
        if let Some(target) = self.aliases.get(raw) {
            return target;
        }
        self.by_length
            .iter()
            .find(|name| raw.starts_with(name.as_str()))
            .map(String::as_str)
            .unwrap_or(raw)
    }

    /// Find the rate entry for an observed model name.
    pub fn find(&self, raw: &str) -> Option<(&str, &ModelRate)> {
        let name = self.resolve_model_name(raw);
        self.models
            .get_key_value(name)
            .map(|(name, rate)| (name.as_str(), rate))
    }

    /// Rate triple for a model and tier, using the default rate for unknown models.
    pub fn get_tier_rate(&self, raw_model: &str, tier: Option<&str>) -> Option<TierRate> {
        match self.find(raw_model) {
            Some((_, rate)) => Some(rate.tier_rate(tier)),
            None => self.default.map(|rate| TierRate {
                rate,
                requested_tier: normalize_tier(tier),
                actual_tier: STANDARD_TIER.to_string(),
            }),
        }
    }
}

/// Programmatic construction of a [`Tariff`], used by config loading and tests.
#[derive(Debug, Default)]
pub struct TariffBuilder {
    version: Option<String>,
    models: HashMap<String, ModelRate>,
    default: Option<RateTriple>,
}

impl TariffBuilder {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn model(mut self, name: impl Into<String>, rate: ModelRate) -> Self {
        self.models.insert(name.into(), rate);
        self
    }

    pub fn default_rate(mut self, rate: RateTriple) -> Self {
        self.default = Some(rate);
        self
    }

    pub fn build(self) -> Result<Tariff, TariffError> {
        let mut aliases = HashMap::new();
        for (name, rate) in &self.models {
            if name.trim().is_empty() {
                return Err(TariffError::Invalid("model names must not be empty".into()));
            }
            for alias in &rate.aliases {
                if self.models.contains_key(alias) {
                    return Err(TariffError::Invalid(format!(
                        "alias '{alias}' of model '{name}' shadows a configured model"
                    )));
                }
                if let Some(previous) = aliases.insert(alias.clone(), name.clone()) {
                    return Err(TariffError::Invalid(format!(
                        "alias '{alias}' is claimed by both '{previous}' and '{name}'"
                    )));
                }
            }
        }

        let mut by_length: Vec<String> = self.models.keys().cloned().collect();
        by_length.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Ok(Tariff {
            version: self.version,
            models: self.models,
            aliases,
            by_length,
            default: self.default,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rust_decimal::dec;

    use super::*;

    fn gpt_4o_rates() -> RateTriple {
        RateTriple::per_million(dec!(5.00), dec!(0.50), dec!(15.00)).unwrap()
    }

    fn sample_tariff() -> Tariff {
        let mini = RateTriple::per_million(dec!(0.15), dec!(0.075), dec!(0.60)).unwrap();
        Tariff::builder()
            .model(
                "gpt-4o",
                ModelRate::new(gpt_4o_rates())
                    .with_alias("chatgpt-4o-latest")
                    .with_tier(
                        "flex",
                        RateTriple::per_million(dec!(2.50), dec!(0.25), dec!(7.50)).unwrap(),
                    ),
            )
            .model("gpt-4o-mini", ModelRate::new(mini))
            .build()
            .unwrap()
    }

    #[test]
    fn test_per_million_converts_to_per_token_nanos() {
        let rates = gpt_4o_rates();
        // $5 / 1M tokens = $0.000005 per token = 50_000 nano-units
        assert_eq!(rates.prompt.nanos(), 50_000);
        assert_eq!(rates.cached_prompt.nanos(), 5_000);
        assert_eq!(rates.completion.nanos(), 150_000);
    }

    #[test]
    fn test_fractional_rate_is_exact() {
        let rates = RateTriple::per_million(dec!(0.0025), dec!(0.0025), dec!(0.0025)).unwrap();
        assert_eq!(rates.prompt.nanos(), 25);
    }

    #[test]
    fn test_negative_rate_rejected() {
        let err = RateTriple::per_million(dec!(-1), dec!(0), dec!(1)).unwrap_err();
        assert!(matches!(err, TariffError::InvalidRate { .. }));
    }

    #[test]
    fn test_overflowing_rate_rejected() {
        let err = RateTriple::per_million(dec!(10000000000000), dec!(0), dec!(0)).unwrap_err();
        assert!(matches!(err, TariffError::InvalidRate { .. }));
    }

    #[rstest]
    #[case("gpt-4o", "gpt-4o")]
    #[case("gpt-4o-mini", "gpt-4o-mini")]
    #[case("gpt-4o-mini-2024-07-18", "gpt-4o-mini")]
    #[case("gpt-4o-2024-08-06", "gpt-4o")]
    #[case("chatgpt-4o-latest", "gpt-4o")]
    #[case("o3-pro", "o3-pro")]
    #[case("", "")]
    fn test_resolve_model_name(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sample_tariff().resolve_model_name(raw), expected);
    }

    #[test]
    fn test_longest_prefix_is_deterministic_regardless_of_insertion_order() {
        let rate = ModelRate::new(gpt_4o_rates());
        let tariff = Tariff::builder()
            .model("gpt-4o-mini", rate.clone())
            .model("gpt", rate.clone())
            .model("gpt-4o", rate)
            .build()
            .unwrap();
        for _ in 0..10 {
            assert_eq!(
                tariff.resolve_model_name("gpt-4o-mini-2024-07-18"),
                "gpt-4o-mini"
            );
        }
        assert_eq!(tariff.resolve_model_name("gpt-3.5-turbo"), "gpt");
    }

    #[test]
    fn test_aliases_do_not_match_by_prefix() {
        let tariff = sample_tariff();
        assert_eq!(
            tariff.resolve_model_name("chatgpt-4o-latest-preview"),
            "chatgpt-4o-latest-preview"
        );
        assert!(tariff.find("chatgpt-4o-latest-preview").is_none());
    }

    #[rstest]
    #[case(None, "standard", "standard")]
    #[case(Some("standard"), "standard", "standard")]
    #[case(Some("default"), "standard", "standard")]
    #[case(Some("flex"), "flex", "flex")]
    #[case(Some("FLEX"), "flex", "flex")]
    #[case(Some("priority"), "priority", "standard")]
    fn test_tier_rate(
        #[case] tier: Option<&str>,
        #[case] requested: &str,
        #[case] actual: &str,
    ) {
        let tariff = sample_tariff();
        let rate = tariff.get_tier_rate("gpt-4o", tier).unwrap();
        assert_eq!(rate.requested_tier, requested);
        assert_eq!(rate.actual_tier, actual);
        if actual == "flex" {
            assert_eq!(rate.rate.prompt.nanos(), 25_000);
        } else {
            assert_eq!(rate.rate, gpt_4o_rates());
        }
        assert_eq!(rate.is_fallback(), requested != actual);
    }

    #[test]
    fn test_unknown_model_uses_default_rate() {
        let tariff = Tariff::builder()
            .default_rate(gpt_4o_rates())
            .build()
            .unwrap();
        let rate = tariff.get_tier_rate("mystery-model", Some("flex")).unwrap();
        assert_eq!(rate.rate, gpt_4o_rates());
        assert_eq!(rate.actual_tier, STANDARD_TIER);
        assert!(rate.is_fallback());
    }

    #[test]
    fn test_unknown_model_without_default() {
        assert!(sample_tariff().get_tier_rate("mystery-model", None).is_none());
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let rate = ModelRate::new(gpt_4o_rates());
        let err = Tariff::builder()
            .model("a", rate.clone().with_alias("shared"))
            .model("b", rate.with_alias("shared"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("shared"));
    }

    #[test]
    fn test_alias_shadowing_model_rejected() {
        let rate = ModelRate::new(gpt_4o_rates());
        let result = Tariff::builder()
            .model("a", rate.clone().with_alias("b"))
            .model("b", rate)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_toml_config() {
        let config: TariffConfig = toml::from_str(
            r#"
            version = "2025-06"

            [default]
            prompt = "10"
            completion = "30"

            [models."gpt-4o"]
            prompt = "5.00"
            cached_prompt = "0.50"
            completion = "15.00"
            aliases = ["chatgpt-4o-latest"]

            [models."gpt-4o".tiers.priority]
            prompt = "8.75"
            cached_prompt = "0.875"
            completion = "26.25"
            "#,
        )
        .unwrap();

        let tariff = Tariff::from_config(&config).unwrap();
        assert_eq!(tariff.version(), Some("2025-06"));
        assert_eq!(tariff.len(), 1);

        let default = tariff.default_rate().unwrap();
        // cached_prompt falls back to the prompt rate
        assert_eq!(default.cached_prompt, default.prompt);

        let priority = tariff.get_tier_rate("chatgpt-4o-latest", Some("priority")).unwrap();
        assert_eq!(priority.actual_tier, "priority");
        assert_eq!(priority.rate.prompt.nanos(), 87_500);
        assert_eq!(priority.rate.cached_prompt.nanos(), 8_750);
    }

    #[test]
    fn test_from_config_rejects_unknown_fields() {
        let result: Result<TariffConfig, _> = toml::from_str(
            r#"
            [models."gpt-4o"]
            prompt = "5"
            completion = "15"
            input = "5"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pricing.toml");
        std::fs::write(
            &path,
            r#"
            [models."gpt-4o-mini"]
            prompt = "0.15"
            completion = "0.60"
            "#,
        )
        .unwrap();

        let config = TariffConfig {
            file: Some(path),
            ..Default::default()
        };
        let tariff = config.load().unwrap();
        assert!(tariff.find("gpt-4o-mini-2024-07-18").is_some());
    }

    #[test]
    fn test_load_missing_file() {
        let config = TariffConfig {
            file: Some(PathBuf::from("/nonexistent/pricing.toml")),
            ..Default::default()
        };
        assert!(matches!(config.load(), Err(TariffError::Io(..))));
    }
}

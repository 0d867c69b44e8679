use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::pricing::Money;

/// Spend limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Maximum spend per caller per rolling hour, in USD.
    /// A negative value disables limiting; zero blocks every identified caller.
    #[serde(default = "default_spend_limit_per_hour")]
    pub spend_limit_per_hour: Decimal,

    /// Stored spend windows older than this are purged.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,

    /// Interval between background cleanup runs. 0 disables the worker.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            spend_limit_per_hour: default_spend_limit_per_hour(),
            retention_hours: default_retention_hours(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.spend_limit()?;
        if self.retention_hours < 1 {
            return Err(ConfigError::Validation(
                "limits.retention_hours must be at least 1 so open windows survive cleanup".into(),
            ));
        }
        Ok(())
    }

    /// The configured limit in money units; negative values map to [`Money::DISABLED`].
    pub fn spend_limit(&self) -> Result<Money, ConfigError> {
        if self.spend_limit_per_hour.is_sign_negative() && !self.spend_limit_per_hour.is_zero() {
            return Ok(Money::DISABLED);
        }
        Money::from_decimal(self.spend_limit_per_hour).map_err(|e| {
            ConfigError::Validation(format!("limits.spend_limit_per_hour: {e}"))
        })
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.retention_hours))
    }
}

fn default_spend_limit_per_hour() -> Decimal {
    Decimal::TWO
}

fn default_retention_hours() -> u32 {
    crate::limiter::RETENTION_HOURS as u32
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = LimitsConfig::default();
        assert_eq!(config.spend_limit().unwrap(), Money::from_decimal(dec!(2)).unwrap());
        assert_eq!(config.retention(), chrono::Duration::hours(24));
        assert_eq!(config.cleanup_interval_secs, 3600);
    }

    #[test]
    fn test_parse_decimal_forms() {
        let config: LimitsConfig = toml::from_str("spend_limit_per_hour = 0.25").unwrap();
        assert_eq!(config.spend_limit().unwrap(), Money::from_dollars(0.25));

        let config: LimitsConfig = toml::from_str(r#"spend_limit_per_hour = "1.10""#).unwrap();
        assert_eq!(config.spend_limit().unwrap(), Money::from_decimal(dec!(1.10)).unwrap());
    }

    #[test]
    fn test_negative_disables() {
        let config: LimitsConfig = toml::from_str("spend_limit_per_hour = -1").unwrap();
        assert_eq!(config.spend_limit().unwrap(), Money::DISABLED);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let config = LimitsConfig {
            spend_limit_per_hour: Decimal::from(1_000_000_000_000i64),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_retention_rejected() {
        let config = LimitsConfig {
            retention_hours: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

//! Configuration module for the spend-limiting proxy.
//!
//! The proxy is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 8080
//!
//! [upstream]
//! base_url = "https://api.openai.com"
//!
//! [limits]
//! spend_limit_per_hour = 2.0
//!
//! [database]
//! type = "sqlite"
//! path = "${DATA_DIR}/tollgate_usage.db"
//!
//! [pricing.models."gpt-4o"]
//! prompt = "2.50"
//! completion = "10.00"
//! ```

mod database;
mod limits;
mod observability;
mod server;
mod upstream;

use std::path::Path;

pub use database::*;
pub use limits::*;
pub use observability::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use upstream::*;

use crate::pricing::{Tariff, TariffConfig, TariffError};

/// Root configuration.
///
/// Every section is optional; an empty file yields a proxy to the OpenAI API
/// with a $2/hour limit and a local SQLite store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Proxy listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Admin listener.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Upstream API every request is forwarded to.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Spend limit and retention.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Persistent spend storage.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Model tariff, inline or in a separate file.
    #[serde(default)]
    pub pricing: TariffConfig,

    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing variables cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: GatewayConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.upstream.validate()?;
        self.limits.validate()?;
        self.database.validate()?;

        if self.admin.enabled
            && self.admin.host == self.server.host
            && self.admin.port == self.server.port
        {
            return Err(ConfigError::Validation(
                "admin and server listeners cannot share an address".into(),
            ));
        }

        // A file-backed tariff is checked when it is loaded
        if self.pricing.file.is_none() {
            Tariff::from_config(&self.pricing)?;
        }

        Ok(())
    }

    /// Build the tariff this configuration describes.
    pub fn load_tariff(&self) -> Result<Tariff, ConfigError> {
        Ok(self.pricing.load()?)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Invalid pricing configuration: {0}")]
    Tariff(#[from] TariffError),
}

/// Expand `${VAR}` references, leaving anything after a `#` on a line untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("env var pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };
            if comment_pos.is_some_and(|pos| whole.start() >= pos) {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);
            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rust_decimal::dec;

    use super::*;
    use crate::pricing::Money;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GatewayConfig::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.admin.port, 8081);
        assert_eq!(config.upstream.base_url, "https://api.openai.com");
        assert_eq!(config.limits.spend_limit_per_hour, dec!(2));
        assert!(matches!(config.database, DatabaseConfig::Sqlite(_)));
        assert!(config.load_tariff().unwrap().is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = GatewayConfig::from_str(
            r#"
            [server]
            port = 9000

            [admin]
            port = 9001

            [upstream]
            base_url = "http://localhost:4000"
            organization = "org-123"

            [limits]
            spend_limit_per_hour = "0.50"

            [database]
            type = "none"

            [pricing]
            version = "2025-06"

            [pricing.models."gpt-4o"]
            prompt = "5.00"
            cached_prompt = "0.50"
            completion = "15.00"

            [observability.logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.upstream.organization.as_deref(), Some("org-123"));
        assert_eq!(
            config.limits.spend_limit().unwrap(),
            Money::from_decimal(dec!(0.5)).unwrap()
        );
        assert!(config.database.is_none());
        assert_eq!(config.observability.logging.format, LogFormat::Json);

        let tariff = config.load_tariff().unwrap();
        assert_eq!(tariff.version(), Some("2025-06"));
        assert!(tariff.find("gpt-4o").is_some());
    }

    #[test]
    fn test_unknown_section_rejected() {
        let result = GatewayConfig::from_str("[providers]\nfoo = 1");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_inline_tariff_rejected() {
        let result = GatewayConfig::from_str(
            r#"
            [pricing.models."gpt-4o"]
            prompt = "-1.00"
            completion = "1.00"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Tariff(_))));
    }

    #[test]
    fn test_shared_listener_address_rejected() {
        let result = GatewayConfig::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 8080

            [admin]
            host = "127.0.0.1"
            port = 8080
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_pricing_file_reference() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [models."gpt-4o-mini"]
            prompt = "0.15"
            completion = "0.60"
            "#
        )
        .unwrap();

        let config = GatewayConfig::from_str(&format!(
            "[pricing]\nfile = {:?}\n",
            file.path().to_string_lossy()
        ))
        .unwrap();
        let tariff = config.load_tariff().unwrap();
        assert!(tariff.find("gpt-4o-mini").is_some());
    }

    #[test]
    fn test_missing_pricing_file() {
        let config = GatewayConfig::from_str("[pricing]\nfile = \"/nonexistent/tariff.toml\"\n")
            .unwrap();
        assert!(matches!(
            config.load_tariff(),
            Err(ConfigError::Tariff(TariffError::Io(..)))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let result = GatewayConfig::from_file("/nonexistent/tollgate.toml");
        assert!(matches!(result, Err(ConfigError::Io(..))));
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("TOLLGATE_TEST_UPSTREAM", Some("http://upstream:8000"), || {
            let config = GatewayConfig::from_str(
                r#"
                [upstream]
                base_url = "${TOLLGATE_TEST_UPSTREAM}"
                "#,
            )
            .unwrap();
            assert_eq!(config.upstream.base_url, "http://upstream:8000");
        });
    }

    #[test]
    fn test_env_var_missing() {
        temp_env::with_var_unset("TOLLGATE_TEST_MISSING", || {
            let result = expand_env_vars("path = \"${TOLLGATE_TEST_MISSING}\"");
            assert!(
                matches!(result, Err(ConfigError::EnvVarNotFound(ref v)) if v == "TOLLGATE_TEST_MISSING")
            );
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        temp_env::with_var_unset("TOLLGATE_TEST_COMMENTED", || {
            let input = "port = 8080 # override with ${TOLLGATE_TEST_COMMENTED}\n";
            assert_eq!(expand_env_vars(input).unwrap(), input);
        });
    }

    #[test]
    fn test_env_var_multiple_on_line() {
        temp_env::with_vars(
            [("TOLLGATE_TEST_A", Some("one")), ("TOLLGATE_TEST_B", Some("two"))],
            || {
                assert_eq!(
                    expand_env_vars("x = \"${TOLLGATE_TEST_A}-${TOLLGATE_TEST_B}\"").unwrap(),
                    "x = \"one-two\""
                );
            },
        );
    }
}

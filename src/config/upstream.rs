use serde::{Deserialize, Serialize};
use url::Url;

use super::ConfigError;

/// The single upstream every proxied request is forwarded to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL; the request path and query are appended to it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Sent as `OpenAI-Organization` when the client sends none.
    #[serde(default)]
    pub organization: Option<String>,

    /// Sent as `OpenAI-Project` when the client sends none.
    #[serde(default)]
    pub project: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            organization: None,
            project: None,
        }
    }
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_base_url().map(|_| ())
    }

    pub fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            ConfigError::Validation(format!("upstream.base_url '{}': {e}", self.base_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "upstream.base_url must use http or https, got '{}'",
                url.scheme()
            )));
        }
        Ok(url)
    }

    /// Join a request path and optional query onto the base URL.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let base = self.base_url.trim_end_matches('/');
        match query {
            Some(q) if !q.is_empty() => format!("{base}{path}?{q}"),
            _ => format!("{base}{path}"),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

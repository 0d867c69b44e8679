//! Usage extraction from upstream JSON response bodies.
//!
//! Two payload shapes are recognised, discriminated by the `object` field:
//! chat completions (`"chat.completion"`, also assumed when `object` is absent
//! or not a string) and the responses API (`"response"`). Anything else carries
//! no billable usage.
//!
//! Token counts accept any JSON number; fractional values are truncated.

use serde::{Deserialize, Deserializer, de};

use crate::pricing::Usage;

/// Usage and pricing hints pulled out of one upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub model: Option<String>,
    pub service_tier: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "object")]
pub enum UpstreamPayload {
    #[serde(rename = "chat.completion")]
    ChatCompletion(ChatCompletionPayload),
    #[serde(rename = "response")]
    Response(ResponsePayload),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatCompletionPayload {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub service_tier: Option<String>,
    #[serde(default)]
    pub usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatCompletionUsage {
    #[serde(default, deserialize_with = "token_count")]
    pub prompt_tokens: i64,
    #[serde(default, deserialize_with = "token_count")]
    pub completion_tokens: i64,
    #[serde(default)]
    pub prompt_tokens_details: Option<CachedTokenDetails>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub service_tier: Option<String>,
    #[serde(default)]
    pub usage: Option<ResponseUsage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseUsage {
    #[serde(default, deserialize_with = "token_count")]
    pub input_tokens: i64,
    #[serde(default, deserialize_with = "token_count")]
    pub output_tokens: i64,
    #[serde(default)]
    pub input_tokens_details: Option<CachedTokenDetails>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CachedTokenDetails {
    #[serde(default, deserialize_with = "optional_token_count")]
    pub cached_tokens: Option<i64>,
}

fn number_to_tokens<E: de::Error>(number: serde_json::Number) -> Result<i64, E> {
    if let Some(n) = number.as_i64() {
        return Ok(n);
    }
    match number.as_f64() {
        // Float-to-int `as` saturates at the i64 bounds
        Some(f) if f.is_finite() => Ok(f.trunc() as i64),
        _ => Err(E::custom(format!("invalid token count {number}"))),
    }
}

fn token_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    number_to_tokens(serde_json::Number::deserialize(deserializer)?)
}

fn optional_token_count<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<i64>, D::Error> {
    Option::<serde_json::Number>::deserialize(deserializer)?
        .map(number_to_tokens)
        .transpose()
}

impl CachedTokenDetails {
    fn cached(details: Option<&Self>) -> i64 {
        details.and_then(|d| d.cached_tokens).unwrap_or(0)
    }
}

impl UpstreamPayload {
    /// Decode a response body. A missing or non-string `object` field is read as
    /// a chat completion.
    pub fn from_value(body: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if body.is_object() && !body.get("object").is_some_and(serde_json::Value::is_string) {
            return ChatCompletionPayload::deserialize(body).map(UpstreamPayload::ChatCompletion);
        }
        UpstreamPayload::deserialize(body)
    }

    pub fn into_report(self) -> Option<UsageReport> {
        match self {
            UpstreamPayload::ChatCompletion(payload) => {
                let usage = payload.usage?;
                Some(UsageReport {
                    model: payload.model,
                    service_tier: payload.service_tier,
                    usage: normalized(
                        usage.prompt_tokens,
                        CachedTokenDetails::cached(usage.prompt_tokens_details.as_ref()),
                        usage.completion_tokens,
                    ),
                })
            }
            UpstreamPayload::Response(payload) => {
                let usage = payload.usage?;
                Some(UsageReport {
                    model: payload.model,
                    service_tier: payload.service_tier,
                    usage: normalized(
                        usage.input_tokens,
                        CachedTokenDetails::cached(usage.input_tokens_details.as_ref()),
                        usage.output_tokens,
                    ),
                })
            }
            UpstreamPayload::Unknown => None,
        }
    }
}

fn normalized(prompt: i64, cached: i64, completion: i64) -> Usage {
    let prompt = prompt.max(0);
    Usage::new(prompt, cached.clamp(0, prompt), completion.max(0))
}

/// Extract billable usage from a decoded upstream response.
///
/// Returns `None` for unrecognised `object` types, payloads without a usage
/// section, and payloads whose fields have unexpected types.
pub fn extract_usage(body: &serde_json::Value) -> Option<UsageReport> {
    match UpstreamPayload::from_value(body) {
        Ok(payload) => payload.into_report(),
        Err(e) => {
            tracing::debug!(error = %e, "Upstream payload did not match a known usage shape");
            None
        }
    }
}

/// Convenience wrapper over raw response bytes.
pub fn extract_usage_from_slice(bytes: &[u8]) -> Option<UsageReport> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    extract_usage(&value)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_chat_completion_usage() {
        let body = json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "model": "gpt-4o-2024-08-06",
            "service_tier": "default",
            "choices": [],
            "usage": {
                "prompt_tokens": 1000,
                "completion_tokens": 500,
                "total_tokens": 1500,
                "prompt_tokens_details": { "cached_tokens": 200, "audio_tokens": 0 }
            }
        });

        let report = extract_usage(&body).unwrap();
        assert_eq!(report.model.as_deref(), Some("gpt-4o-2024-08-06"));
        assert_eq!(report.service_tier.as_deref(), Some("default"));
        assert_eq!(report.usage, Usage::new(1000, 200, 500));
    }

    #[test]
    fn test_missing_object_defaults_to_chat_completion() {
        let body = json!({
            "model": "gpt-4o",
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
        });
        let report = extract_usage(&body).unwrap();
        assert_eq!(report.usage, Usage::new(12, 0, 3));
    }

    #[test]
    fn test_non_string_object_defaults_to_chat_completion() {
        for object in [json!(null), json!(42), json!({ "kind": "chat" })] {
            let body = json!({
                "object": object,
                "model": "gpt-4o",
                "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
            });
            let report = extract_usage(&body).unwrap();
            assert_eq!(report.model.as_deref(), Some("gpt-4o"));
            assert_eq!(report.usage, Usage::new(10, 0, 5));
        }
    }

    #[test]
    fn test_float_token_counts_accepted() {
        let body = json!({
            "object": "chat.completion",
            "usage": {
                "prompt_tokens": 12.0,
                "completion_tokens": 3.7,
                "prompt_tokens_details": { "cached_tokens": 2.0 }
            }
        });
        assert_eq!(extract_usage(&body).unwrap().usage, Usage::new(12, 2, 3));

        let body = json!({
            "object": "response",
            "usage": { "input_tokens": 8.0, "output_tokens": 1e3 }
        });
        assert_eq!(extract_usage(&body).unwrap().usage, Usage::new(8, 0, 1000));
    }

    #[test]
    fn test_null_cached_tokens_is_zero() {
        let body = json!({
            "object": "chat.completion",
            "usage": {
                "prompt_tokens": 4,
                "completion_tokens": 1,
                "prompt_tokens_details": { "cached_tokens": null }
            }
        });
        assert_eq!(extract_usage(&body).unwrap().usage, Usage::new(4, 0, 1));
    }

    #[test]
    fn test_responses_api_usage() {
        let body = json!({
            "id": "resp_123",
            "object": "response",
            "model": "gpt-4o-mini",
            "service_tier": "flex",
            "output": [],
            "usage": {
                "input_tokens": 300,
                "output_tokens": 40,
                "input_tokens_details": { "cached_tokens": 100 },
                "output_tokens_details": { "reasoning_tokens": 0 }
            }
        });
        let report = extract_usage(&body).unwrap();
        assert_eq!(report.usage, Usage::new(300, 100, 40));
        assert_eq!(report.service_tier.as_deref(), Some("flex"));
    }

    #[test]
    fn test_unknown_object_type() {
        let body = json!({
            "object": "list",
            "data": [],
            "usage": { "prompt_tokens": 5, "total_tokens": 5 }
        });
        assert!(extract_usage(&body).is_none());
    }

    #[test]
    fn test_missing_usage_section() {
        let body = json!({ "object": "chat.completion", "model": "gpt-4o" });
        assert!(extract_usage(&body).is_none());
    }

    #[test]
    fn test_inconsistent_counts_are_clamped() {
        let body = json!({
            "object": "chat.completion",
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": -4,
                "prompt_tokens_details": { "cached_tokens": 25 }
            }
        });
        let report = extract_usage(&body).unwrap();
        assert_eq!(report.usage, Usage::new(10, 10, 0));
    }

    #[test]
    fn test_wrong_field_types_yield_none() {
        let body = json!({
            "object": "chat.completion",
            "usage": { "prompt_tokens": "many" }
        });
        assert!(extract_usage(&body).is_none());
        assert!(extract_usage(&json!([1, 2, 3])).is_none());
    }

    #[test]
    fn test_extract_from_slice() {
        let bytes = br#"{"object":"response","usage":{"input_tokens":1,"output_tokens":2}}"#;
        assert_eq!(
            extract_usage_from_slice(bytes).unwrap().usage,
            Usage::new(1, 0, 2)
        );
        assert!(extract_usage_from_slice(b"not json").is_none());
    }
}

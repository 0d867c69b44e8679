//! Metered forwarding of every proxied request to the upstream API.
//!
//! JSON responses are buffered so their usage can be priced and debited before
//! the body goes back to the client. Everything else streams through untouched.

use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};

use super::error::ErrorResponse;
use crate::{
    AppState, config::UpstreamConfig, middleware::CallerIdentity, usage::extract_usage_from_slice,
};

const OPENAI_ORGANIZATION: HeaderName = HeaderName::from_static("openai-organization");
const OPENAI_PROJECT: HeaderName = HeaderName::from_static("openai-project");

/// Connection-scoped headers that never cross a proxy hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client-supplied routing metadata stripped before the upstream call.
const FORWARDING: [&str; 6] = [
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "forwarded",
    "x-real-ip",
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("request body exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = match &self {
            ProxyError::RequestTooLarge { .. } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid_request_error",
                "request_too_large",
            ),
            ProxyError::Upstream(_) => (StatusCode::BAD_GATEWAY, "server_error", "upstream_error"),
            ProxyError::ResponseTooLarge { .. } => (
                StatusCode::BAD_GATEWAY,
                "server_error",
                "upstream_response_too_large",
            ),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Proxy request failed");
        }
        (
            status,
            Json(ErrorResponse::with_type(error_type, code, self.to_string())),
        )
            .into_response()
    }
}

/// Build the outbound header set from the client's headers.
pub fn outbound_headers(incoming: &HeaderMap, upstream: &UpstreamConfig) -> HeaderMap {
    let mut headers = incoming.clone();
    for name in HOP_BY_HOP.iter().chain(FORWARDING.iter()) {
        headers.remove(*name);
    }
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    // Relay bytes as the upstream encodes them by default: never compressed
    headers.remove(header::ACCEPT_ENCODING);

    inject_default(&mut headers, OPENAI_ORGANIZATION, upstream.organization.as_deref());
    inject_default(&mut headers, OPENAI_PROJECT, upstream.project.as_deref());
    headers
}

fn inject_default(headers: &mut HeaderMap, name: HeaderName, value: Option<&str>) {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return;
    };
    if headers.contains_key(&name) {
        return;
    }
    match HeaderValue::try_from(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => tracing::warn!(header = %name, "Configured header value is invalid, skipping"),
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"))
}

/// Forward one request upstream, metering JSON responses.
#[tracing::instrument(
    name = "proxy.forward",
    skip_all,
    fields(method = %req.method(), path = %req.uri().path())
)]
pub async fn forward(State(state): State<AppState>, req: Request) -> Result<Response, ProxyError> {
    let identity = req
        .extensions()
        .get::<CallerIdentity>()
        .cloned()
        .unwrap_or_else(|| CallerIdentity::from_headers(req.headers()));

    let (parts, body) = req.into_parts();
    let limit = state.config.server.body_limit_bytes;
    let body = to_bytes(body, limit)
        .await
        .map_err(|_| ProxyError::RequestTooLarge { limit })?;

    let url = state
        .config
        .upstream
        .target_url(parts.uri.path(), parts.uri.query());
    let upstream_response = state
        .http_client
        .request(parts.method, url)
        .headers(outbound_headers(&parts.headers, &state.config.upstream))
        .body(body)
        .send()
        .await?;

    let status = upstream_response.status();
    let mut headers = upstream_response.headers().clone();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    if !is_json(&headers) {
        let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        return Ok(response);
    }

    let body = read_bounded(upstream_response, state.config.server.max_response_body_bytes).await?;
    meter(&state, &identity, &body).await;

    headers.remove(header::CONTENT_LENGTH);
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

async fn read_bounded(mut response: reqwest::Response, limit: usize) -> Result<Bytes, ProxyError> {
    if response
        .content_length()
        .is_some_and(|len| len > limit as u64)
    {
        return Err(ProxyError::ResponseTooLarge { limit });
    }

    let mut buf = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if buf.len() + chunk.len() > limit {
            return Err(ProxyError::ResponseTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Price the usage reported in a response body and debit the caller.
async fn meter(state: &AppState, identity: &CallerIdentity, body: &[u8]) {
    let Some(report) = extract_usage_from_slice(body) else {
        tracing::debug!("Response carries no usage");
        return;
    };

    let model = report.model.as_deref().unwrap_or_default();
    let cost = state
        .pricing
        .compute_cost(model, &report.usage, report.service_tier.as_deref());

    if !cost.is_priced() {
        tracing::warn!(model = %model, "No rate for model, request is free");
    }
    tracing::debug!(caller = %identity.masked, cost = %cost, "Priced response");

    if identity.is_anonymous() || !cost.total_cost.is_positive() {
        return;
    }
    if let Some(window) = state
        .limiter
        .add_cost_with_masked_key(&identity.key, &identity.masked, cost.total_cost)
        .await
    {
        tracing::debug!(
            caller = %identity.masked,
            spent = %window.spent,
            "Debited caller"
        );
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request as HttpRequest;
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::{
        identity::hash_identity,
        pricing::{ModelRate, Money, RateTriple, Tariff},
        routes::{build_proxy_router, test_support::test_state},
    };

    const API_KEY: &str = "Bearer sk-test-abcdefghijklmnop";

    fn gpt4o_tariff() -> Tariff {
        Tariff::builder()
            .model(
                "gpt-4o",
                ModelRate::new(
                    RateTriple::per_million(
                        "5.00".parse().unwrap(),
                        "2.50".parse().unwrap(),
                        "15.00".parse().unwrap(),
                    )
                    .unwrap(),
                ),
            )
            .build()
            .unwrap()
    }

    fn completion_body(prompt: i64, completion: i64) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4o-2024-08-06",
            "choices": [],
            "usage": { "prompt_tokens": prompt, "completion_tokens": completion }
        })
    }

    fn chat_request(auth: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri("/v1/chat/completions?trace=1")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "10.0.0.1")
            .header(header::ACCEPT_ENCODING, "gzip");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(r#"{"model":"gpt-4o"}"#)).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_and_meters_json() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(1000, 500)))
            .expect(1)
            .mount(&upstream)
            .await;

        let state = test_state(&upstream.uri(), Money::from_dollars(1.0));
        state.pricing.replace_tariff(gpt4o_tariff());

        let response = build_proxy_router(state.clone())
            .oneshot(chat_request(Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["usage"]["prompt_tokens"], 1000);

        // 1000 × $5/1M + 500 × $15/1M
        let spent = state.limiter.usage(&hash_identity(API_KEY)).spent;
        assert_eq!(spent, Money::from_dollars(0.0125));

        let received = upstream.received_requests().await.unwrap();
        let forwarded = &received[0];
        assert_eq!(forwarded.url.query(), Some("trace=1"));
        assert!(!forwarded.headers.contains_key("x-forwarded-for"));
        assert!(!forwarded.headers.contains_key("accept-encoding"));
        assert_eq!(forwarded.headers["authorization"], API_KEY);
        assert!(
            forwarded.headers["user-agent"]
                .to_str()
                .unwrap()
                .starts_with("tollgate/")
        );
        assert_eq!(forwarded.body, br#"{"model":"gpt-4o"}"#);
    }

    #[tokio::test]
    async fn test_overflowing_usage_charges_maximum() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body(1, 100_000_000_000_000)),
            )
            .mount(&upstream)
            .await;

        let state = test_state(&upstream.uri(), Money::from_dollars(1.0));
        state.pricing.replace_tariff(gpt4o_tariff());

        let response = build_proxy_router(state.clone())
            .oneshot(chat_request(Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let usage = state.limiter.usage(&hash_identity(API_KEY));
        assert_eq!(usage.spent, Money::MAX);
        assert!(!usage.allowed);
    }

    #[tokio::test]
    async fn test_over_limit_is_refused_before_upstream() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body(100_000, 50_000)),
            )
            .expect(1)
            .mount(&upstream)
            .await;

        let state = test_state(&upstream.uri(), Money::from_dollars(0.5));
        state.pricing.replace_tariff(gpt4o_tariff());
        let app = build_proxy_router(state.clone());

        // $0.50 + $0.75 = $1.25 puts the caller over
        let first = app.clone().oneshot(chat_request(Some(API_KEY))).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(chat_request(Some(API_KEY))).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["RateLimit-Limit"], "0.50");
        assert_eq!(second.headers()["RateLimit-Remaining"], "0");
        let retry: u64 = second.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry > 3500 && retry <= 3600);

        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "spend limit exceeded");
        assert_eq!(json["spent_this_window"], 1.25);
    }

    #[tokio::test]
    async fn test_anonymous_requests_are_not_metered() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(1000, 1000)))
            .expect(2)
            .mount(&upstream)
            .await;

        let state = test_state(&upstream.uri(), Money::ZERO);
        state.pricing.replace_tariff(gpt4o_tariff());
        let app = build_proxy_router(state.clone());

        for _ in 0..2 {
            let response = app.clone().oneshot(chat_request(None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(state.limiter.limiter().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_non_json_passes_through_unmetered() {
        let upstream = MockServer::start().await;
        let stream_body = "data: {\"usage\":{\"prompt_tokens\":1}}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(stream_body, "text/event-stream"))
            .mount(&upstream)
            .await;

        let state = test_state(&upstream.uri(), Money::from_dollars(1.0));
        state.pricing.replace_tariff(gpt4o_tariff());

        let response = build_proxy_router(state.clone())
            .oneshot(chat_request(Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, stream_body.as_bytes());
        assert_eq!(state.limiter.limiter().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_upstream_status_is_relayed() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "message": "not found", "type": "invalid_request_error" }
            })))
            .mount(&upstream)
            .await;

        let state = test_state(&upstream.uri(), Money::from_dollars(1.0));
        let request = HttpRequest::builder()
            .uri("/v1/models/missing")
            .header(header::AUTHORIZATION, API_KEY)
            .body(Body::empty())
            .unwrap();
        let response = build_proxy_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let state = test_state("http://127.0.0.1:1", Money::from_dollars(1.0));
        let response = build_proxy_router(state)
            .oneshot(chat_request(Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "server_error");
        assert_eq!(json["error"]["code"], "upstream_error");
    }

    #[tokio::test]
    async fn test_oversized_json_response_is_rejected() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(1, 1)))
            .mount(&upstream)
            .await;

        let mut state = test_state(&upstream.uri(), Money::from_dollars(1.0));
        let mut config = (*state.config).clone();
        config.server.max_response_body_bytes = 16;
        state.config = std::sync::Arc::new(config);

        let response = build_proxy_router(state)
            .oneshot(chat_request(Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_outbound_headers() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        incoming.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        incoming.insert("x-real-ip", HeaderValue::from_static("1.2.3.4"));
        incoming.insert("forwarded", HeaderValue::from_static("for=1.2.3.4"));
        incoming.insert("openai-project", HeaderValue::from_static("proj-client"));
        incoming.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));

        let upstream = UpstreamConfig {
            organization: Some("org-config".into()),
            project: Some("proj-config".into()),
            ..Default::default()
        };
        let headers = outbound_headers(&incoming, &upstream);

        assert!(!headers.contains_key(header::HOST));
        assert!(!headers.contains_key(header::CONNECTION));
        assert!(!headers.contains_key("x-real-ip"));
        assert!(!headers.contains_key("forwarded"));
        assert_eq!(headers["authorization"], "Bearer x");
        assert_eq!(headers["openai-organization"], "org-config");
        // Client value wins over configuration
        assert_eq!(headers["openai-project"], "proj-client");
    }
}

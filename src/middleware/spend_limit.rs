use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::{
    AppState,
    identity::{hash_identity, mask_identity},
    limiter::SpendDecision,
    pricing::Money,
};

const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Who is paying for a request: the hashed credential and its display form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub key: String,
    pub masked: String,
}

impl CallerIdentity {
    /// Identify the caller by its `Authorization` header; none means anonymous.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let raw = headers
            .get(header::AUTHORIZATION)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();
        Self {
            key: hash_identity(&raw),
            masked: mask_identity(&raw),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.key.is_empty()
    }
}

/// A request refused because its caller has spent the hourly allowance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendLimitExceeded {
    pub limit: Money,
    pub spent: Money,
    pub window_end: DateTime<Utc>,
    pub retry_after_secs: u64,
}

impl SpendLimitExceeded {
    pub fn new(decision: &SpendDecision, now: DateTime<Utc>) -> Self {
        Self {
            limit: decision.limit,
            spent: decision.spent,
            window_end: decision.window_end.unwrap_or(now),
            retry_after_secs: decision.retry_after_secs(now),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpendLimitBody {
    error: &'static str,
    limit_per_hour: f64,
    spent_this_window: f64,
    window_ends_at: String,
    retry_after_seconds: u64,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl IntoResponse for SpendLimitExceeded {
    fn into_response(self) -> Response {
        let body = SpendLimitBody {
            error: "spend limit exceeded",
            limit_per_hour: round_to(self.limit.to_dollars(), 2),
            spent_this_window: round_to(self.spent.to_dollars(), 4),
            window_ends_at: self
                .window_end
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            retry_after_seconds: self.retry_after_secs,
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        let retry_after = self.retry_after_secs.to_string();

        if let Ok(v) = HeaderValue::try_from(retry_after.as_str()) {
            headers.insert(header::RETRY_AFTER, v.clone());
            headers.insert(RATELIMIT_RESET, v);
        }
        if let Ok(v) = HeaderValue::try_from(format!("{:.2}", self.limit.to_dollars())) {
            headers.insert(RATELIMIT_LIMIT, v);
        }
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from_static("0"));

        response
    }
}

/// Refuse requests from callers over their hourly spend, before anything reaches upstream.
///
/// Admitted requests carry their [`CallerIdentity`] as a request extension.
pub async fn spend_limit_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let identity = CallerIdentity::from_headers(req.headers());
    if identity.is_anonymous() {
        tracing::warn!(
            path = %req.uri().path(),
            "No Authorization header provided, request is not metered"
        );
    }

    let now = Utc::now();
    let decision = state.limiter.limiter().allow_at(&identity.key, now);
    if !decision.allowed {
        tracing::info!(
            caller = %identity.masked,
            spent = %decision.spent,
            limit = %decision.limit,
            "Spend limit exceeded"
        );
        return SpendLimitExceeded::new(&decision, now).into_response();
    }

    req.extensions_mut().insert(identity);
    next.run(req).await
}

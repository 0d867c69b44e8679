//! Operator endpoints: spend inspection, limit changes and tariff reloads.

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::ErrorResponse;
use crate::{
    AppState,
    identity::{ANONYMOUS, hash_identity, mask_identity},
    limiter::UsageSnapshot,
    pricing::{Money, TariffError},
};

#[derive(Debug)]
pub enum AdminError {
    NotFound(String),
    BadRequest(String),
    Validation(String),
}

impl From<JsonRejection> for AdminError {
    fn from(rejection: JsonRejection) -> Self {
        AdminError::BadRequest(rejection.body_text())
    }
}

impl From<TariffError> for AdminError {
    fn from(err: TariffError) -> Self {
        AdminError::Validation(err.to_string())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AdminError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AdminError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AdminError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        };
        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}

/// Dollar figure for a limit, with the disabled sentinel shown as -1.
fn limit_usd(limit: Money) -> f64 {
    if limit.is_negative() {
        -1.0
    } else {
        limit.to_dollars()
    }
}

/// One caller's usage as reported by the admin API.
#[derive(Debug, Serialize, Deserialize)]
pub struct UsageEntry {
    pub key: String,
    pub spent_nanos: i64,
    pub spent_usd: f64,
    pub limit_nanos: i64,
    pub limit_usd: f64,
    pub remaining_nanos: i64,
    pub remaining_usd: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub allowed: bool,
}

impl From<UsageSnapshot> for UsageEntry {
    fn from(snapshot: UsageSnapshot) -> Self {
        Self {
            key: snapshot.key,
            spent_nanos: snapshot.spent.nanos(),
            spent_usd: snapshot.spent.to_dollars(),
            limit_nanos: snapshot.limit.nanos(),
            limit_usd: limit_usd(snapshot.limit),
            remaining_nanos: snapshot.remaining.nanos(),
            remaining_usd: limit_usd(snapshot.remaining),
            window_start: snapshot.window_start,
            window_end: snapshot.window_end,
            allowed: snapshot.allowed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub usage: Vec<UsageEntry>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    /// Raw credential, exactly as sent in the `Authorization` header.
    #[serde(default)]
    pub key: Option<String>,
}

/// Usage for every tracked caller, or for the one named by `?key=`.
#[tracing::instrument(name = "admin.usage", skip_all)]
pub async fn get_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Json<UsageResponse> {
    let usage: Vec<UsageEntry> = match query.key.as_deref().filter(|k| !k.is_empty()) {
        Some(raw) => {
            let mut snapshot = state.limiter.usage(&hash_identity(raw));
            snapshot.key = if raw == ANONYMOUS {
                ANONYMOUS.to_string()
            } else {
                mask_identity(raw)
            };
            vec![snapshot.into()]
        }
        None => state
            .limiter
            .usage_with_masked_keys()
            .await
            .into_iter()
            .map(UsageEntry::from)
            .collect(),
    };

    Json(UsageResponse {
        total: usage.len(),
        usage,
    })
}

#[derive(Debug, Deserialize)]
pub struct LimitUpdateRequest {
    pub limit_usd: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimitUpdateResponse {
    pub message: String,
    pub old_limit_usd: f64,
    pub new_limit_usd: f64,
}

/// Replace the hourly limit for all callers. Negative values disable limiting.
#[tracing::instrument(name = "admin.update_limit", skip_all)]
pub async fn update_limit(
    State(state): State<AppState>,
    body: Result<Json<LimitUpdateRequest>, JsonRejection>,
) -> Result<Json<LimitUpdateResponse>, AdminError> {
    let Json(request) = body?;
    let old = state
        .limiter
        .update_limit_from_decimal(request.limit_usd)
        .map_err(|e| AdminError::Validation(format!("limit_usd: {e}")))?;
    let new = state.limiter.limit();

    Ok(Json(LimitUpdateResponse {
        message: "Spending limit updated successfully".to_string(),
        old_limit_usd: limit_usd(old),
        new_limit_usd: limit_usd(new),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PricingReloadResponse {
    pub message: String,
    pub version: Option<String>,
    pub models: usize,
}

/// Re-read the tariff file and swap it in. Inline tariffs cannot be reloaded.
#[tracing::instrument(name = "admin.reload_pricing", skip_all)]
pub async fn reload_pricing(
    State(state): State<AppState>,
) -> Result<Json<PricingReloadResponse>, AdminError> {
    if state.config.pricing.file.is_none() {
        return Err(AdminError::NotFound(
            "pricing is configured inline; there is no tariff file to reload".to_string(),
        ));
    }

    let tariff = state.config.pricing.load().inspect_err(|e| {
        tracing::warn!(error = %e, "Tariff reload rejected, keeping current tariff");
    })?;
    let version = tariff.version().map(str::to_string);
    let models = tariff.len();
    state.pricing.replace_tariff(tariff);

    Ok(Json(PricingReloadResponse {
        message: "Pricing reloaded successfully".to_string(),
        version,
        models,
    }))
}

pub async fn not_found() -> AdminError {
    AdminError::NotFound("endpoint not found; available: /health, /usage, /limit, /pricing/reload".into())
}

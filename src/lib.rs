//! Spend-limiting reverse proxy for metered LLM APIs.
//!
//! Every caller, identified by its `Authorization` header, gets an hourly dollar
//! allowance. Responses are priced from the usage they report against a
//! configurable tariff, and callers over their allowance are refused with 429
//! until their window rolls over.

use std::sync::Arc;

pub mod config;
pub mod db;
pub mod identity;
pub mod jobs;
pub mod limiter;
pub mod middleware;
#[cfg(feature = "server")]
pub mod observability;
pub mod pricing;
pub mod routes;
pub mod usage;

/// Shared state for both listeners.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::GatewayConfig>,
    pub http_client: reqwest::Client,
    pub limiter: Arc<limiter::PersistentLimiter>,
    pub pricing: Arc<pricing::PricingEngine>,
}

impl AppState {
    pub fn new(
        config: config::GatewayConfig,
        limiter: Arc<limiter::PersistentLimiter>,
        pricing: Arc<pricing::PricingEngine>,
    ) -> Result<Self, reqwest::Error> {
        let http_client = config.server.http_client.build_client()?;
        Ok(Self {
            config: Arc::new(config),
            http_client,
            limiter,
            pricing,
        })
    }
}

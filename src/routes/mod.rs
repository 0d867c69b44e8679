pub mod admin;
mod error;
pub mod health;
pub mod proxy;

use axum::{
    Router,
    routing::{get, post, put},
};
pub use error::{ErrorInfo, ErrorResponse};
use tower_http::trace::TraceLayer;

use crate::{AppState, middleware::spend_limit_middleware};

/// The metered proxy: every path is gated by the spend limiter, then forwarded.
pub fn build_proxy_router(state: AppState) -> Router {
    let cors = state.config.server.cors.clone().into_layer();

    let mut app = Router::new()
        .fallback(proxy::forward)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            spend_limit_middleware,
        ))
        .with_state(state);

    // Outside the spend gate so preflights are never metered
    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    app.layer(TraceLayer::new_for_http())
}

pub fn build_admin_router(state: AppState) -> Router {
    let cors = state.config.server.cors.clone().into_layer();

    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/usage", get(admin::get_usage))
        .route("/limit", put(admin::update_limit))
        .route("/pricing/reload", post(admin::reload_pricing))
        .fallback(admin::not_found)
        .with_state(state);

    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    app.layer(TraceLayer::new_for_http())
}

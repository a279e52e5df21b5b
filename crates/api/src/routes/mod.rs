//! API routes

pub mod billing;
pub mod health;
pub mod hooks;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::{require_auth, require_internal_token},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (no auth required) - under /api/v1
    let mut public_api_routes = Router::new().route("/plans", get(billing::list_plans));

    // Stripe webhook (public, uses signature verification)
    if state.billing.is_some() {
        public_api_routes = public_api_routes.route("/billing/webhook", post(billing::webhook));
    }

    // Identity provider hooks (shared token)
    let hook_routes = Router::new()
        .route("/hooks/user-registered", post(hooks::user_registered))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_token,
        ));

    // Protected API routes (auth required) - under /api/v1
    let protected_api_routes = Router::new()
        .route("/billing/subscription", get(billing::get_subscription))
        .route("/billing/portal", post(billing::create_portal_session))
        .route("/billing/sync", post(billing::sync_subscription))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Combine API routes under /api/v1 prefix
    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(hook_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(cors_layer(state.config.cors_origin.as_deref()))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    match origin.and_then(|o| HeaderValue::from_str(o).ok()) {
        Some(origin) => layer.allow_origin(origin),
        None => layer.allow_origin(Any),
    }
}

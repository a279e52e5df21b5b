//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub billing: String,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = match state.store.ping().await {
        Ok(_) => "healthy".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Health check: database unreachable");
            "unhealthy".to_string()
        }
    };

    let overall_status = if db_status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        overall_status,
        Json(HealthResponse {
            status: if overall_status == StatusCode::OK {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status,
            billing: if state.billing.is_some() {
                "enabled".to_string()
            } else {
                "disabled".to_string()
            },
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe (checks if the service is ready to accept traffic)
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.store.ping().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use tracing::debug;

use crate::models::{HealthResponse, ReadyResponse};
use crate::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
        service: state.config.service_name.clone(),
    })
}

/// Readiness check endpoint
pub async fn ready_check(State(state): State<Arc<AppState>>) -> Json<ReadyResponse> {
    debug!("Readiness check requested");
    let persistence = state.backend.is_some();
    let message = if persistence {
        "Service is ready".to_string()
    } else {
        "Service is ready (no note backend configured, nothing will be persisted)".to_string()
    };
    Json(ReadyResponse {
        status: "ok".to_string(),
        message,
        persistence,
    })
}

//! Health check endpoint.

use axum::{Json, extract::State, http::StatusCode};
use mobmind_core::health::HealthStatus;
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub message: String,
    pub models_loaded: usize,
    pub avg_latency_ms: f64,
    pub fallback_level: u8,
    pub fallback_level_name: String,
    pub cache_healthy: Option<bool>,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Health check endpoint; 503 unless healthy
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let engine = state.engine.health();
    let level = state.fallback.current_level();
    let cache_healthy = state.cache.as_ref().map(|c| c.health_check());

    let mut status = engine.status;
    let mut message = engine.message;
    if cache_healthy == Some(false) && status < HealthStatus::Degraded {
        status = HealthStatus::Degraded;
        message = "Action cache unavailable".to_string();
    }

    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status,
            message,
            models_loaded: engine.models_loaded,
            avg_latency_ms: engine.avg_latency_ms,
            fallback_level: level.value(),
            fallback_level_name: level.name().to_string(),
            cache_healthy,
            uptime_seconds: state.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

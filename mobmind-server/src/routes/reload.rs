//! Hot model reload.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::state::AppState;

/// Create reload router
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/reload/{archetype}/{model_type}", post(reload_model))
}

/// Optional body; without it the configured artifact path is used. An
/// explicit path is resolved against the model directory and must stay in it.
#[derive(Debug, Default, Deserialize)]
pub struct ReloadRequest {
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub success: bool,
    pub message: String,
    pub archetype: String,
    pub model_type: String,
    pub timestamp: String,
}

/// Load or replace one model while the service keeps running.
///
/// A failed load leaves the previous model serving.
pub async fn reload_model(
    State(state): State<Arc<AppState>>,
    Path((archetype, model_type)): Path<(String, String)>,
    body: Bytes,
) -> (StatusCode, Json<ReloadResponse>) {
    let reply = |status: StatusCode, success: bool, message: String| {
        (
            status,
            Json(ReloadResponse {
                success,
                message,
                archetype: archetype.clone(),
                model_type: model_type.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            }),
        )
    };

    let request: ReloadRequest = if body.is_empty() {
        ReloadRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return reply(
                    StatusCode::BAD_REQUEST,
                    false,
                    format!("Invalid request body: {e}"),
                );
            }
        }
    };

    info!(%archetype, %model_type, path = ?request.model_path, "Reload requested");

    match state
        .engine
        .reload_model(&archetype, &model_type, request.model_path)
        .await
    {
        Ok(model) => {
            // A working model ends any pin set when nothing could be loaded
            state.fallback.release_forced();
            reply(
                StatusCode::OK,
                true,
                format!("Model {}/{} loaded from {}", archetype, model_type, model.path),
            )
        }
        Err(e) => {
            error!(%archetype, %model_type, error = %e, "Model reload failed");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                false,
                format!("Reload failed: {e}"),
            )
        }
    }
}

//! Loaded model listing.

use axum::{Json, extract::State};
use mobmind_core::engine::ModelInfo;
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct ModelsResponse {
    pub count: usize,
    pub models: Vec<ModelInfo>,
}

/// List loaded models
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let models = state.engine.loaded_models();
    Json(ModelsResponse {
        count: models.len(),
        models,
    })
}

//! Service statistics snapshot.

use axum::{Json, extract::State};
use mobmind_core::OrchestratorCounters;
use mobmind_core::cache::CacheStats;
use mobmind_core::engine::EngineStats;
use mobmind_core::fallback::FallbackStats;
use mobmind_core::metrics::MetricsSnapshot;
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct StatsResponse {
    pub inference: EngineStats,
    pub cache: Option<CacheStats>,
    pub fallback: FallbackStats,
    pub orchestrator: OrchestratorCounters,
    pub metrics: MetricsSnapshot,
    pub uptime_seconds: f64,
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        inference: state.engine.statistics(),
        cache: state.cache.as_ref().map(|c| c.stats()),
        fallback: state.fallback.statistics(),
        orchestrator: state.counters.borrow().clone(),
        metrics: state.metrics.snapshot(),
        uptime_seconds: state.metrics.uptime_seconds(),
    })
}

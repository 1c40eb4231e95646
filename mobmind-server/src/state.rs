//! Application state shared with the HTTP handlers.

use mobmind_core::OrchestratorCounters;
use mobmind_core::cache::ActionCache;
use mobmind_core::engine::InferenceEngine;
use mobmind_core::fallback::FallbackControl;
use mobmind_core::metrics::Metrics;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Shared application state.
///
/// Handlers never touch the orchestrator itself; they see the internally
/// synchronized collaborators plus the counters it publishes.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn InferenceEngine>,
    pub fallback: Arc<dyn FallbackControl>,
    pub cache: Option<Arc<dyn ActionCache>>,
    pub metrics: Arc<Metrics>,
    /// Latest orchestrator counters
    pub counters: watch::Receiver<OrchestratorCounters>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        fallback: Arc<dyn FallbackControl>,
        cache: Option<Arc<dyn ActionCache>>,
        metrics: Arc<Metrics>,
        counters: watch::Receiver<OrchestratorCounters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            fallback,
            cache,
            metrics,
            counters,
            start_time: Instant::now(),
        })
    }
}

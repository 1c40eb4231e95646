//! HTTP control plane routes.

pub mod health;
pub mod models;
pub mod reload;
pub mod stats;

use axum::{Router, routing::get};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the control plane router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/models", get(models::list_models))
        .route("/stats", get(stats::get_stats))
        .merge(reload::router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use mobmind_core::OrchestratorCounters;
    use mobmind_core::cache::MemoryCache;
    use mobmind_core::config::ServiceConfig;
    use mobmind_core::engine::PolicyEngine;
    use mobmind_core::fallback::FallbackHandler;
    use mobmind_core::metrics::Metrics;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use super::create_router;
    use crate::state::AppState;

    /// Two-action policy over a four-value state
    pub const POLICY_JSON: &str =
        r#"{"input_dim": 4, "weights": [[1, 0, 0, 0], [0, 1, 0, 0]], "bias": [0, 0]}"#;

    pub fn write_policy(dir: &Path, archetype: &str, model_type: &str) {
        let archetype_dir = dir.join(archetype);
        std::fs::create_dir_all(&archetype_dir).unwrap();
        std::fs::write(archetype_dir.join(format!("{model_type}.json")), POLICY_JSON).unwrap();
    }

    pub struct TestApp {
        pub dir: TempDir,
        pub state: Arc<AppState>,
        pub fallback: Arc<FallbackHandler>,
        pub counters: watch::Sender<OrchestratorCounters>,
    }

    impl TestApp {
        /// App over an empty model directory
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = ServiceConfig::default();
            config.models.directory = dir.path().to_path_buf();
            config.models.archetypes = vec!["aggressive".to_string()];
            config.models.types = vec!["combat_dqn".to_string()];

            let engine = Arc::new(PolicyEngine::new(&config.models, "combat_dqn"));
            let fallback = Arc::new(FallbackHandler::new(config.fallback.clone()));
            let cache = Arc::new(MemoryCache::new(&config.cache));
            let (counters, rx) = watch::channel(OrchestratorCounters::default());

            let state = AppState::new(
                engine,
                fallback.clone(),
                Some(cache),
                Arc::new(Metrics::new()),
                rx,
            );
            Self {
                dir,
                state,
                fallback,
                counters,
            }
        }

        /// Send one request and decode the JSON reply
        pub async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
            let response = create_router(self.state.clone())
                .oneshot(request)
                .await
                .unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, serde_json::from_slice(&bytes).unwrap())
        }

        pub async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
            self.send(Request::get(uri).body(Body::empty()).unwrap())
                .await
        }
    }
}

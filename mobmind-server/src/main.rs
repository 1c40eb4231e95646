//! mobmind-server - monster AI inference service
//!
//! Runs the batch orchestrator over the SQLite request queue and serves the
//! hot-reload control plane over HTTP.

use anyhow::Context;
use mobmind_core::cache::{ActionCache, MemoryCache};
use mobmind_core::engine::{InferenceEngine, PolicyEngine};
use mobmind_core::fallback::{FallbackControl, FallbackHandler, FallbackLevel};
use mobmind_core::graph::{GraphManager, SqliteGraph};
use mobmind_core::health::HealthMonitor;
use mobmind_core::metrics::{self, Metrics};
use mobmind_core::queue::SqliteQueue;
use mobmind_core::signal::SignalCoordinator;
use mobmind_core::{BatchOrchestrator, Collaborators};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod routes;
mod state;

const DEFAULT_LOG_FILTER: &str = "mobmind_server=info,mobmind_core=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded = config::load()?;
    init_logging(loaded.service.logging.json)?;

    info!("mobmind-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Config loaded from {:?}", loaded.path);
    let config = loaded.service;

    let queue = SqliteQueue::open(&config.database.path, config.inference.poll_interval())
        .with_context(|| format!("Failed to open queue database {}", config.database.path.display()))?;
    let queue = Arc::new(queue);
    info!(path = %config.database.path.display(), "Queue database ready");

    let mut engine = PolicyEngine::new(&config.models, config.inference.primary_model.clone());
    if config.pack_coordination.enabled {
        engine = engine.with_coordination(Arc::new(SignalCoordinator::new(
            config.pack_coordination.signal_range,
            config.pack_coordination.signal_ttl,
        )));
    }
    let engine: Arc<dyn InferenceEngine> = Arc::new(engine);

    let fallback: Arc<dyn FallbackControl> = Arc::new(FallbackHandler::new(config.fallback.clone()));
    let metrics = Arc::new(Metrics::new());

    let (loaded_models, expected) = engine.load_all().await;
    if loaded_models == 0 {
        warn!("No models available, serving traditional AI until a model is reloaded");
        fallback.force_level(FallbackLevel::Traditional);
    } else if loaded_models < expected {
        warn!(loaded_models, expected, "Running with a partial model set");
    }
    metrics.set_gauge(
        metrics::FALLBACK_LEVEL,
        &[],
        f64::from(fallback.current_level().value()),
    );

    let cache: Option<Arc<dyn ActionCache>> = config
        .cache
        .enabled
        .then(|| Arc::new(MemoryCache::new(&config.cache)) as Arc<dyn ActionCache>);
    let graph: Option<Arc<dyn GraphManager>> = if config.graph.enabled {
        match SqliteGraph::open(&config.database.path) {
            Ok(graph) => Some(Arc::new(graph) as Arc<dyn GraphManager>),
            Err(e) => {
                warn!(error = %e, "Relationship graph unavailable, every monster is processed solo");
                None
            }
        }
    } else {
        None
    };

    let mut orchestrator = BatchOrchestrator::new(
        config.clone(),
        Collaborators {
            queue,
            engine: engine.clone(),
            fallback: fallback.clone(),
            cache: cache.clone(),
            graph,
            health: Some(Arc::new(HealthMonitor::default())),
            metrics: metrics.clone(),
        },
    );

    let state = state::AppState::new(engine, fallback, cache, metrics, orchestrator.subscribe());
    let app = routes::create_router(state);

    let addr = format!("{}:{}", config.http_server.host, config.http_server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind control plane on {addr}"))?;
    info!(%addr, "Control plane listening");

    let (http_stop_tx, http_stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_stop_rx.await;
            })
            .await
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(async move {
        orchestrator.run(shutdown_rx).await;
        orchestrator.shutdown().await;
    });

    info!("Service ready");
    shutdown_signal().await;
    info!("Shutting down...");

    // The in-flight tick finishes and the orchestrator closes its collaborators
    // before the listener stops.
    let _ = shutdown_tx.send(true);
    worker.await.context("Orchestrator task failed")?;
    let _ = http_stop_tx.send(());
    server.await.context("Control plane task failed")??;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

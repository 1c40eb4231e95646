//! Batch orchestrator: the tick loop composing every collaborator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   poll    ┌───────────────────────────────────────────┐
//! │   Request    │ ────────→ │            BatchOrchestrator              │
//! │  Processor   │ ←──────── │  cache → fallback → engine (solo)         │
//! └──────────────┘  write    │  graph → engine.infer_pack (packs)        │
//!                            │  maintenance: cleanup / health / metrics  │
//!                            └───────────────────────────────────────────┘
//! ```
//!
//! Each tick polls one batch, answers every request exactly once and writes
//! the whole response set back. The orchestrator owns its counters; shared
//! collaborators are internally synchronized.

mod maintenance;
mod packs;

#[cfg(test)]
mod fakes;

pub use maintenance::CleanupReport;
pub use packs::PackAssignment;

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{ActionCache, CachedAction};
use crate::config::ServiceConfig;
use crate::engine::InferenceEngine;
use crate::error::{Error, Result};
use crate::fallback::{FallbackControl, FallbackLevel};
use crate::graph::{GraphManager, SpatialUpdate};
use crate::health::HealthMonitor;
use crate::metrics::{self, Metrics};
use crate::queue::RequestProcessor;
use crate::types::{
    ACTION_DEFER, ActionType, CACHE_HIT_LATENCY_MS, FALLBACK_ACTION_LATENCY_MS, InferenceRequest,
    InferenceResponse, MAX_FALLBACK_LEVEL, MODEL_CONFIDENCE,
};

use maintenance::MaintenanceClock;

/// Pause after a failed tick
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Confidence for fallback-handler decisions other than defer
const FALLBACK_CONFIDENCE: f32 = 0.5;

/// Shared collaborators handed to the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub queue: Arc<dyn RequestProcessor>,
    pub engine: Arc<dyn InferenceEngine>,
    pub fallback: Arc<dyn FallbackControl>,
    pub cache: Option<Arc<dyn ActionCache>>,
    pub graph: Option<Arc<dyn GraphManager>>,
    pub health: Option<Arc<HealthMonitor>>,
    pub metrics: Arc<Metrics>,
}

/// Running totals, published after every batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorCounters {
    pub requests_processed: u64,
    pub batch_count: u64,
    pub cache_hits: u64,
    pub fallback_responses: u64,
    pub error_fallbacks: u64,
    pub coordinated_responses: u64,
    pub tick_errors: u64,
    pub last_batch_size: usize,
    pub last_batch_ms: f64,
}

impl OrchestratorCounters {
    fn record_batch(&mut self, responses: &[InferenceResponse], elapsed_ms: f64) {
        self.requests_processed += responses.len() as u64;
        self.batch_count += 1;
        self.last_batch_size = responses.len();
        self.last_batch_ms = elapsed_ms;
        for response in responses {
            if response.cache_used {
                self.cache_hits += 1;
            }
            match response.action_type {
                ActionType::Fallback => self.fallback_responses += 1,
                ActionType::ErrorFallback => self.error_fallbacks += 1,
                ActionType::Coordinated => self.coordinated_responses += 1,
                ActionType::Combat => {}
            }
        }
    }
}

/// Run `fut` with an upper bound; a timeout becomes [`Error::Timeout`]
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, limit.as_millis() as u64)),
    }
}

/// Tick loop over the request queue.
pub struct BatchOrchestrator {
    config: ServiceConfig,
    queue: Arc<dyn RequestProcessor>,
    engine: Arc<dyn InferenceEngine>,
    fallback: Arc<dyn FallbackControl>,
    cache: Option<Arc<dyn ActionCache>>,
    graph: Option<Arc<dyn GraphManager>>,
    health: Option<Arc<HealthMonitor>>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    counters: OrchestratorCounters,
    counters_tx: watch::Sender<OrchestratorCounters>,
    clock: MaintenanceClock,
}

impl BatchOrchestrator {
    pub fn new(config: ServiceConfig, collaborators: Collaborators) -> Self {
        let (counters_tx, _) = watch::channel(OrchestratorCounters::default());
        let timeout = config.inference.collaborator_timeout();
        let cache = collaborators.cache.filter(|_| config.cache.enabled);
        let graph = collaborators.graph.filter(|_| config.graph.enabled);

        Self {
            config,
            queue: collaborators.queue,
            engine: collaborators.engine,
            fallback: collaborators.fallback,
            cache,
            graph,
            health: collaborators.health,
            metrics: collaborators.metrics,
            timeout,
            counters: OrchestratorCounters::default(),
            counters_tx,
            clock: MaintenanceClock::new(),
        }
    }

    /// Watch the counters published after each batch
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorCounters> {
        self.counters_tx.subscribe()
    }

    pub fn counters(&self) -> &OrchestratorCounters {
        &self.counters
    }

    /// Repeat ticks until `shutdown` turns true.
    ///
    /// The in-flight tick always completes; failed ticks back off for a second.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.inference.batch_size,
            pack_coordination = self.config.pack_coordination.enabled,
            "Starting batch loop"
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.run_tick().await {
                error!(error = %e, "Batch tick failed");
                self.counters.tick_errors += 1;
                self.publish();
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("Batch loop stopped");
    }

    /// Poll, answer and write back one batch, then run due maintenance.
    ///
    /// Returns the number of requests answered. Only a failed response write
    /// is an error.
    pub async fn run_tick(&mut self) -> Result<usize> {
        let batch_size = self.config.inference.batch_size;
        let requests = match with_timeout(
            self.timeout,
            "queue.poll_requests",
            self.queue.poll_requests(batch_size),
        )
        .await
        {
            Ok(requests) => requests,
            Err(e) => {
                warn!(error = %e, "Polling requests failed");
                Vec::new()
            }
        };

        if requests.is_empty() {
            tokio::time::sleep(self.queue.poll_interval()).await;
            self.run_maintenance().await;
            return Ok(0);
        }

        let start = Instant::now();
        let responses = if self.config.pack_coordination.enabled && requests.len() > 1 {
            self.process_batch_with_coordination(&requests).await
        } else {
            self.process_batch(&requests).await
        };

        if let Err(e) = with_timeout(
            self.timeout,
            "queue.write_responses",
            self.queue.write_responses(&responses),
        )
        .await
        {
            self.release_batch(&requests).await;
            return Err(e);
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.counters.record_batch(&responses, elapsed_ms);
        self.record_metrics(&requests, &responses);
        self.publish();
        debug!(
            batch = self.counters.batch_count,
            size = responses.len(),
            elapsed_ms,
            "Batch written"
        );

        self.run_maintenance().await;
        Ok(responses.len())
    }

    /// Hand an unwritten batch back to the queue. Claims that cannot be
    /// released here are recovered by stale-claim cleanup.
    async fn release_batch(&self, requests: &[InferenceRequest]) {
        let ids: Vec<i64> = requests.iter().map(|r| r.request_id).collect();
        match with_timeout(
            self.timeout,
            "queue.release_requests",
            self.queue.release_requests(&ids),
        )
        .await
        {
            Ok(released) => warn!(released, "Response write failed, batch returned to the queue"),
            Err(e) => error!(count = ids.len(), error = %e, "Failed to release unwritten batch"),
        }
    }

    /// Answer a batch without pack coordination. One response per request,
    /// in input order.
    pub async fn process_batch(&self, requests: &[InferenceRequest]) -> Vec<InferenceResponse> {
        let refs: Vec<&InferenceRequest> = requests.iter().collect();
        self.solo_responses(&refs).await
    }

    async fn solo_responses(&self, requests: &[&InferenceRequest]) -> Vec<InferenceResponse> {
        let level = self.fallback.current_level();
        let mut responses: Vec<Option<InferenceResponse>> = vec![None; requests.len()];
        let mut misses: Vec<usize> = Vec::with_capacity(requests.len());

        for (idx, request) in requests.iter().enumerate() {
            match self.cache_lookup(request).await {
                Some(hit) => {
                    let mut response = InferenceResponse::for_request(
                        request,
                        ActionType::Combat,
                        hit.action_id,
                        hit.confidence,
                        level.value(),
                    )
                    .with_latency(CACHE_HIT_LATENCY_MS);
                    response.cache_used = true;
                    responses[idx] = Some(response);
                }
                None => misses.push(idx),
            }
        }

        if !misses.is_empty() {
            if self.fallback.should_use_fallback_action() {
                for &idx in &misses {
                    responses[idx] = Some(self.fallback_response(requests[idx], level));
                }
            } else {
                let batch: Vec<&InferenceRequest> = misses.iter().map(|&i| requests[i]).collect();
                for (idx, response) in misses.iter().zip(self.infer_misses(&batch, level).await) {
                    responses[*idx] = Some(response);
                }
            }
        }

        self.push_spatial(requests).await;
        responses.into_iter().flatten().collect()
    }

    async fn cache_lookup(&self, request: &InferenceRequest) -> Option<CachedAction> {
        let cache = self.cache.as_ref()?;
        match with_timeout(
            self.timeout,
            "cache.lookup",
            cache.lookup(request.monster_id, &request.state_vector),
        )
        .await
        {
            Ok(hit) => hit,
            Err(e) => {
                warn!(monster_id = request.monster_id, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    fn fallback_response(&self, request: &InferenceRequest, level: FallbackLevel) -> InferenceResponse {
        let action = self
            .fallback
            .action_for_level(&request.state_vector)
            .unwrap_or(ACTION_DEFER);
        let confidence = if action == ACTION_DEFER {
            0.0
        } else {
            FALLBACK_CONFIDENCE
        };
        InferenceResponse::for_request(request, ActionType::Fallback, action, confidence, level.value())
            .with_latency(FALLBACK_ACTION_LATENCY_MS)
    }

    /// One engine call for every cache miss
    async fn infer_misses(
        &self,
        batch: &[&InferenceRequest],
        level: FallbackLevel,
    ) -> Vec<InferenceResponse> {
        let model = &self.config.inference.primary_model;
        let start = Instant::now();
        let result = with_timeout(
            self.timeout,
            "engine.infer_batch",
            self.engine.infer_batch(batch, model),
        )
        .await
        .and_then(|actions| {
            if actions.len() == batch.len() {
                Ok(actions)
            } else {
                Err(Error::Inference(format!(
                    "engine returned {} actions for {} requests",
                    actions.len(),
                    batch.len()
                )))
            }
        });

        let actions = match result {
            Ok(actions) => actions,
            Err(e) => {
                error!(count = batch.len(), error = %e, "Inference failed, deferring batch to traditional AI");
                self.fallback.handle_error(&e, "solo batch inference");
                return batch.iter().map(|r| error_fallback(r)).collect();
            }
        };

        let avg_latency_ms = start.elapsed().as_secs_f64() * 1000.0 / batch.len() as f64;
        self.report_latency(avg_latency_ms);

        let mut responses = Vec::with_capacity(batch.len());
        for (request, &action) in batch.iter().zip(&actions) {
            self.cache_store(request, action).await;

            let mut response = InferenceResponse::for_request(
                request,
                ActionType::Combat,
                action,
                MODEL_CONFIDENCE,
                level.value(),
            )
            .with_latency(avg_latency_ms)
            .with_output(model.as_str(), action);
            response
                .fusion_weights
                .insert(model.clone(), Value::from(1.0));
            responses.push(response);
        }
        responses
    }

    /// Feed a successful inference's per-request latency to the fallback handler
    fn report_latency(&self, avg_latency_ms: f64) {
        if avg_latency_ms > self.config.inference.max_latency_ms {
            self.fallback.handle_latency_violation(avg_latency_ms);
        } else {
            self.fallback.record_success(avg_latency_ms);
        }
    }

    async fn cache_store(&self, request: &InferenceRequest, action_id: u8) {
        let Some(cache) = &self.cache else {
            return;
        };
        let entry = CachedAction {
            action_id,
            confidence: MODEL_CONFIDENCE,
        };
        if let Err(e) = with_timeout(
            self.timeout,
            "cache.store",
            cache.store(request.monster_id, &request.state_vector, entry),
        )
        .await
        {
            debug!(monster_id = request.monster_id, error = %e, "Cache store failed");
        }
    }

    /// Best-effort spatial updates into the graph
    async fn push_spatial(&self, requests: &[&InferenceRequest]) {
        if !self.config.graph.spatial_enabled() {
            return;
        }
        let Some(graph) = &self.graph else {
            return;
        };

        for request in requests {
            let update = SpatialUpdate {
                position: request.position(),
                map_id: request.map_id,
                hp_ratio: request.hp_ratio,
            };
            if let Err(e) = with_timeout(
                self.timeout,
                "graph.update_spatial",
                graph.update_spatial(request.monster_id, update),
            )
            .await
            {
                debug!(monster_id = request.monster_id, error = %e, "Spatial update failed");
            }
        }
    }

    fn record_metrics(&self, requests: &[InferenceRequest], responses: &[InferenceResponse]) {
        let model = self.config.inference.primary_model.as_str();
        self.metrics.increment(metrics::BATCHES_TOTAL, &[], 1.0);
        for (request, response) in requests.iter().zip(responses) {
            let cache_status = if response.cache_used { "hit" } else { "miss" };
            let labels = [
                ("archetype", request.archetype.as_str()),
                ("model_type", model),
                ("cache", cache_status),
                ("action_type", response.action_type.as_str()),
            ];
            self.metrics.increment(metrics::REQUESTS_TOTAL, &labels, 1.0);
            self.metrics
                .increment(metrics::REQUEST_LATENCY_MS, &labels[..3], response.latency_ms());
        }
    }

    fn publish(&self) {
        self.counters_tx.send_replace(self.counters.clone());
    }

    /// Log final statistics and close the queue, cache and model runtime
    pub async fn shutdown(&self) {
        let engine = self.engine.statistics();
        let fallback = self.fallback.statistics();
        let cache_hit_rate = self.cache.as_ref().map(|c| c.stats().hit_rate).unwrap_or(0.0);

        info!(
            requests_processed = self.counters.requests_processed,
            batches = self.counters.batch_count,
            avg_latency_ms = engine.avg_latency_ms,
            cache_hit_rate,
            fallback_level = fallback.current_level,
            fallback_level_name = %fallback.current_level_name,
            error_fallbacks = self.counters.error_fallbacks,
            "Final statistics"
        );

        self.queue.close().await;
        if let Some(cache) = &self.cache {
            cache.close().await;
        }
        self.engine.unload_all().await;
        info!("Orchestrator shut down");
    }
}

/// Sentinel response routing a request to traditional AI after a failure
fn error_fallback(request: &InferenceRequest) -> InferenceResponse {
    InferenceResponse::for_request(
        request,
        ActionType::ErrorFallback,
        ACTION_DEFER,
        0.0,
        MAX_FALLBACK_LEVEL,
    )
    .with_latency(0.0)
}

//! In-memory collaborators for orchestrator tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use tempfile::TempDir;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BatchOrchestrator, Collaborators};
use crate::cache::{ActionCache, CacheStats, CachedAction, MemoryCache};
use crate::config::ServiceConfig;
use crate::engine::{CoordinatedAction, EngineHealth, EngineStats, InferenceEngine, ModelInfo, PackMonster};
use crate::error::{Error, Result};
use crate::fallback::FallbackHandler;
use crate::graph::{GraphManager, PackRole, SpatialUpdate, SqliteGraph, TeamMembership, ThreatEdge};
use crate::health::{HealthMonitor, HealthStatus};
use crate::metrics::Metrics;
use crate::queue::{RequestProcessor, SqliteQueue};
use crate::types::{InferenceRequest, InferenceResponse};

/// Action the fake engine answers when nothing is scripted
pub(crate) const DEFAULT_ACTION: u8 = 1;

/// Action the fake engine answers for every pack member
pub(crate) const PACK_ACTION: u8 = 7;

pub(crate) fn request(request_id: i64, monster_id: i64) -> InferenceRequest {
    InferenceRequest {
        request_id,
        monster_id,
        state_vector: vec![0.5; 8],
        archetype: "aggressive".to_string(),
        position_x: 10,
        position_y: 12,
        map_id: 1,
        hp_ratio: 1.0,
        sp_ratio: 1.0,
        priority: 0,
    }
}

#[derive(Default)]
pub(crate) struct FakeQueue {
    batches: Mutex<VecDeque<Vec<InferenceRequest>>>,
    written: Mutex<Vec<Vec<InferenceResponse>>>,
    released: Mutex<Vec<i64>>,
    pub fail_polls: AtomicBool,
    pub fail_writes: AtomicBool,
    pub closed: AtomicBool,
    pub cleanups: AtomicUsize,
}

impl FakeQueue {
    pub fn push_batch(&self, batch: Vec<InferenceRequest>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    pub fn written(&self) -> Vec<Vec<InferenceResponse>> {
        self.written.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<i64> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequestProcessor for FakeQueue {
    async fn poll_requests(&self, max_batch: usize) -> Result<Vec<InferenceRequest>> {
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(Error::Queue("poll refused".to_string()));
        }
        let mut batch = self.batches.lock().unwrap().pop_front().unwrap_or_default();
        batch.truncate(max_batch);
        Ok(batch)
    }

    async fn write_responses(&self, responses: &[InferenceResponse]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Queue("write refused".to_string()));
        }
        self.written.lock().unwrap().push(responses.to_vec());
        Ok(())
    }

    async fn cleanup_old_requests(&self, _hours: u32) -> Result<usize> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(2)
    }

    async fn cleanup_old_responses(&self, _hours: u32) -> Result<usize> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(3)
    }

    async fn release_requests(&self, request_ids: &[i64]) -> Result<usize> {
        self.released.lock().unwrap().extend_from_slice(request_ids);
        Ok(request_ids.len())
    }

    async fn reclaim_stale(&self, _older_than: Duration) -> Result<usize> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(4)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeEngine {
    script: Mutex<VecDeque<std::result::Result<Vec<u8>, String>>>,
    batch_sizes: Mutex<Vec<usize>>,
    pack_calls: Mutex<Vec<(i64, usize)>>,
    failing_packs: Mutex<HashSet<i64>>,
    pub infer_calls: AtomicUsize,
    pub pack_delay_ms: AtomicU64,
    pub hang: AtomicBool,
    pub no_coordination: AtomicBool,
    pub unloaded: AtomicBool,
}

impl FakeEngine {
    /// Queue the outcome of the next `infer_batch` call
    pub fn script(&self, outcome: std::result::Result<Vec<u8>, &str>) {
        self.script
            .lock()
            .unwrap()
            .push_back(outcome.map_err(str::to_string));
    }

    pub fn fail_pack(&self, pack_id: i64) {
        self.failing_packs.lock().unwrap().insert(pack_id);
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    /// `(pack_id, member count)` per `infer_pack` call
    pub fn pack_calls(&self) -> Vec<(i64, usize)> {
        self.pack_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceEngine for FakeEngine {
    async fn infer_batch(&self, requests: &[&InferenceRequest], _model_type: &str) -> Result<Vec<u8>> {
        self.infer_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(requests.len());
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(actions)) => Ok(actions),
            Some(Err(message)) => Err(Error::Inference(message)),
            None => Ok(vec![DEFAULT_ACTION; requests.len()]),
        }
    }

    async fn infer_pack(
        &self,
        pack_id: i64,
        members: &[PackMonster],
        _coordination_threshold: f32,
    ) -> Result<Vec<CoordinatedAction>> {
        self.pack_calls.lock().unwrap().push((pack_id, members.len()));
        let delay = self.pack_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing_packs.lock().unwrap().contains(&pack_id) {
            return Err(Error::Inference(format!("pack {pack_id} failed")));
        }
        Ok(members
            .iter()
            .map(|m| CoordinatedAction {
                monster_id: m.monster_id,
                action_id: PACK_ACTION,
                coordinated: true,
                pack_role: if m.monster_id == pack_id {
                    PackRole::Leader
                } else {
                    PackRole::Follower
                },
                coordination_bonus: 0.4,
                coordination_action: Some("attack_target".to_string()),
            })
            .collect())
    }

    fn supports_coordination(&self) -> bool {
        !self.no_coordination.load(Ordering::SeqCst)
    }

    async fn reload_model(
        &self,
        archetype: &str,
        model_type: &str,
        _path: Option<PathBuf>,
    ) -> Result<ModelInfo> {
        Err(Error::ModelNotFound {
            archetype: archetype.to_string(),
            model_type: model_type.to_string(),
        })
    }

    async fn load_all(&self) -> (usize, usize) {
        (0, 0)
    }

    fn loaded_models(&self) -> Vec<ModelInfo> {
        Vec::new()
    }

    fn statistics(&self) -> EngineStats {
        EngineStats {
            models_loaded: 0,
            total_inferences: self.infer_calls.load(Ordering::SeqCst) as u64,
            avg_latency_ms: 0.0,
            model_latencies: Default::default(),
            coordination_enabled: self.supports_coordination(),
            signals: None,
        }
    }

    fn health(&self) -> EngineHealth {
        EngineHealth {
            status: HealthStatus::Healthy,
            message: "fake".to_string(),
            models_loaded: 0,
            avg_latency_ms: 0.0,
            inference_count: 0,
        }
    }

    async fn unload_all(&self) {
        self.unloaded.store(true, Ordering::SeqCst);
    }

    fn cleanup_signals(&self) -> usize {
        1
    }
}

#[derive(Default)]
pub(crate) struct FakeGraph {
    memberships: Mutex<HashMap<i64, TeamMembership>>,
    failing: Mutex<HashSet<i64>>,
    threats: Mutex<HashMap<i64, usize>>,
    spatial: Mutex<Vec<i64>>,
}

impl FakeGraph {
    /// Register `monster_id` under `leader_id`; `None` leaves it leaderless
    pub fn set_leader(&self, monster_id: i64, leader_id: Option<i64>) {
        let role = match leader_id {
            Some(leader) if leader == monster_id => PackRole::Leader,
            Some(_) => PackRole::Follower,
            None => PackRole::Independent,
        };
        self.set_membership(monster_id, role, leader_id);
    }

    /// Register `monster_id` with an explicit role and leader
    pub fn set_membership(&self, monster_id: i64, role: PackRole, leader_id: Option<i64>) {
        self.memberships.lock().unwrap().insert(
            monster_id,
            TeamMembership {
                role,
                leader_id,
                member_ids: Vec::new(),
            },
        );
    }

    pub fn fail_membership(&self, monster_id: i64) {
        self.failing.lock().unwrap().insert(monster_id);
    }

    pub fn set_threats(&self, monster_id: i64, count: usize) {
        self.threats.lock().unwrap().insert(monster_id, count);
    }

    pub fn spatial_updates(&self) -> Vec<i64> {
        self.spatial.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphManager for FakeGraph {
    async fn team_membership(&self, monster_id: i64) -> Result<Option<TeamMembership>> {
        if self.failing.lock().unwrap().contains(&monster_id) {
            return Err(Error::Graph("graph unavailable".to_string()));
        }
        Ok(self.memberships.lock().unwrap().get(&monster_id).cloned())
    }

    async fn threat_network(&self, monster_id: i64, _radius: u32) -> Result<Vec<ThreatEdge>> {
        let count = self.threats.lock().unwrap().get(&monster_id).copied().unwrap_or(0);
        Ok((0..count)
            .map(|i| ThreatEdge {
                source_id: 1000 + i as i64,
                target_monster_id: monster_id,
                threat_score: 0.5,
            })
            .collect())
    }

    async fn update_spatial(&self, monster_id: i64, _update: SpatialUpdate) -> Result<()> {
        self.spatial.lock().unwrap().push(monster_id);
        Ok(())
    }

    async fn cleanup_stale(&self, _retention_hours: u32) -> Result<usize> {
        Ok(6)
    }
}

/// Cache whose every operation fails
pub(crate) struct FailingCache;

#[async_trait]
impl ActionCache for FailingCache {
    async fn lookup(&self, _monster_id: i64, _state: &[f32]) -> Result<Option<CachedAction>> {
        Err(Error::Cache("cache offline".to_string()))
    }

    async fn store(&self, _monster_id: i64, _state: &[f32], _action: CachedAction) -> Result<()> {
        Err(Error::Cache("cache offline".to_string()))
    }

    async fn evict_expired(&self) -> Result<usize> {
        Err(Error::Cache("cache offline".to_string()))
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }

    fn health_check(&self) -> bool {
        false
    }
}

pub(crate) struct Harness {
    pub orchestrator: BatchOrchestrator,
    pub queue: Arc<FakeQueue>,
    pub engine: Arc<FakeEngine>,
    pub cache: Arc<MemoryCache>,
    pub graph: Arc<FakeGraph>,
    pub fallback: Arc<FallbackHandler>,
    pub metrics: Arc<Metrics>,
}

impl Harness {
    pub fn new(config: ServiceConfig) -> Self {
        let cache = Arc::new(MemoryCache::new(&config.cache));
        Self::build(config, cache.clone(), cache)
    }

    /// Wire `cache` into the orchestrator instead of the in-memory one
    pub fn with_cache(config: ServiceConfig, cache: Arc<dyn ActionCache>) -> Self {
        let unused = Arc::new(MemoryCache::new(&config.cache));
        Self::build(config, cache, unused)
    }

    fn build(config: ServiceConfig, wired: Arc<dyn ActionCache>, cache: Arc<MemoryCache>) -> Self {
        let queue = Arc::new(FakeQueue::default());
        let engine = Arc::new(FakeEngine::default());
        let graph = Arc::new(FakeGraph::default());
        let fallback = Arc::new(FallbackHandler::new(config.fallback.clone()));
        let metrics = Arc::new(Metrics::new());

        let collaborators = Collaborators {
            queue: queue.clone(),
            engine: engine.clone(),
            fallback: fallback.clone(),
            cache: Some(wired),
            graph: Some(graph.clone()),
            health: Some(Arc::new(HealthMonitor::default())),
            metrics: metrics.clone(),
        };

        Self {
            orchestrator: BatchOrchestrator::new(config, collaborators),
            queue,
            engine,
            cache,
            graph,
            fallback,
            metrics,
        }
    }
}

/// Orchestrator over a real queue and graph sharing one database file
pub(crate) struct SqliteHarness {
    pub orchestrator: BatchOrchestrator,
    pub queue: Arc<SqliteQueue>,
    pub graph: Arc<SqliteGraph>,
    pub engine: Arc<FakeEngine>,
    pub path: PathBuf,
    _dir: TempDir,
}

impl SqliteHarness {
    pub fn new(config: ServiceConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let queue = Arc::new(SqliteQueue::open(&path, Duration::from_millis(5)).unwrap());
        let graph = Arc::new(SqliteGraph::open(&path).unwrap());
        let engine = Arc::new(FakeEngine::default());

        let collaborators = Collaborators {
            queue: queue.clone(),
            engine: engine.clone(),
            fallback: Arc::new(FallbackHandler::new(config.fallback.clone())),
            cache: Some(Arc::new(MemoryCache::new(&config.cache))),
            graph: Some(graph.clone()),
            health: None,
            metrics: Arc::new(Metrics::new()),
        };

        Self {
            orchestrator: BatchOrchestrator::new(config, collaborators),
            queue,
            graph,
            engine,
            path,
            _dir: dir,
        }
    }
}

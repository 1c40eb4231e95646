//! Model registry and batched inference.
//!
//! Models are keyed by `(archetype, model_type)` and stored at
//! `<directory>/<archetype>/<model_type>.json`. A batch is split by
//! archetype; archetypes without a model answer IDLE.

pub mod policy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ModelsConfig;
use crate::error::{Error, Result};
use crate::fallback::percentile;
use crate::graph::PackRole;
use crate::health::HealthStatus;
use crate::signal::{OutgoingSignal, SIGNAL_DIM, SignalCoordinator, SignalStats, SignalType};
use crate::types::{ACTION_IDLE, InferenceRequest};

pub use policy::LinearPolicy;
use policy::{argmax, softmax};

/// Model type consulted first for pack members when its input accepts a
/// state plus signal vector
pub const TEAM_COORDINATION_MODEL: &str = "team_coordination";

/// Latency samples kept per model type
const LATENCY_HISTORY: usize = 1000;

/// Average latency above which the engine reports itself degraded
const DEGRADED_LATENCY_MS: f64 = 30.0;

/// One pack member handed to coordinated inference
#[derive(Debug, Clone, PartialEq)]
pub struct PackMonster {
    pub monster_id: i64,
    pub state_vector: Vec<f32>,
    pub archetype: String,
    pub position: (i32, i32),
}

impl From<&InferenceRequest> for PackMonster {
    fn from(request: &InferenceRequest) -> Self {
        Self {
            monster_id: request.monster_id,
            state_vector: request.state_vector.clone(),
            archetype: request.archetype.clone(),
            position: request.position(),
        }
    }
}

/// Per-member outcome of coordinated inference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatedAction {
    pub monster_id: i64,
    pub action_id: u8,
    pub coordinated: bool,
    pub pack_role: PackRole,
    pub coordination_bonus: f32,
    pub coordination_action: Option<String>,
}

/// A loaded model as reported by `/models`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub archetype: String,
    pub model_type: String,
    pub path: String,
    pub input_dim: usize,
    pub action_count: usize,
    pub loaded_at: DateTime<Utc>,
}

/// Latency distribution for one model type
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub count: usize,
}

impl LatencySummary {
    fn from_samples(samples: &VecDeque<f64>) -> Self {
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let count = sorted.len();
        if count == 0 {
            return Self::default();
        }
        Self {
            avg_ms: sorted.iter().sum::<f64>() / count as f64,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            count,
        }
    }
}

/// Engine counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub models_loaded: usize,
    pub total_inferences: u64,
    pub avg_latency_ms: f64,
    pub model_latencies: BTreeMap<String, LatencySummary>,
    pub coordination_enabled: bool,
    pub signals: Option<SignalStats>,
}

/// Engine health verdict
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub message: String,
    pub models_loaded: usize,
    pub avg_latency_ms: f64,
    pub inference_count: u64,
}

/// Inference backend used by the orchestrator and the control plane.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// One action per request, in order, using `model_type` for every archetype
    async fn infer_batch(&self, requests: &[&InferenceRequest], model_type: &str) -> Result<Vec<u8>>;

    /// Coordinated decision for a pack; one action per member, in order
    async fn infer_pack(
        &self,
        pack_id: i64,
        members: &[PackMonster],
        coordination_threshold: f32,
    ) -> Result<Vec<CoordinatedAction>>;

    /// Whether pack inference can exchange signals
    fn supports_coordination(&self) -> bool;

    /// Load or replace one model; the previous model keeps serving on failure
    async fn reload_model(
        &self,
        archetype: &str,
        model_type: &str,
        path: Option<PathBuf>,
    ) -> Result<ModelInfo>;

    /// Load every configured model, returning `(loaded, expected)`
    async fn load_all(&self) -> (usize, usize);

    fn loaded_models(&self) -> Vec<ModelInfo>;

    fn statistics(&self) -> EngineStats;

    fn health(&self) -> EngineHealth;

    async fn unload_all(&self);

    /// Expire stale pack signals, returning how many were dropped
    fn cleanup_signals(&self) -> usize;
}

/// Check a model or archetype name before it becomes part of a path
pub fn validate_model_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidModelName(name.to_string()))
    }
}

/// Resolve an explicit artifact path, relative to `model_dir` unless
/// absolute, and require the result to sit inside `model_dir`
fn confine_to(model_dir: &Path, requested: &Path) -> Result<PathBuf> {
    let joined = model_dir.join(requested);
    let resolved = joined
        .canonicalize()
        .map_err(|e| Error::model_load(joined.display().to_string(), e.to_string()))?;
    let root = model_dir
        .canonicalize()
        .map_err(|e| Error::model_load(model_dir.display().to_string(), e.to_string()))?;
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(Error::model_load(
            resolved.display().to_string(),
            "outside the model directory",
        ))
    }
}

struct LoadedModel {
    policy: Arc<LinearPolicy>,
    path: PathBuf,
    loaded_at: DateTime<Utc>,
}

#[derive(Default)]
struct EngineCounters {
    inference_count: u64,
    total_latency_ms: f64,
    model_latencies: HashMap<String, VecDeque<f64>>,
}

/// Engine backed by [`LinearPolicy`] artifacts on disk.
pub struct PolicyEngine {
    model_dir: PathBuf,
    archetypes: Vec<String>,
    model_types: Vec<String>,
    primary_model: String,
    models: RwLock<HashMap<(String, String), LoadedModel>>,
    signals: Option<Arc<SignalCoordinator>>,
    counters: Mutex<EngineCounters>,
}

impl PolicyEngine {
    pub fn new(config: &ModelsConfig, primary_model: impl Into<String>) -> Self {
        Self {
            model_dir: config.directory.clone(),
            archetypes: config.archetypes.clone(),
            model_types: config.types.clone(),
            primary_model: primary_model.into(),
            models: RwLock::new(HashMap::new()),
            signals: None,
            counters: Mutex::new(EngineCounters::default()),
        }
    }

    /// Enable pack signalling through `coordinator`
    pub fn with_coordination(mut self, coordinator: Arc<SignalCoordinator>) -> Self {
        self.signals = Some(coordinator);
        self
    }

    fn model_path(&self, archetype: &str, model_type: &str) -> PathBuf {
        self.model_dir
            .join(archetype)
            .join(format!("{model_type}.json"))
    }

    fn policy(&self, archetype: &str, model_type: &str) -> Result<Option<Arc<LinearPolicy>>> {
        let models = self.models.read().map_err(|_| Error::LockPoisoned)?;
        Ok(models
            .get(&(archetype.to_string(), model_type.to_string()))
            .map(|m| Arc::clone(&m.policy)))
    }

    fn counters(&self) -> MutexGuard<'_, EngineCounters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_latency(&self, model_type: &str, count: usize, latency_ms: f64) {
        let mut counters = self.counters();
        counters.inference_count += count as u64;
        counters.total_latency_ms += latency_ms;
        let history = counters
            .model_latencies
            .entry(model_type.to_string())
            .or_default();
        if history.len() == LATENCY_HISTORY {
            history.pop_front();
        }
        history.push_back(latency_ms);
    }

    fn avg_latency_ms(counters: &EngineCounters) -> f64 {
        if counters.inference_count == 0 {
            0.0
        } else {
            counters.total_latency_ms / counters.inference_count as f64
        }
    }

    fn model_count(&self) -> usize {
        self.models.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Logits for one pack member, `None` when its archetype has no model.
    ///
    /// A coordination model whose input is the state plus a signal vector is
    /// preferred over the primary model.
    fn member_logits(&self, member: &PackMonster, signal: &[f32]) -> Result<Option<Vec<f32>>> {
        if let Some(policy) = self.policy(&member.archetype, TEAM_COORDINATION_MODEL)?
            && policy.input_dim == member.state_vector.len() + signal.len()
        {
            let mut input = member.state_vector.clone();
            input.extend_from_slice(signal);
            return policy.forward(&input).map(Some);
        }

        match self.policy(&member.archetype, &self.primary_model)? {
            Some(policy) => policy.forward(&member.state_vector).map(Some),
            None => Ok(None),
        }
    }
}

fn signal_for_action(action_id: u8) -> SignalType {
    match action_id {
        3 | 9 => SignalType::Retreat,
        1 | 5..=8 => SignalType::AttackTarget,
        _ => SignalType::FormUp,
    }
}

#[async_trait]
impl InferenceEngine for PolicyEngine {
    async fn infer_batch(&self, requests: &[&InferenceRequest], model_type: &str) -> Result<Vec<u8>> {
        let start = Instant::now();

        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, request) in requests.iter().enumerate() {
            groups.entry(request.archetype.as_str()).or_default().push(idx);
        }

        let mut actions = vec![ACTION_IDLE; requests.len()];
        for (archetype, indices) in groups {
            let Some(policy) = self.policy(archetype, model_type)? else {
                warn!(archetype, model_type, "No model loaded, answering IDLE");
                continue;
            };

            for idx in indices {
                actions[idx] = policy.act(&requests[idx].state_vector).map_err(|e| {
                    error!(archetype, model_type, error = %e, "Inference failed");
                    e
                })?;
            }
        }

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record_latency(model_type, requests.len(), latency_ms);
        Ok(actions)
    }

    async fn infer_pack(
        &self,
        pack_id: i64,
        members: &[PackMonster],
        coordination_threshold: f32,
    ) -> Result<Vec<CoordinatedAction>> {
        let start = Instant::now();

        let mut signal_strengths = Vec::with_capacity(members.len());
        let mut member_probs: Vec<Option<Vec<f32>>> = Vec::with_capacity(members.len());
        for member in members {
            let signal = match &self.signals {
                Some(coordinator) => coordinator.signal_vector(member.monster_id),
                None => [0.0; SIGNAL_DIM],
            };
            signal_strengths.push(signal.iter().copied().fold(0.0f32, f32::max));
            member_probs.push(self.member_logits(member, &signal)?.map(|l| softmax(&l)));
        }

        let action_space = member_probs
            .iter()
            .flatten()
            .map(Vec::len)
            .max()
            .unwrap_or(0);
        let voters = member_probs.iter().flatten().count();

        let mut consensus = vec![0.0f32; action_space];
        for probs in member_probs.iter().flatten() {
            for (slot, p) in consensus.iter_mut().zip(probs) {
                *slot += p / voters as f32;
            }
        }

        let (consensus_action, agreement) = if voters == 0 {
            (ACTION_IDLE, 0.0)
        } else {
            let action = argmax(&consensus);
            (action, consensus[usize::from(action)])
        };
        let coordinated = voters > 0 && agreement >= coordination_threshold;
        let signal_type = signal_for_action(consensus_action);

        let leader_idx = members
            .iter()
            .position(|m| m.monster_id == pack_id)
            .unwrap_or(0);

        if coordinated
            && let (Some(coordinator), Some(leader)) = (&self.signals, members.get(leader_idx))
        {
            let recipients: Vec<(i64, (i32, i32))> =
                members.iter().map(|m| (m.monster_id, m.position)).collect();
            let priority = if agreement >= 0.9 { 1 } else { 3 };
            coordinator.broadcast(
                leader.monster_id,
                leader.position,
                &OutgoingSignal::new(signal_type, priority, agreement),
                &recipients,
            );
        }

        let actions = members
            .iter()
            .zip(&member_probs)
            .zip(&signal_strengths)
            .enumerate()
            .map(|(idx, ((member, probs), strength))| {
                let own_action = probs.as_deref().map(argmax).unwrap_or(ACTION_IDLE);
                CoordinatedAction {
                    monster_id: member.monster_id,
                    action_id: if coordinated { consensus_action } else { own_action },
                    coordinated,
                    pack_role: if idx == leader_idx {
                        PackRole::Leader
                    } else {
                        PackRole::Follower
                    },
                    coordination_bonus: if coordinated {
                        (0.5 * agreement + 0.5 * strength).min(1.0)
                    } else {
                        0.0
                    },
                    coordination_action: coordinated.then(|| signal_type.as_str().to_string()),
                }
            })
            .collect();

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record_latency(TEAM_COORDINATION_MODEL, members.len(), latency_ms);
        debug!(
            pack_id,
            pack_size = members.len(),
            agreement,
            coordinated,
            "Pack inference complete"
        );
        Ok(actions)
    }

    fn supports_coordination(&self) -> bool {
        self.signals.is_some()
    }

    async fn reload_model(
        &self,
        archetype: &str,
        model_type: &str,
        path: Option<PathBuf>,
    ) -> Result<ModelInfo> {
        validate_model_name(archetype)?;
        validate_model_name(model_type)?;

        let model_dir = self.model_dir.clone();
        let default_path = self.model_path(archetype, model_type);
        let (path, policy) = tokio::task::spawn_blocking(move || -> Result<(PathBuf, LinearPolicy)> {
            let path = match path {
                Some(requested) => confine_to(&model_dir, &requested)?,
                None => default_path,
            };
            let policy = LinearPolicy::load(&path)?;
            Ok((path, policy))
        })
        .await
        .map_err(|e| Error::Other(format!("model loader panicked: {e}")))??;

        let loaded_at = Utc::now();
        let info = ModelInfo {
            archetype: archetype.to_string(),
            model_type: model_type.to_string(),
            path: path.display().to_string(),
            input_dim: policy.input_dim,
            action_count: policy.action_count(),
            loaded_at,
        };

        let mut models = self.models.write().map_err(|_| Error::LockPoisoned)?;
        let replaced = models
            .insert(
                (archetype.to_string(), model_type.to_string()),
                LoadedModel {
                    policy: Arc::new(policy),
                    path,
                    loaded_at,
                },
            )
            .is_some();

        info!(
            archetype,
            model_type,
            input_dim = info.input_dim,
            action_count = info.action_count,
            replaced,
            "Model loaded"
        );
        Ok(info)
    }

    async fn load_all(&self) -> (usize, usize) {
        let expected = self.archetypes.len() * self.model_types.len();
        info!(expected, directory = %self.model_dir.display(), "Loading models");

        let mut loaded = 0;
        for archetype in &self.archetypes {
            for model_type in &self.model_types {
                let path = self.model_path(archetype, model_type);
                if !path.exists() {
                    debug!(path = %path.display(), "Model not found, skipping");
                    continue;
                }
                match self.reload_model(archetype, model_type, Some(path)).await {
                    Ok(_) => loaded += 1,
                    Err(e) => error!(archetype, model_type, error = %e, "Failed to load model"),
                }
            }
        }

        if loaded == 0 {
            error!("No models loaded, service will operate in fallback mode only");
        } else if loaded < expected {
            warn!(loaded, expected, "Only some models loaded");
        } else {
            info!(loaded, "All models loaded");
        }
        (loaded, expected)
    }

    fn loaded_models(&self) -> Vec<ModelInfo> {
        let Ok(models) = self.models.read() else {
            return Vec::new();
        };
        let mut infos: Vec<ModelInfo> = models
            .iter()
            .map(|((archetype, model_type), model)| ModelInfo {
                archetype: archetype.clone(),
                model_type: model_type.clone(),
                path: model.path.display().to_string(),
                input_dim: model.policy.input_dim,
                action_count: model.policy.action_count(),
                loaded_at: model.loaded_at,
            })
            .collect();
        infos.sort_by(|a, b| (&a.archetype, &a.model_type).cmp(&(&b.archetype, &b.model_type)));
        infos
    }

    fn statistics(&self) -> EngineStats {
        let counters = self.counters();
        EngineStats {
            models_loaded: self.model_count(),
            total_inferences: counters.inference_count,
            avg_latency_ms: Self::avg_latency_ms(&counters),
            model_latencies: counters
                .model_latencies
                .iter()
                .map(|(model_type, samples)| {
                    (model_type.clone(), LatencySummary::from_samples(samples))
                })
                .collect(),
            coordination_enabled: self.supports_coordination(),
            signals: self.signals.as_ref().map(|s| s.statistics()),
        }
    }

    fn health(&self) -> EngineHealth {
        let models_loaded = self.model_count();
        let (avg_latency_ms, inference_count) = {
            let counters = self.counters();
            (Self::avg_latency_ms(&counters), counters.inference_count)
        };

        let (status, message) = if models_loaded == 0 {
            (HealthStatus::Critical, "No models loaded".to_string())
        } else if avg_latency_ms > DEGRADED_LATENCY_MS {
            (
                HealthStatus::Degraded,
                format!("High latency ({avg_latency_ms:.1}ms)"),
            )
        } else {
            (HealthStatus::Healthy, "All systems operational".to_string())
        };

        EngineHealth {
            status,
            message,
            models_loaded,
            avg_latency_ms,
            inference_count,
        }
    }

    async fn unload_all(&self) {
        if let Ok(mut models) = self.models.write() {
            let count = models.len();
            models.clear();
            info!(count, "Unloaded models");
        }
    }

    fn cleanup_signals(&self) -> usize {
        self.signals
            .as_ref()
            .map(|s| s.cleanup_expired())
            .unwrap_or(0)
    }
}

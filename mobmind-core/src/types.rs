//! Shared types for mobmind-core.
//!
//! Requests arrive from the game server through the request queue; one
//! response is written back per request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action id instructing the game server to use its traditional (non-ML) AI
pub const ACTION_DEFER: u8 = 255;

/// Action id for "do nothing", used when an archetype has no model
pub const ACTION_IDLE: u8 = 0;

/// Highest fallback level (traditional AI only)
pub const MAX_FALLBACK_LEVEL: u8 = 5;

/// Latency reported for responses served from cache
pub const CACHE_HIT_LATENCY_MS: f64 = 0.5;

/// Latency reported for responses produced by the fallback handler
pub const FALLBACK_ACTION_LATENCY_MS: f64 = 1.0;

/// Confidence attached to single-model inference results
pub const MODEL_CONFIDENCE: f32 = 0.85;

/// Confidence attached to pack responses that reached consensus
pub const COORDINATED_CONFIDENCE: f32 = 0.9;

/// Confidence attached to pack responses that did not reach consensus
pub const UNCOORDINATED_CONFIDENCE: f32 = 0.7;

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// A single monster decision request read from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub request_id: i64,
    pub monster_id: i64,
    pub state_vector: Vec<f32>,
    pub archetype: String,
    pub position_x: i32,
    pub position_y: i32,
    pub map_id: i32,
    pub hp_ratio: f32,
    #[serde(default = "default_ratio")]
    pub sp_ratio: f32,
    #[serde(default)]
    pub priority: i32,
}

fn default_ratio() -> f32 {
    1.0
}

impl InferenceRequest {
    /// Position as an `(x, y)` cell pair
    pub fn position(&self) -> (i32, i32) {
        (self.position_x, self.position_y)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// Which path produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Model inference or cache
    Combat,
    /// Fallback handler decided without inference
    Fallback,
    /// Inference failed, request routed to traditional AI
    ErrorFallback,
    /// Pack-coordinated inference
    Coordinated,
}

impl ActionType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Combat => "combat",
            ActionType::Fallback => "fallback",
            ActionType::ErrorFallback => "error_fallback",
            ActionType::Coordinated => "coordinated",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "combat" => Some(ActionType::Combat),
            "fallback" => Some(ActionType::Fallback),
            "error_fallback" => Some(ActionType::ErrorFallback),
            "coordinated" => Some(ActionType::Coordinated),
            _ => None,
        }
    }
}

/// Decision written back for one request.
///
/// `inference_latency_ms` is only `None` while a batch is being assembled;
/// the orchestrator backfills it before anything is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: i64,
    pub monster_id: i64,
    pub action_type: ActionType,
    pub action_id: u8,
    pub action_params: Map<String, Value>,
    pub model_outputs: Map<String, Value>,
    pub fusion_weights: Map<String, Value>,
    pub confidence: f32,
    pub coordination_action: Option<String>,
    pub coordination_bonus: Option<f32>,
    pub pack_id: Option<i64>,
    pub pack_size: Option<usize>,
    pub inference_latency_ms: Option<f64>,
    pub cache_used: bool,
    pub fallback_level: u8,
}

impl InferenceResponse {
    /// Start a response for `request` with empty diagnostic maps and no pack data.
    pub fn for_request(
        request: &InferenceRequest,
        action_type: ActionType,
        action_id: u8,
        confidence: f32,
        fallback_level: u8,
    ) -> Self {
        Self {
            request_id: request.request_id,
            monster_id: request.monster_id,
            action_type,
            action_id,
            action_params: Map::new(),
            model_outputs: Map::new(),
            fusion_weights: Map::new(),
            confidence,
            coordination_action: None,
            coordination_bonus: None,
            pack_id: None,
            pack_size: None,
            inference_latency_ms: None,
            cache_used: false,
            fallback_level,
        }
    }

    /// Set the latency figure.
    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.inference_latency_ms = Some(latency_ms);
        self
    }

    /// Add one diagnostic model output.
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.model_outputs.insert(key.into(), value.into());
        self
    }

    /// Whether this response routes the monster to traditional AI.
    pub fn is_deferred(&self) -> bool {
        self.action_id == ACTION_DEFER
    }

    /// Latency in milliseconds, zero if not yet assigned.
    pub fn latency_ms(&self) -> f64 {
        self.inference_latency_ms.unwrap_or(0.0)
    }
}

//! mobmind-core - batch inference orchestration for monster AI
//!
//! The game server writes decision requests into a SQLite queue; this crate
//! answers them in batches:
//!
//! - **queue**: SQLite request/response queue
//! - **cache**: fingerprint-keyed action cache
//! - **fallback**: graded degradation from full models to traditional AI
//! - **engine**: model registry, batched and pack inference
//! - **graph**: pack leadership, threats and spatial state
//! - **signal**: pack signals and their fixed-width encoding
//! - **orchestrator**: the tick loop tying the above together
//! - **health** / **metrics**: host sampling and in-process gauges

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod graph;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod signal;
pub mod types;

// Re-export commonly used types
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use orchestrator::{BatchOrchestrator, Collaborators, OrchestratorCounters};
pub use types::{ActionType, InferenceRequest, InferenceResponse};

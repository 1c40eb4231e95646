//! Service configuration tree.
//!
//! Every section has defaults so a partial TOML file is enough. File
//! loading and environment overrides live in the server binary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Full service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub inference: InferenceConfig,
    pub cache: CacheConfig,
    pub graph: GraphConfig,
    pub pack_coordination: PackCoordinationConfig,
    pub fallback: FallbackConfig,
    pub maintenance: MaintenanceConfig,
    pub models: ModelsConfig,
    pub database: DatabaseConfig,
    pub http_server: HttpServerConfig,
    pub logging: LoggingConfig,
}

/// Tick loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Maximum requests drained per tick (default: 128)
    pub batch_size: usize,

    /// Sleep when the queue is empty, in milliseconds (default: 10)
    pub poll_interval_ms: u64,

    /// Average per-request latency ceiling before escalation (default: 50.0)
    pub max_latency_ms: f64,

    /// Model type used for solo inference (default: combat_dqn)
    pub primary_model: String,

    /// Upper bound for any single collaborator call (default: 1000)
    pub collaborator_timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            poll_interval_ms: 10,
            max_latency_ms: 50.0,
            primary_model: "combat_dqn".to_string(),
            collaborator_timeout_ms: 1000,
        }
    }
}

impl InferenceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}

/// Action cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Entry lifetime in seconds (default: 60)
    pub ttl_secs: u64,

    /// Capacity before the oldest entries are evicted (default: 100000)
    pub max_entries: usize,

    /// State vectors are rounded to 1/quantization before hashing (default: 1000)
    pub quantization: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60,
            max_entries: 100_000,
            quantization: 1000,
        }
    }
}

/// Relationship graph usage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub enabled: bool,
    pub use_for_coordination: bool,
    pub use_for_threat_tracking: bool,
    pub use_for_spatial: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_for_coordination: true,
            use_for_threat_tracking: false,
            use_for_spatial: true,
        }
    }
}

impl GraphConfig {
    pub fn coordination_enabled(&self) -> bool {
        self.enabled && self.use_for_coordination
    }

    pub fn spatial_enabled(&self) -> bool {
        self.enabled && self.use_for_spatial
    }

    pub fn threat_tracking_enabled(&self) -> bool {
        self.enabled && self.use_for_threat_tracking
    }
}

/// Pack coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackCoordinationConfig {
    pub enabled: bool,

    /// Maximum signal distance in cells (default: 15)
    pub signal_range: u32,

    /// Signal lifetime in seconds (default: 5)
    pub signal_ttl: u64,

    /// Minimum pack agreement for a coordinated action, 0..1 (default: 0.6)
    pub coordination_threshold: f32,
}

impl Default for PackCoordinationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signal_range: 15,
            signal_ttl: 5,
            coordination_threshold: 0.6,
        }
    }
}

/// Fallback state machine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,

    /// Consecutive errors before escalating one level (default: 3)
    pub max_consecutive_errors: u32,

    /// Minimum time between recovery steps in seconds (default: 60)
    pub recovery_check_interval_secs: u64,

    pub auto_recovery: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_consecutive_errors: 3,
            recovery_check_interval_secs: 60,
            auto_recovery: true,
        }
    }
}

/// Periodic maintenance cadences
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// (default: 60)
    pub cleanup_interval_secs: u64,

    /// (default: 10)
    pub health_check_interval_secs: u64,

    /// (default: 5)
    pub metrics_interval_secs: u64,

    /// Age after which queue rows are purged (default: 24)
    pub retention_hours: u32,

    /// Log a summary line every N batches (default: 100)
    pub stats_log_every_batches: u64,

    /// Claims older than this go back to pending (default: 300)
    pub stale_claim_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
            health_check_interval_secs: 10,
            metrics_interval_secs: 5,
            retention_hours: 24,
            stats_log_every_batches: 100,
            stale_claim_secs: 300,
        }
    }
}

impl MaintenanceConfig {
    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }
}

/// Model artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Artifacts live at `<directory>/<archetype>/<model_type>.json`
    pub directory: PathBuf,
    pub archetypes: Vec<String>,
    pub types: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("models"),
            archetypes: ["aggressive", "defensive", "support", "mage", "tank", "ranged"]
                .into_iter()
                .map(String::from)
                .collect(),
            types: ["combat_dqn", "movement_ppo", "skill_dqn", "team_coordination"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Request queue database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mobmind.db"),
        }
    }
}

/// Control plane listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl ServiceConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.inference.batch_size == 0 {
            return Err(Error::config("inference.batch_size", "must be greater than 0"));
        }

        if self.inference.poll_interval_ms == 0 {
            return Err(Error::config(
                "inference.poll_interval_ms",
                "must be greater than 0",
            ));
        }

        if self.inference.max_latency_ms <= 0.0 {
            return Err(Error::config(
                "inference.max_latency_ms",
                "must be greater than 0",
            ));
        }

        let threshold = self.pack_coordination.coordination_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::config(
                "pack_coordination.coordination_threshold",
                "must be between 0 and 1",
            ));
        }

        if self.models.archetypes.is_empty() {
            return Err(Error::config("models.archetypes", "must not be empty"));
        }

        if self.cache.quantization == 0 {
            return Err(Error::config("cache.quantization", "must be greater than 0"));
        }

        if self.maintenance.stale_claim_after() <= self.inference.collaborator_timeout() {
            return Err(Error::config(
                "maintenance.stale_claim_secs",
                "must exceed inference.collaborator_timeout_ms",
            ));
        }

        Ok(())
    }
}

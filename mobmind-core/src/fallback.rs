//! Six-level graceful degradation for inference.
//!
//! Level 0 runs every model at full precision; level 5 hands every monster
//! back to the game server's traditional AI. The orchestrator reads the
//! level once per batch and reports latency, errors and successes back.
//!
//! Policy:
//! - escalate one level when a reported latency exceeds 1.5x the current
//!   level's budget, or after `max_consecutive_errors` consecutive errors
//! - recover at most one level per `recovery_check_interval`, only when the
//!   recent window (>= 20 samples) satisfies the target level's criteria
//! - levels 4 and 5 do not run inference, so they have no samples; they
//!   step down after a quiet interval instead
//! - a forced level is pinned until `release_forced` is called

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::FallbackConfig;
use crate::types::ACTION_DEFER;

/// Samples kept for recovery decisions
const WINDOW_SIZE: usize = 100;

/// Samples required before recovery is considered
const MIN_RECOVERY_SAMPLES: usize = 20;

/// Margin over the level budget that counts as a violation
const VIOLATION_MARGIN: f64 = 1.5;

/// Degradation level, ordered from full ML (0) to traditional AI (5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackLevel {
    /// Full model ensemble
    Full = 0,
    /// Single model, half precision
    Fp16 = 1,
    /// Single model, quantized
    Int8 = 2,
    /// Quantized model on CPU threads
    Cpu = 3,
    /// Rule-based decisions, no inference
    RuleBased = 4,
    /// Every monster deferred to traditional AI
    Traditional = 5,
}

impl FallbackLevel {
    pub const ALL: [FallbackLevel; 6] = [
        FallbackLevel::Full,
        FallbackLevel::Fp16,
        FallbackLevel::Int8,
        FallbackLevel::Cpu,
        FallbackLevel::RuleBased,
        FallbackLevel::Traditional,
    ];

    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            FallbackLevel::Full => "Full ensemble (nominal)",
            FallbackLevel::Fp16 => "Single model FP16",
            FallbackLevel::Int8 => "Single model INT8",
            FallbackLevel::Cpu => "CPU INT8 (multi-threaded)",
            FallbackLevel::RuleBased => "Rule-based",
            FallbackLevel::Traditional => "Traditional AI",
        }
    }

    /// Per-request latency budget for this level in milliseconds
    pub fn latency_budget_ms(&self) -> f64 {
        match self {
            FallbackLevel::Full => 15.0,
            FallbackLevel::Fp16 => 20.0,
            FallbackLevel::Int8 => 30.0,
            FallbackLevel::Cpu => 80.0,
            FallbackLevel::RuleBased => 120.0,
            FallbackLevel::Traditional => f64::INFINITY,
        }
    }

    /// Whether this level skips model inference entirely
    pub fn skips_inference(&self) -> bool {
        *self >= FallbackLevel::RuleBased
    }

    fn next(&self) -> Option<Self> {
        Self::from_value(self.value() + 1)
    }

    fn previous(&self) -> Option<Self> {
        self.value().checked_sub(1).and_then(Self::from_value)
    }
}

impl fmt::Display for FallbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value(), self.name())
    }
}

/// Snapshot of the handler state
#[derive(Debug, Clone, Serialize)]
pub struct FallbackStats {
    pub current_level: u8,
    pub current_level_name: String,
    pub consecutive_errors: u32,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub error_rate: f64,
    pub samples_tracked: usize,
    pub forced: bool,
    pub enabled: bool,
    pub auto_recovery: bool,
}

/// Decision and feedback hooks used by the orchestrator.
///
/// Implementations are shared with the HTTP control plane and must be
/// internally synchronized.
pub trait FallbackControl: Send + Sync {
    /// Current level
    fn current_level(&self) -> FallbackLevel;

    /// Whether misses should skip inference and use `action_for_level`
    fn should_use_fallback_action(&self) -> bool;

    /// Deterministic action for the current level, `None` when inference
    /// should run normally
    fn action_for_level(&self, state: &[f32]) -> Option<u8>;

    /// Report an average latency above the configured ceiling
    fn handle_latency_violation(&self, latency_ms: f64);

    /// Report an inference failure
    fn handle_error(&self, error: &dyn fmt::Display, context: &str);

    /// Report a successful batch
    fn record_success(&self, latency_ms: f64);

    /// Periodic re-evaluation; returns true when the level changed
    fn check_and_update_level(&self) -> bool;

    /// Pin the handler to `level`
    fn force_level(&self, level: FallbackLevel);

    /// Unpin a forced level so recovery can resume
    fn release_forced(&self);

    fn statistics(&self) -> FallbackStats;
}

#[derive(Debug)]
struct HandlerState {
    level: FallbackLevel,
    consecutive_errors: u32,
    forced: bool,
    last_recovery_check: Instant,
    last_error_at: Option<Instant>,
    latencies: VecDeque<f64>,
    errors: VecDeque<f64>,
}

impl HandlerState {
    fn push_sample(&mut self, latency_ms: Option<f64>, error: bool) {
        if let Some(latency) = latency_ms {
            if self.latencies.len() == WINDOW_SIZE {
                self.latencies.pop_front();
            }
            self.latencies.push_back(latency);
        }
        if self.errors.len() == WINDOW_SIZE {
            self.errors.pop_front();
        }
        self.errors.push_back(if error { 1.0 } else { 0.0 });
    }

    fn avg_latency(&self) -> f64 {
        mean(self.latencies.iter().copied())
    }

    fn p95_latency(&self) -> f64 {
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        percentile(&sorted, 0.95)
    }

    fn error_rate(&self) -> f64 {
        mean(self.errors.iter().copied())
    }
}

/// Default fallback state machine
pub struct FallbackHandler {
    config: FallbackConfig,
    recovery_interval: Duration,
    state: Mutex<HandlerState>,
}

impl FallbackHandler {
    /// Create a handler starting at level 0
    pub fn new(config: FallbackConfig) -> Self {
        let recovery_interval = Duration::from_secs(config.recovery_check_interval_secs);
        info!(
            level = %FallbackLevel::Full,
            max_consecutive_errors = config.max_consecutive_errors,
            "Fallback handler initialized"
        );
        Self {
            config,
            recovery_interval,
            state: Mutex::new(HandlerState {
                level: FallbackLevel::Full,
                consecutive_errors: 0,
                forced: false,
                last_recovery_check: Instant::now(),
                last_error_at: None,
                latencies: VecDeque::with_capacity(WINDOW_SIZE),
                errors: VecDeque::with_capacity(WINDOW_SIZE),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandlerState> {
        // A panic while holding the lock leaves plain counters behind; keep serving.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn escalate(&self, state: &mut HandlerState, reason: &str) {
        if !self.config.enabled {
            warn!(reason, "Fallback escalation requested but fallback is disabled");
            return;
        }

        let Some(next) = state.level.next() else {
            error!(reason, "Already at traditional AI, cannot escalate further");
            return;
        };

        let old = state.level;
        state.level = next;
        // Samples from the old level say nothing about the new one
        state.latencies.clear();
        state.errors.clear();
        state.last_recovery_check = Instant::now();

        error!(
            old_level = old.value(),
            new_level = next.value(),
            reason,
            "Fallback escalation: {} -> {}",
            old.name(),
            next.name()
        );
    }

    fn try_recover(&self, state: &mut HandlerState) -> bool {
        if !self.config.enabled || !self.config.auto_recovery || state.forced {
            return false;
        }

        if state.last_recovery_check.elapsed() < self.recovery_interval {
            return false;
        }
        state.last_recovery_check = Instant::now();

        let Some(target) = state.level.previous() else {
            return false;
        };

        if !self.can_recover_to(state, target) {
            return false;
        }

        let old = state.level;
        state.level = target;
        info!(
            old_level = old.value(),
            new_level = target.value(),
            "Fallback recovery: {} -> {}",
            old.name(),
            target.name()
        );
        true
    }

    fn can_recover_to(&self, state: &HandlerState, target: FallbackLevel) -> bool {
        if state.level.skips_inference() {
            // No samples at these levels; require a quiet interval
            return state
                .last_error_at
                .is_none_or(|at| at.elapsed() >= self.recovery_interval);
        }

        if state.latencies.len() < MIN_RECOVERY_SAMPLES || state.errors.len() < MIN_RECOVERY_SAMPLES
        {
            return false;
        }

        let avg = state.avg_latency();
        let p95 = state.p95_latency();
        let error_rate = state.error_rate();

        match target {
            FallbackLevel::Full => avg < 12.0 && p95 < 15.0 && error_rate < 0.02,
            FallbackLevel::Fp16 => avg < 15.0 && p95 < 18.0 && error_rate < 0.03,
            FallbackLevel::Int8 => avg < 25.0 && error_rate < 0.05,
            FallbackLevel::Cpu => avg < 60.0 && error_rate < 0.10,
            FallbackLevel::RuleBased => avg < 100.0 && error_rate < 0.20,
            FallbackLevel::Traditional => false,
        }
    }
}

impl FallbackControl for FallbackHandler {
    fn current_level(&self) -> FallbackLevel {
        self.state().level
    }

    fn should_use_fallback_action(&self) -> bool {
        self.current_level().skips_inference()
    }

    fn action_for_level(&self, state: &[f32]) -> Option<u8> {
        match self.current_level() {
            FallbackLevel::Traditional => Some(ACTION_DEFER),
            FallbackLevel::RuleBased => Some(rule_based_action(state)),
            _ => None,
        }
    }

    fn handle_latency_violation(&self, latency_ms: f64) {
        let mut state = self.state();
        state.push_sample(Some(latency_ms), false);

        let budget = state.level.latency_budget_ms();
        if latency_ms > budget * VIOLATION_MARGIN {
            warn!(
                latency_ms,
                budget_ms = budget,
                level = state.level.value(),
                "Latency violation"
            );
            let reason = format!("latency {latency_ms:.1}ms exceeds budget {budget:.1}ms");
            self.escalate(&mut state, &reason);
        }
    }

    fn handle_error(&self, error: &dyn fmt::Display, context: &str) {
        let mut state = self.state();
        state.consecutive_errors += 1;
        state.last_error_at = Some(Instant::now());
        state.push_sample(None, true);

        warn!(
            consecutive_errors = state.consecutive_errors,
            level = state.level.value(),
            context,
            error = %error,
            "Inference error"
        );

        if state.consecutive_errors >= self.config.max_consecutive_errors {
            let reason = format!("{} consecutive errors", state.consecutive_errors);
            self.escalate(&mut state, &reason);
            state.consecutive_errors = 0;
        }
    }

    fn record_success(&self, latency_ms: f64) {
        let mut state = self.state();
        state.consecutive_errors = 0;
        state.push_sample(Some(latency_ms), false);
    }

    fn check_and_update_level(&self) -> bool {
        let mut state = self.state();
        let old = state.level;
        self.try_recover(&mut state);
        old != state.level
    }

    fn force_level(&self, level: FallbackLevel) {
        let mut state = self.state();
        let old = state.level;
        state.level = level;
        state.forced = true;
        state.latencies.clear();
        state.errors.clear();
        warn!(
            old_level = old.value(),
            new_level = level.value(),
            "Fallback level forced: {} -> {}",
            old.name(),
            level.name()
        );
    }

    fn release_forced(&self) {
        let mut state = self.state();
        if state.forced {
            state.forced = false;
            state.last_error_at = None;
            info!(level = state.level.value(), "Forced fallback level released");
        }
    }

    fn statistics(&self) -> FallbackStats {
        let state = self.state();
        FallbackStats {
            current_level: state.level.value(),
            current_level_name: state.level.name().to_string(),
            consecutive_errors: state.consecutive_errors,
            avg_latency_ms: state.avg_latency(),
            p95_latency_ms: state.p95_latency(),
            error_rate: state.error_rate(),
            samples_tracked: state.latencies.len(),
            forced: state.forced,
            enabled: self.config.enabled,
            auto_recovery: self.config.auto_recovery,
        }
    }
}

/// Rule-based action from a handful of state features.
///
/// Feature layout: `[0]` hp ratio, `[1]` sp ratio, `[30]` nearest enemy
/// distance, `[32]` threat level. Missing features take neutral values.
///
/// Action ids: 1 attack, 2 move closer, 3 move away, 4 move random,
/// 5 skill 1, 9 flee.
pub fn rule_based_action(state: &[f32]) -> u8 {
    let feature = |idx: usize, default: f32| state.get(idx).copied().unwrap_or(default);
    let hp_ratio = feature(0, 1.0);
    let sp_ratio = feature(1, 1.0);
    let enemy_distance = feature(30, 10.0);
    let threat = feature(32, 0.0);

    if hp_ratio < 0.2 {
        9
    } else if (hp_ratio < 0.3 && threat > 0.7) || threat > 0.8 {
        3
    } else if enemy_distance < 0.1 {
        1
    } else if enemy_distance < 0.3 {
        if sp_ratio > 0.3 { 5 } else { 1 }
    } else if enemy_distance < 0.6 {
        2
    } else {
        4
    }
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let len = values.len();
    if len == 0 {
        return 0.0;
    }
    values.sum::<f64>() / len as f64
}

/// Nearest-rank percentile over an already sorted slice
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

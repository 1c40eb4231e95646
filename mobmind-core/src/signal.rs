//! Intra-pack signal exchange.
//!
//! Leaders broadcast signals to pack members in range; members fold the
//! signals they hold into a fixed 32-dim vector:
//!
//! | dims  | meaning              |
//! |-------|----------------------|
//! | 0-7   | target threat bands  |
//! | 8-15  | formation commands   |
//! | 16-23 | support urgency      |
//! | 24-31 | strategic directives |
//!
//! Policies are trained on the full layout. Only attack, form-up and retreat
//! signals are emitted, so the support band stays zero.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Length of an aggregated signal vector
pub const SIGNAL_DIM: usize = 32;

/// Highest signal priority
pub const PRIORITY_HIGHEST: u8 = 1;

/// Lowest signal priority
pub const PRIORITY_LOWEST: u8 = 10;

/// Kind of pack signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    AttackTarget,
    Retreat,
    FormUp,
}

impl SignalType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::AttackTarget => "attack_target",
            SignalType::Retreat => "retreat_call",
            SignalType::FormUp => "formation_command",
        }
    }
}

/// Signal about to be broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingSignal {
    pub signal_type: SignalType,
    /// 1 (highest) to 10 (lowest)
    pub priority: u8,
    /// Threat, urgency or directive strength in 0..1
    pub intensity: f32,
}

impl OutgoingSignal {
    pub fn new(signal_type: SignalType, priority: u8, intensity: f32) -> Self {
        Self {
            signal_type,
            priority: priority.clamp(PRIORITY_HIGHEST, PRIORITY_LOWEST),
            intensity: intensity.clamp(0.0, 1.0),
        }
    }
}

/// A signal held for a receiver
#[derive(Debug, Clone)]
pub struct Signal {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub signal_type: SignalType,
    pub priority: u8,
    pub intensity: f32,
    pub sent_at: Instant,
}

impl Signal {
    /// Influence weight: priority 1 maps to 1.0, priority 10 to 0.0
    pub fn priority_weight(&self) -> f32 {
        1.0 - (self.priority.saturating_sub(1)) as f32 / 9.0
    }
}

/// Coordinator counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalStats {
    pub signals_sent: u64,
    pub signals_received: u64,
    pub signals_aggregated: u64,
    pub signals_out_of_range: u64,
    pub signals_expired: u64,
    pub pending_signals: usize,
    pub signal_range: u32,
    pub signal_ttl_secs: u64,
}

#[derive(Default)]
struct CoordinatorState {
    inboxes: HashMap<i64, Vec<Signal>>,
    stats: SignalStats,
}

/// Range- and TTL-bounded signal store shared by one engine.
pub struct SignalCoordinator {
    signal_range: u32,
    signal_ttl: Duration,
    state: Mutex<CoordinatorState>,
}

impl SignalCoordinator {
    pub fn new(signal_range: u32, signal_ttl_secs: u64) -> Self {
        debug!(signal_range, signal_ttl_secs, "SignalCoordinator initialized");
        Self {
            signal_range,
            signal_ttl: Duration::from_secs(signal_ttl_secs),
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_range(&self, from: (i32, i32), to: (i32, i32)) -> bool {
        let dx = from.0.abs_diff(to.0);
        let dy = from.1.abs_diff(to.1);
        dx.max(dy) <= self.signal_range
    }

    /// Send `signal` from `sender_id` to every recipient within range.
    ///
    /// The sender is skipped. A newer signal of the same type from the same
    /// sender replaces the older one. Returns the number of receivers.
    pub fn broadcast(
        &self,
        sender_id: i64,
        sender_position: (i32, i32),
        signal: &OutgoingSignal,
        recipients: &[(i64, (i32, i32))],
    ) -> usize {
        let mut state = self.state();
        let now = Instant::now();
        let mut sent = 0;

        for &(receiver_id, position) in recipients {
            if receiver_id == sender_id {
                continue;
            }
            if !self.in_range(sender_position, position) {
                state.stats.signals_out_of_range += 1;
                continue;
            }

            let inbox = state.inboxes.entry(receiver_id).or_default();
            inbox.retain(|s| !(s.sender_id == sender_id && s.signal_type == signal.signal_type));
            inbox.push(Signal {
                sender_id,
                receiver_id,
                signal_type: signal.signal_type,
                priority: signal.priority,
                intensity: signal.intensity,
                sent_at: now,
            });
            sent += 1;
        }

        state.stats.signals_sent += sent as u64;
        debug!(
            sender_id,
            signal_type = signal.signal_type.as_str(),
            sent,
            "Broadcast pack signal"
        );
        sent
    }

    /// Live signals for a monster, highest priority first
    pub fn receive(&self, monster_id: i64) -> Vec<Signal> {
        let mut state = self.state();
        let mut signals: Vec<Signal> = state
            .inboxes
            .get(&monster_id)
            .map(|inbox| {
                inbox
                    .iter()
                    .filter(|s| s.sent_at.elapsed() < self.signal_ttl)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        signals.sort_by_key(|s| s.priority);
        state.stats.signals_received += signals.len() as u64;
        signals
    }

    /// Fold a monster's live signals into a signal vector
    pub fn signal_vector(&self, monster_id: i64) -> [f32; SIGNAL_DIM] {
        let signals = self.receive(monster_id);
        self.state().stats.signals_aggregated += 1;
        aggregate_to_vector(&signals)
    }

    /// Drop expired signals, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.state();
        let ttl = self.signal_ttl;
        let mut removed = 0;
        state.inboxes.retain(|_, inbox| {
            let before = inbox.len();
            inbox.retain(|s| s.sent_at.elapsed() < ttl);
            removed += before - inbox.len();
            !inbox.is_empty()
        });
        state.stats.signals_expired += removed as u64;
        if removed > 0 {
            debug!(removed, "Expired pack signals");
        }
        removed
    }

    pub fn statistics(&self) -> SignalStats {
        let state = self.state();
        SignalStats {
            pending_signals: state.inboxes.values().map(Vec::len).sum(),
            signal_range: self.signal_range,
            signal_ttl_secs: self.signal_ttl.as_secs(),
            ..state.stats.clone()
        }
    }
}

const FORM_UP_DIM: usize = 15;
const RETREAT_DIM: usize = 24;

fn band(value: f32) -> usize {
    ((value.clamp(0.0, 1.0) * 7.0) as usize).min(7)
}

/// Aggregate signals into a fixed-size vector.
///
/// Stronger and higher-priority signals win when several land on the same
/// dimension. Values stay in 0..1.
pub fn aggregate_to_vector(signals: &[Signal]) -> [f32; SIGNAL_DIM] {
    let mut vector = [0.0f32; SIGNAL_DIM];

    for signal in signals {
        let weight = signal.priority_weight();
        match signal.signal_type {
            SignalType::AttackTarget => {
                let idx = band(signal.intensity);
                vector[idx] = vector[idx].max(weight);
            }
            SignalType::FormUp => {
                vector[FORM_UP_DIM] = vector[FORM_UP_DIM].max(weight);
            }
            SignalType::Retreat => {
                vector[RETREAT_DIM] = vector[RETREAT_DIM].max((weight * signal.intensity).min(1.0));
            }
        }
    }

    if vector.iter().any(|v| !v.is_finite()) {
        warn!("Non-finite signal vector component, zeroing");
        return [0.0; SIGNAL_DIM];
    }
    vector
}

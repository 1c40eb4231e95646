//! In-process counters and gauges.
//!
//! Series are keyed by name plus sorted labels, e.g.
//! `inference_requests_total{archetype="tank",cache="miss"}`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

pub const REQUESTS_TOTAL: &str = "inference_requests_total";
pub const REQUEST_LATENCY_MS: &str = "inference_latency_ms_sum";
pub const BATCHES_TOTAL: &str = "inference_batches_total";
pub const FALLBACK_LEVEL: &str = "fallback_level";
pub const CACHE_HIT_RATE: &str = "cache_hit_rate";
pub const CACHE_ENTRIES: &str = "cache_entries";
pub const MEMORY_PERCENT: &str = "host_memory_percent";
pub const CPU_PERCENT: &str = "host_cpu_percent";
pub const UPTIME_SECONDS: &str = "uptime_seconds";

#[derive(Default)]
struct Series {
    counters: BTreeMap<String, f64>,
    gauges: BTreeMap<String, f64>,
}

/// Point-in-time copy of every series
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, f64>,
    pub gauges: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.counters
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.get(&series_key(name, labels)).copied()
    }
}

/// Metrics registry shared between the orchestrator and the HTTP surface
pub struct Metrics {
    started_at: Instant,
    series: Mutex<Series>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            series: Mutex::new(Series::default()),
        }
    }

    fn series(&self) -> MutexGuard<'_, Series> {
        self.series.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add `by` to a counter
    pub fn increment(&self, name: &str, labels: &[(&str, &str)], by: f64) {
        *self
            .series()
            .counters
            .entry(series_key(name, labels))
            .or_insert(0.0) += by;
    }

    /// Overwrite a gauge
    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.series()
            .gauges
            .insert(series_key(name, labels), value);
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let series = self.series();
        MetricsSnapshot {
            counters: series.counters.clone(),
            gauges: series.gauges.clone(),
        }
    }
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut labels = labels.to_vec();
    labels.sort_unstable();
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{name}{{{}}}", rendered.join(","))
}

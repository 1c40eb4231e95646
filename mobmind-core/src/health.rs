//! Host resource health.

use serde::Serialize;
use std::sync::Mutex;
use sysinfo::System;
use tracing::warn;

/// Coarse health verdict, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

/// Memory/CPU thresholds in percent
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub cpu_warning: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            memory_warning: 75.0,
            memory_critical: 90.0,
            cpu_warning: 90.0,
        }
    }
}

/// One resource sample
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub status: HealthStatus,
    pub memory_percent: f64,
    pub used_memory_mb: u64,
    pub total_memory_mb: u64,
    pub swap_percent: f64,
    pub cpu_percent: f64,
}

/// Samples host memory and CPU usage.
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    system: Mutex<System>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            thresholds,
            system: Mutex::new(system),
        }
    }

    /// Refresh and classify current resource usage
    pub fn sample(&self) -> HealthSample {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        let used = system.used_memory();
        let total_swap = system.total_swap();
        let used_swap = system.used_swap();
        let cpu_percent = f64::from(system.global_cpu_usage());

        let memory_percent = percent(used, total);
        let status = self.classify(memory_percent, cpu_percent);
        if !status.is_healthy() {
            warn!(
                status = status.as_str(),
                memory_percent, cpu_percent, "Host resources under pressure"
            );
        }

        HealthSample {
            status,
            memory_percent,
            used_memory_mb: used / 1024 / 1024,
            total_memory_mb: total / 1024 / 1024,
            swap_percent: percent(used_swap, total_swap),
            cpu_percent,
        }
    }

    /// Verdict for the given usage figures
    pub fn classify(&self, memory_percent: f64, cpu_percent: f64) -> HealthStatus {
        if memory_percent > self.thresholds.memory_critical {
            HealthStatus::Critical
        } else if memory_percent > self.thresholds.memory_warning
            || cpu_percent > self.thresholds.cpu_warning
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let monitor = HealthMonitor::default();
        assert_eq!(monitor.classify(10.0, 10.0), HealthStatus::Healthy);
        assert_eq!(monitor.classify(80.0, 10.0), HealthStatus::Degraded);
        assert_eq!(monitor.classify(10.0, 95.0), HealthStatus::Degraded);
        assert_eq!(monitor.classify(95.0, 10.0), HealthStatus::Critical);
    }

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Critical > HealthStatus::Degraded);
        assert_eq!(
            HealthStatus::Healthy.max(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(HealthStatus::Critical.as_str(), "critical");
    }

    #[test]
    fn test_sample_reports_sane_values() {
        let sample = HealthMonitor::default().sample();
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!(sample.used_memory_mb <= sample.total_memory_mb);
    }

    #[test]
    fn test_percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}

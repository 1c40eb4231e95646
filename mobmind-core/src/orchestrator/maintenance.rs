//! Periodic work run between ticks: retention cleanup, health checks and
//! metric gauges. Each task has its own interval and runs at most once per
//! tick, whether or not the tick found work.

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{BatchOrchestrator, with_timeout};
use crate::metrics;

pub(crate) struct MaintenanceClock {
    last_cleanup: Instant,
    last_health: Instant,
    last_metrics: Instant,
}

impl MaintenanceClock {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            last_cleanup: now,
            last_health: now,
            last_metrics: now,
        }
    }
}

/// Mark `last` as now if `every` has elapsed
fn due(last: &mut Instant, every: Duration) -> bool {
    if last.elapsed() >= every {
        *last = Instant::now();
        true
    } else {
        false
    }
}

/// What one cleanup pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub requests: usize,
    pub responses: usize,
    pub reclaimed: usize,
    pub signals: usize,
    pub cache_entries: usize,
    pub graph_entries: usize,
}

impl CleanupReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl BatchOrchestrator {
    pub(crate) async fn run_maintenance(&mut self) {
        let m = &self.config.maintenance;
        let cleanup_every = Duration::from_secs(m.cleanup_interval_secs);
        let health_every = Duration::from_secs(m.health_check_interval_secs);
        let metrics_every = Duration::from_secs(m.metrics_interval_secs);

        if due(&mut self.clock.last_cleanup, cleanup_every) {
            self.run_cleanup().await;
        }
        if due(&mut self.clock.last_health, health_every) {
            self.run_health_check();
        }
        if due(&mut self.clock.last_metrics, metrics_every) {
            self.update_metrics();
        }
    }

    /// Drop expired queue rows, pack signals, cache entries and graph state,
    /// and return stale claims to the queue.
    ///
    /// Failures are logged; the remaining steps still run.
    pub async fn run_cleanup(&self) -> CleanupReport {
        let hours = self.config.maintenance.retention_hours;
        let mut report = CleanupReport::default();

        match with_timeout(
            self.timeout,
            "queue.cleanup_old_requests",
            self.queue.cleanup_old_requests(hours),
        )
        .await
        {
            Ok(n) => report.requests = n,
            Err(e) => warn!(error = %e, "Request cleanup failed"),
        }

        match with_timeout(
            self.timeout,
            "queue.cleanup_old_responses",
            self.queue.cleanup_old_responses(hours),
        )
        .await
        {
            Ok(n) => report.responses = n,
            Err(e) => warn!(error = %e, "Response cleanup failed"),
        }

        match with_timeout(
            self.timeout,
            "queue.reclaim_stale",
            self.queue.reclaim_stale(self.config.maintenance.stale_claim_after()),
        )
        .await
        {
            Ok(n) => report.reclaimed = n,
            Err(e) => warn!(error = %e, "Stale claim recovery failed"),
        }

        report.signals = self.engine.cleanup_signals();

        if let Some(cache) = &self.cache {
            match with_timeout(self.timeout, "cache.evict_expired", cache.evict_expired()).await {
                Ok(n) => report.cache_entries = n,
                Err(e) => warn!(error = %e, "Cache eviction failed"),
            }
        }

        if let Some(graph) = &self.graph {
            match with_timeout(self.timeout, "graph.cleanup_stale", graph.cleanup_stale(hours)).await {
                Ok(n) => report.graph_entries = n,
                Err(e) => warn!(error = %e, "Graph cleanup failed"),
            }
        }

        if report.is_empty() {
            debug!("Cleanup found nothing to remove");
        } else {
            info!(
                requests = report.requests,
                responses = report.responses,
                reclaimed = report.reclaimed,
                signals = report.signals,
                cache_entries = report.cache_entries,
                graph_entries = report.graph_entries,
                "Cleanup complete"
            );
        }
        report
    }

    /// Sample host resources and let the fallback handler try to recover.
    ///
    /// Returns whether the fallback level changed.
    pub fn run_health_check(&self) -> bool {
        if let Some(monitor) = &self.health {
            let sample = monitor.sample();
            self.metrics
                .set_gauge(metrics::MEMORY_PERCENT, &[], sample.memory_percent);
            self.metrics
                .set_gauge(metrics::CPU_PERCENT, &[], sample.cpu_percent);
        }

        let old = self.fallback.current_level();
        let changed = self.fallback.check_and_update_level();
        let new = self.fallback.current_level();
        if changed {
            warn!(
                old_level = old.value(),
                new_level = new.value(),
                "Fallback level changed: {} -> {}",
                old.name(),
                new.name()
            );
        }
        self.metrics
            .set_gauge(metrics::FALLBACK_LEVEL, &[], f64::from(new.value()));
        changed
    }

    /// Refresh cache and uptime gauges; log a summary every N batches
    pub fn update_metrics(&self) {
        let cache_stats = self.cache.as_ref().map(|c| c.stats());
        if let Some(stats) = &cache_stats {
            self.metrics
                .set_gauge(metrics::CACHE_HIT_RATE, &[], stats.hit_rate);
            self.metrics
                .set_gauge(metrics::CACHE_ENTRIES, &[], stats.entries as f64);
        }
        self.metrics
            .set_gauge(metrics::UPTIME_SECONDS, &[], self.metrics.uptime_seconds());

        let every = self.config.maintenance.stats_log_every_batches;
        let batches = self.counters.batch_count;
        if every > 0 && batches > 0 && batches % every == 0 {
            let engine = self.engine.statistics();
            info!(
                requests_processed = self.counters.requests_processed,
                batches,
                avg_latency_ms = engine.avg_latency_ms,
                cache_hit_rate = cache_stats.map(|s| s.hit_rate).unwrap_or(0.0),
                fallback_level = self.fallback.current_level().value(),
                error_fallbacks = self.counters.error_fallbacks,
                "Service statistics"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fakes::*;
    use super::*;
    use crate::config::ServiceConfig;
    use crate::fallback::{FallbackControl, FallbackLevel};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_due() {
        let mut last = Instant::now();
        assert!(!due(&mut last, Duration::from_secs(60)));
        assert!(due(&mut last, Duration::ZERO));
    }

    #[tokio::test]
    async fn test_cleanup_report() {
        let harness = Harness::new(ServiceConfig::default());
        let report = harness.orchestrator.run_cleanup().await;
        assert_eq!(
            report,
            CleanupReport {
                requests: 2,
                responses: 3,
                reclaimed: 4,
                signals: 1,
                cache_entries: 0,
                graph_entries: 6,
            }
        );
    }

    #[tokio::test]
    async fn test_cleanup_survives_cache_failure() {
        let harness = Harness::with_cache(ServiceConfig::default(), std::sync::Arc::new(FailingCache));
        let report = harness.orchestrator.run_cleanup().await;
        assert_eq!(report.requests, 2);
        assert_eq!(report.cache_entries, 0);
    }

    #[tokio::test]
    async fn test_health_check_publishes_gauges() {
        let harness = Harness::new(ServiceConfig::default());
        harness.fallback.force_level(FallbackLevel::Fp16);

        assert!(!harness.orchestrator.run_health_check());

        let snapshot = harness.metrics.snapshot();
        assert_eq!(snapshot.gauge(metrics::FALLBACK_LEVEL, &[]), Some(1.0));
        assert!(snapshot.gauge(metrics::MEMORY_PERCENT, &[]).is_some());
    }

    #[tokio::test]
    async fn test_update_metrics_sets_cache_gauges() {
        let harness = Harness::new(ServiceConfig::default());
        harness.orchestrator.update_metrics();

        let snapshot = harness.metrics.snapshot();
        assert_eq!(snapshot.gauge(metrics::CACHE_ENTRIES, &[]), Some(0.0));
        assert!(snapshot.gauge(metrics::UPTIME_SECONDS, &[]).is_some());
    }

    #[tokio::test]
    async fn test_maintenance_runs_on_idle_ticks() {
        let mut config = ServiceConfig::default();
        config.maintenance.cleanup_interval_secs = 0;
        config.maintenance.health_check_interval_secs = 0;
        let mut harness = Harness::new(config);

        assert_eq!(harness.orchestrator.run_tick().await.unwrap(), 0);

        assert_eq!(harness.queue.cleanups.load(Ordering::SeqCst), 3);
        assert!(harness.metrics.snapshot().gauge(metrics::FALLBACK_LEVEL, &[]).is_some());
    }

    #[tokio::test]
    async fn test_intervals_not_elapsed_skip_work() {
        let mut harness = Harness::new(ServiceConfig::default());
        harness.orchestrator.run_tick().await.unwrap();
        assert_eq!(harness.queue.cleanups.load(Ordering::SeqCst), 0);
    }
}

//! Action cache keyed by `(monster_id, state_vector)` fingerprints.
//!
//! A lookup that fails for any reason is a miss; callers never see a cache
//! error on the hot path unless they ask for it.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// A cached decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedAction {
    pub action_id: u8,
    pub confidence: f32,
}

/// Cache counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

/// Fingerprint-keyed action cache.
#[async_trait]
pub trait ActionCache: Send + Sync {
    /// Look up a decision for this monster and state
    async fn lookup(&self, monster_id: i64, state: &[f32]) -> Result<Option<CachedAction>>;

    /// Store a decision for this monster and state
    async fn store(&self, monster_id: i64, state: &[f32], action: CachedAction) -> Result<()>;

    /// Drop expired entries, returning how many were removed
    async fn evict_expired(&self) -> Result<usize>;

    fn stats(&self) -> CacheStats;

    /// Whether the backend is reachable
    fn health_check(&self) -> bool;

    /// Release backend resources
    async fn close(&self) {}
}

/// Compute the cache key for a monster state.
///
/// Each feature is rounded to `1 / quantization` so float jitter does not
/// defeat the cache.
pub fn fingerprint(monster_id: i64, state: &[f32], quantization: u32) -> String {
    let scale = quantization.max(1) as f32;
    let mut hasher = Sha256::new();
    hasher.update(monster_id.to_le_bytes());
    for value in state {
        let quantized = (value * scale).round() as i64;
        hasher.update(quantized.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

struct CacheEntry {
    action: CachedAction,
    inserted_at: Instant,
}

/// In-process TTL cache.
///
/// When full, the oldest entry is evicted on insert.
pub struct MemoryCache {
    ttl: Duration,
    max_entries: usize,
    quantization: u32,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries.max(1),
            quantization: config.quantization,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn key(&self, monster_id: i64, state: &[f32]) -> String {
        fingerprint(monster_id, state, self.quantization)
    }

    fn miss(&self) -> Result<Option<CachedAction>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }
}

#[async_trait]
impl ActionCache for MemoryCache {
    async fn lookup(&self, monster_id: i64, state: &[f32]) -> Result<Option<CachedAction>> {
        let key = self.key(monster_id, state);
        let entries = self.entries.read().map_err(|_| Error::LockPoisoned)?;

        match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.action))
            }
            _ => self.miss(),
        }
    }

    async fn store(&self, monster_id: i64, state: &[f32], action: CachedAction) -> Result<()> {
        let key = self.key(monster_id, state);
        let mut entries = self.entries.write().map_err(|_| Error::LockPoisoned)?;

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                action,
                inserted_at: Instant::now(),
            },
        );
        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize> {
        let mut entries = self.entries.write().map_err(|_| Error::LockPoisoned)?;
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Evicted expired cache entries");
        }
        Ok(removed)
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.read().map(|e| e.len()).unwrap_or(0),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    fn health_check(&self) -> bool {
        self.entries.read().is_ok()
    }

    async fn close(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

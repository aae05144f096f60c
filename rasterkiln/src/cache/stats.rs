//! Cache activity counters and snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Live activity counters, updated lock-free by cache operations.
#[derive(Debug)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    busy: AtomicU64,
    evictions: AtomicU64,
    discards: AtomicU64,
    swap_outs: AtomicU64,
    swap_ins: AtomicU64,
    swap_failures: AtomicU64,
    invalidated: AtomicU64,
    checkpoints: AtomicU64,
    peak_bytes: AtomicU64,
    started: Instant,
}

impl CacheStats {
    pub fn new() -> Self {
        CacheStats {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            created: AtomicU64::new(0),
            busy: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
            swap_failures: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swap_out(&self) {
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swap_in(&self) {
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swap_failure(&self) {
        self.swap_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidated(&self, count: u64) {
        self.invalidated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    /// Track the high-water mark of resident bytes.
    pub fn observe_bytes(&self, bytes: u64) {
        self.peak_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate over lookups that found or missed a tile, as a
    /// percentage. Zero before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        }
    }
}

impl Default for CacheStats {
    fn default() -> Self {
        CacheStats::new()
    }
}

/// Point-in-time snapshot of cache state, suitable for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
    pub created: u64,
    pub busy_encounters: u64,
    pub evictions: u64,
    pub discards: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub swap_failures: u64,
    pub invalidated: u64,
    pub checkpoints: u64,
    pub resident_tiles: usize,
    pub resident_bytes: usize,
    pub peak_bytes: u64,
    pub pinned_tiles: usize,
    pub max_bytes: usize,
    pub uptime_secs: u64,
}

impl CacheStatistics {
    pub(crate) fn from_stats(
        stats: &CacheStats,
        resident_tiles: usize,
        resident_bytes: usize,
        pinned_tiles: usize,
        max_bytes: usize,
    ) -> Self {
        CacheStatistics {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            hit_rate_pct: stats.hit_rate(),
            created: stats.created.load(Ordering::Relaxed),
            busy_encounters: stats.busy.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            discards: stats.discards.load(Ordering::Relaxed),
            swap_outs: stats.swap_outs.load(Ordering::Relaxed),
            swap_ins: stats.swap_ins.load(Ordering::Relaxed),
            swap_failures: stats.swap_failures.load(Ordering::Relaxed),
            invalidated: stats.invalidated.load(Ordering::Relaxed),
            checkpoints: stats.checkpoints.load(Ordering::Relaxed),
            resident_tiles,
            resident_bytes,
            peak_bytes: stats.peak_bytes.load(Ordering::Relaxed),
            pinned_tiles,
            max_bytes,
            uptime_secs: stats.started.elapsed().as_secs(),
        }
    }

    /// Multi-line human-readable report.
    pub fn format(&self) -> String {
        format!(
            "Tile Cache Statistics\n\
             ---------------------\n\
             Lookups:      {} hits / {} misses ({:.1}% hit rate)\n\
             Created:      {} tiles ({} busy encounters)\n\
             Resident:     {} tiles, {} / {} bytes (peak {})\n\
             Pinned:       {} tiles\n\
             Evictions:    {} ({} discards, {} invalidated)\n\
             Swap:         {} out / {} in ({} failures)\n\
             Checkpoints:  {}\n\
             Uptime:       {}s",
            self.hits,
            self.misses,
            self.hit_rate_pct,
            self.created,
            self.busy_encounters,
            self.resident_tiles,
            self.resident_bytes,
            self.max_bytes,
            self.peak_bytes,
            self.pinned_tiles,
            self.evictions,
            self.discards,
            self.invalidated,
            self.swap_outs,
            self.swap_ins,
            self.swap_failures,
            self.checkpoints,
            self.uptime_secs,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Raw statistics counters.
//!
//! The engine maintains plain counters; percentage formatting and JSON
//! shaping happen in the presentation layer.

use serde::Serialize;

/// Per-direction request and block counters for one I/O target.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct IoCounters {
    pub read_requests: u64,
    pub write_requests: u64,
    pub read_blocks: u64,
    pub write_blocks: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

impl IoCounters {
    pub fn total_requests(&self) -> u64 {
        self.read_requests + self.write_requests
    }

    pub fn total_blocks(&self) -> u64 {
        self.read_blocks + self.write_blocks
    }

    pub fn total_errors(&self) -> u64 {
        self.read_errors + self.write_errors
    }
}

/// Counters kept per core.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CoreCounters {
    /// I/O served through the cache.
    pub cached: IoCounters,
    /// I/O that bypassed the cache (pass-through mode, detached cache).
    pub pass_through: IoCounters,
    /// Blocks moved against the core volume.
    pub core_volume: IoCounters,
    /// Blocks moved against the cache volume.
    pub cache_volume: IoCounters,
    pub flush_requests: u64,
    pub discard_requests: u64,
}

/// Usage snapshot in cache lines.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct UsageCounters {
    pub occupancy: u64,
    pub free: u64,
    pub clean: u64,
    pub dirty: u64,
}

/// Full snapshot for one core or one whole cache.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub usage: UsageCounters,
    pub counters: CoreCounters,
}

impl StatsSnapshot {
    /// Fold another snapshot into this one (cache totals over cores).
    pub fn absorb(&mut self, other: &StatsSnapshot) {
        self.usage.occupancy += other.usage.occupancy;
        self.usage.clean += other.usage.clean;
        self.usage.dirty += other.usage.dirty;
        let fold = |a: &mut IoCounters, b: &IoCounters| {
            a.read_requests += b.read_requests;
            a.write_requests += b.write_requests;
            a.read_blocks += b.read_blocks;
            a.write_blocks += b.write_blocks;
            a.read_errors += b.read_errors;
            a.write_errors += b.write_errors;
        };
        fold(&mut self.counters.cached, &other.counters.cached);
        fold(&mut self.counters.pass_through, &other.counters.pass_through);
        fold(&mut self.counters.core_volume, &other.counters.core_volume);
        fold(&mut self.counters.cache_volume, &other.counters.cache_volume);
        self.counters.flush_requests += other.counters.flush_requests;
        self.counters.discard_requests += other.counters.discard_requests;
    }
}

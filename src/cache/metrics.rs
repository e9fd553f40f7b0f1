//! Cache Metrics Collection
//!
//! Counters for tier selection, nexus residency, and disk traffic.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::store::CacheType;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Tier opens
    memory_opens: AtomicU64,
    map_opens: AtomicU64,
    disk_opens: AtomicU64,
    open_failures: AtomicU64,

    // Nexus residency
    in_core_hits: AtomicU64,
    staged_requests: AtomicU64,
    virtual_pixels: AtomicU64,

    // Store lifecycle
    clones: AtomicU64,
    copy_on_writes: AtomicU64,
    persists: AtomicU64,

    // Disk traffic
    disk_bytes_read: AtomicU64,
    disk_bytes_written: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // Tier opens
    pub fn record_open(&self, cache_type: CacheType) {
        let counter = match cache_type {
            CacheType::Memory => &self.memory_opens,
            CacheType::Map => &self.map_opens,
            CacheType::Disk => &self.disk_opens,
            CacheType::Undefined => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn opens(&self, cache_type: CacheType) -> u64 {
        match cache_type {
            CacheType::Memory => self.memory_opens.load(Ordering::Relaxed),
            CacheType::Map => self.map_opens.load(Ordering::Relaxed),
            CacheType::Disk => self.disk_opens.load(Ordering::Relaxed),
            CacheType::Undefined => 0,
        }
    }

    // Nexus residency
    pub fn record_in_core(&self) {
        self.in_core_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_staged(&self) {
        self.staged_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_virtual_pixel(&self) {
        self.virtual_pixels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_core_hits(&self) -> u64 {
        self.in_core_hits.load(Ordering::Relaxed)
    }

    pub fn staged_requests(&self) -> u64 {
        self.staged_requests.load(Ordering::Relaxed)
    }

    pub fn virtual_pixels(&self) -> u64 {
        self.virtual_pixels.load(Ordering::Relaxed)
    }

    /// Fraction of nexus requests served without a private buffer
    pub fn in_core_ratio(&self) -> f64 {
        let hits = self.in_core_hits() as f64;
        let total = hits + self.staged_requests() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    // Store lifecycle
    pub fn record_clone(&self) {
        self.clones.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_copy_on_write(&self) {
        self.copy_on_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist(&self) {
        self.persists.fetch_add(1, Ordering::Relaxed);
    }

    pub fn copy_on_writes(&self) -> u64 {
        self.copy_on_writes.load(Ordering::Relaxed)
    }

    // Disk traffic
    pub fn record_disk_read(&self, bytes: u64) {
        self.disk_bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_disk_write(&self, bytes: u64) {
        self.disk_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_opens: self.memory_opens.load(Ordering::Relaxed),
            map_opens: self.map_opens.load(Ordering::Relaxed),
            disk_opens: self.disk_opens.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            in_core_hits: self.in_core_hits(),
            staged_requests: self.staged_requests(),
            in_core_ratio: self.in_core_ratio(),
            virtual_pixels: self.virtual_pixels(),
            clones: self.clones.load(Ordering::Relaxed),
            copy_on_writes: self.copy_on_writes(),
            persists: self.persists.load(Ordering::Relaxed),
            disk_bytes_read: self.disk_bytes_read.load(Ordering::Relaxed),
            disk_bytes_written: self.disk_bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.memory_opens,
            &self.map_opens,
            &self.disk_opens,
            &self.open_failures,
            &self.in_core_hits,
            &self.staged_requests,
            &self.virtual_pixels,
            &self.clones,
            &self.copy_on_writes,
            &self.persists,
            &self.disk_bytes_read,
            &self.disk_bytes_written,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    // Tier opens
    pub memory_opens: u64,
    pub map_opens: u64,
    pub disk_opens: u64,
    pub open_failures: u64,

    // Nexus residency
    pub in_core_hits: u64,
    pub staged_requests: u64,
    pub in_core_ratio: f64,
    pub virtual_pixels: u64,

    // Store lifecycle
    pub clones: u64,
    pub copy_on_writes: u64,
    pub persists: u64,

    // Disk traffic
    pub disk_bytes_read: u64,
    pub disk_bytes_written: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.in_core_hits(), 0);
        assert_eq!(metrics.in_core_ratio(), 0.0);
    }

    #[test]
    fn test_record_opens() {
        let metrics = CacheMetrics::new();
        metrics.record_open(CacheType::Memory);
        metrics.record_open(CacheType::Disk);
        metrics.record_open(CacheType::Disk);
        metrics.record_open(CacheType::Undefined);

        assert_eq!(metrics.opens(CacheType::Memory), 1);
        assert_eq!(metrics.opens(CacheType::Map), 0);
        assert_eq!(metrics.opens(CacheType::Disk), 2);
    }

    #[test]
    fn test_in_core_ratio() {
        let metrics = CacheMetrics::new();
        for _ in 0..3 {
            metrics.record_in_core();
        }
        metrics.record_staged();
        assert!((metrics.in_core_ratio() - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_disk_read(64);
        metrics.record_disk_write(128);
        metrics.record_copy_on_write();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.disk_bytes_read, 64);
        assert_eq!(snapshot.disk_bytes_written, 128);
        assert_eq!(snapshot.copy_on_writes, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot().disk_bytes_read, 0);
    }
}

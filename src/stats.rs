//! Device-wide counters.
//!
//! [`DeviceStats`] is a lock-free bundle of atomics shared by the device and
//! every zone. Zones feed the byte counters from the append path, the
//! allocator records placements and gauges, and the migration caller credits
//! per-class data movement. [`DeviceStats::snapshot`] produces a plain
//! serializable struct for logging or export; there is no metrics backend
//! here.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::lifetime::IoType;

/// Counters maintained by the device and its zones.
#[derive(Debug)]
pub struct DeviceStats {
    bytes_written: AtomicU64,
    wal_allocations: AtomicU64,
    l0_allocations: AtomicU64,
    other_allocations: AtomicU64,
    zone_resets: AtomicU64,
    zones_finished: AtomicU64,
    open_io_zones: AtomicI64,
    active_io_zones: AtomicI64,
    gc_bytes_written: Vec<AtomicU64>,
}

impl DeviceStats {
    /// Creates a counter set for a device with `level_count` lifetime
    /// classes.
    pub fn new(level_count: u32) -> Self {
        Self {
            bytes_written: AtomicU64::new(0),
            wal_allocations: AtomicU64::new(0),
            l0_allocations: AtomicU64::new(0),
            other_allocations: AtomicU64::new(0),
            zone_resets: AtomicU64::new(0),
            zones_finished: AtomicU64::new(0),
            open_io_zones: AtomicI64::new(0),
            active_io_zones: AtomicI64::new(0),
            gc_bytes_written: (0..level_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation(&self, io_type: IoType) {
        let counter = match io_type {
            IoType::Wal => &self.wal_allocations,
            IoType::L0 => &self.l0_allocations,
            IoType::Other => &self.other_allocations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reset(&self) {
        self.zone_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finish(&self) {
        self.zones_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_zone_gauges(&self, open: i64, active: i64) {
        self.open_io_zones.store(open, Ordering::Relaxed);
        self.active_io_zones.store(active, Ordering::Relaxed);
    }

    /// Credits migrated bytes to the lifetime class they were moved for.
    /// Out-of-range classes are ignored.
    pub fn add_gc_bytes_written(&self, class: u32, n: u64) {
        if let Some(counter) = self.gc_bytes_written.get(class as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        let gc_bytes_written: Vec<u64> = self
            .gc_bytes_written
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        DeviceStatsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            wal_allocations: self.wal_allocations.load(Ordering::Relaxed),
            l0_allocations: self.l0_allocations.load(Ordering::Relaxed),
            other_allocations: self.other_allocations.load(Ordering::Relaxed),
            zone_resets: self.zone_resets.load(Ordering::Relaxed),
            zones_finished: self.zones_finished.load(Ordering::Relaxed),
            open_io_zones: self.open_io_zones.load(Ordering::Relaxed),
            active_io_zones: self.active_io_zones.load(Ordering::Relaxed),
            gc_bytes_written_total: gc_bytes_written.iter().sum(),
            gc_bytes_written,
        }
    }
}

/// Serializable snapshot of [`DeviceStats`].
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatsSnapshot {
    pub bytes_written: u64,
    pub wal_allocations: u64,
    pub l0_allocations: u64,
    pub other_allocations: u64,
    pub zone_resets: u64,
    pub zones_finished: u64,
    pub open_io_zones: i64,
    pub active_io_zones: i64,
    pub gc_bytes_written: Vec<u64>,
    pub gc_bytes_written_total: u64,
}

//! # Zoned Device Core
//!
//! [`ZonedDevice`] owns everything the allocator needs: the backend
//! transport, the meta and IO zone handles, the open/active token counters,
//! the per-lifetime level pools, the GC lane and the deferred-error latch.
//!
//! ## Concurrency
//!
//! The design runs on plain OS threads. A single mutex/condvar pair
//! (`pools` / `pool_resources`) guards the token counters, the pool
//! membership sets and the `available` counts; it is the one admission
//! point writers block on. Per-zone mutual exclusion is the zone's own
//! `busy` lease, always taken outside the pool mutex, so zone I/O never
//! serialises unrelated writers. The GC lane and the error latch have their
//! own small mutexes and no ordering relationship with the pool mutex.
//!
//! The module is split by concern, mirroring the component layout:
//!
//! - [`tokens`]: counted open/active semaphores
//! - [`pools`]: level-pool membership and hand-off
//! - [`allocator`]: zone placement
//! - [`reclaim`]: reset and finish policies
//! - [`gc`]: the migration lane
//! - [`snapshot`]: debug snapshots and JSON encoding

mod allocator;
mod gc;
mod pools;
mod reclaim;
mod snapshot;
mod tokens;

pub use pools::EmitOutcome;
pub use snapshot::ZoneSnapshot;

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::backend::{AnyBackend, BlockDevBackend, ZoneBackend, ZoneFsBackend};
use crate::config::{BackendKind, DeviceOptions};
use crate::error::{Result, ZbdError};
use crate::lifetime::Lifetime;
use crate::stats::DeviceStats;
use crate::zone::Zone;

use gc::GcLane;

/// Number of zone slots reserved for the filesystem metadata log. Two are
/// needed to roll the log safely, one more covers a zone going offline.
pub const META_ZONE_COUNT: usize = 3;

/// Minimum zone count for which this layout makes sense.
pub const MIN_ZONE_COUNT: u32 = 32;

/// Zones held back from the device limits: one for metadata, one for
/// extent migration.
pub const RESERVED_ZONE_COUNT: u32 = 2;

/// File id of the filesystem metadata file. Unhinted writes for it are
/// steered to class 0 instead of the highest class.
pub const METADATA_FILE_ID: u64 = 5;

/// A zoned block device with admission control, lifetime-partitioned
/// placement and a dedicated migration lane.
#[derive(Debug)]
pub struct ZonedDevice {
    backend: Arc<AnyBackend>,
    meta_zones: Vec<Arc<Zone>>,
    io_zones: Vec<Arc<Zone>>,

    max_open_io_zones: i64,
    max_active_io_zones: i64,
    finish_threshold: u32,
    level_count: u32,
    lifetime_begin: Lifetime,
    readonly: bool,

    open_io_zones: AtomicI64,
    active_io_zones: AtomicI64,
    level_available: Vec<AtomicU32>,
    pools: Mutex<Vec<Vec<Arc<Zone>>>>,
    pool_resources: Condvar,

    gc: Mutex<GcLane>,
    deferred: Mutex<Option<ZbdError>>,

    stats: Arc<DeviceStats>,
    start_time: Instant,
}

impl ZonedDevice {
    /// Opens the backing store and mounts the allocator on it.
    ///
    /// Write opens must be exclusive. Zones are walked in index order: the
    /// first [`META_ZONE_COUNT`] sequential-write-required slots become meta
    /// zones (offline ones are skipped but still consume their slot), the
    /// rest become IO zones. Device-reported active zones are counted
    /// against the active limit; zones a previous instance left open are
    /// closed so the device comes up quiescent. Writable mounts then seed
    /// one empty zone per lifetime class.
    pub fn open(options: DeviceOptions, readonly: bool, exclusive: bool) -> Result<ZonedDevice> {
        options.validate()?;

        if !readonly && !exclusive {
            return Err(ZbdError::InvalidArgument(
                "write opens must be exclusive".into(),
            ));
        }

        let backend = match &options.backend {
            BackendKind::BlockDev(path) => {
                AnyBackend::BlockDev(BlockDevBackend::open(path, readonly, exclusive)?)
            }
            BackendKind::ZoneFs(path) => {
                AnyBackend::ZoneFs(ZoneFsBackend::open(path, readonly, exclusive)?)
            }
        };
        let backend = Arc::new(backend);

        let zone_count = backend.zone_count();
        if zone_count < MIN_ZONE_COUNT {
            return Err(ZbdError::NotSupported(format!(
                "too few zones on zoned backend ({MIN_ZONE_COUNT} required, {zone_count} found)"
            )));
        }

        let limits = backend.limits();
        let max_active_io_zones = derive_io_limit(limits.max_active_zones, zone_count)?;
        let max_open_io_zones = derive_io_limit(limits.max_open_zones, zone_count)?;

        info!(
            device = %backend.describe(),
            zones = zone_count,
            max_active = limits.max_active_zones,
            max_open = limits.max_open_zones,
            "opening zoned block device"
        );

        let zone_infos = backend.list_zones()?;
        if zone_infos.len() != zone_count as usize {
            return Err(ZbdError::Io(format!(
                "failed to list zones: got {}, expected {zone_count}",
                zone_infos.len()
            )));
        }

        let stats = Arc::new(DeviceStats::new(options.level_count));

        let mut meta_zones = Vec::with_capacity(META_ZONE_COUNT);
        let mut io_zones = Vec::new();
        let mut active_at_mount: i64 = 0;
        let mut meta_slots = 0usize;

        for info in &zone_infos {
            if !info.swr {
                continue;
            }

            if meta_slots < META_ZONE_COUNT {
                // Offline zones consume a meta slot but are unusable.
                meta_slots += 1;
                if !info.offline {
                    meta_zones.push(Arc::new(Zone::new(
                        info,
                        Arc::clone(&backend),
                        Arc::clone(&stats),
                    )));
                }
                continue;
            }

            if info.offline {
                continue;
            }

            let zone = Arc::new(Zone::new(info, Arc::clone(&backend), Arc::clone(&stats)));
            if !zone.acquire() {
                return Err(ZbdError::Corruption(format!(
                    "failed to set busy flag of zone {}",
                    zone.zone_nr()
                )));
            }
            if info.active {
                active_at_mount += 1;
            }
            if info.open && !readonly {
                zone.close()?;
            }
            zone.check_release()?;
            io_zones.push(zone);
        }

        let level_count = options.level_count;
        let device = ZonedDevice {
            backend,
            meta_zones,
            io_zones,
            max_open_io_zones,
            max_active_io_zones,
            finish_threshold: options.finish_threshold,
            level_count,
            lifetime_begin: options.lifetime_begin,
            readonly,
            open_io_zones: AtomicI64::new(0),
            active_io_zones: AtomicI64::new(active_at_mount),
            level_available: (0..level_count).map(|_| AtomicU32::new(0)).collect(),
            pools: Mutex::new((0..level_count).map(|_| Vec::new()).collect()),
            pool_resources: Condvar::new(),
            gc: Mutex::new(GcLane::default()),
            deferred: Mutex::new(None),
            stats,
            start_time: Instant::now(),
        };

        if !readonly {
            device.initial_level_zones()?;
        }

        Ok(device)
    }

    /// Quiesces the device: releases the GC lane and closes partially
    /// written zones that are not held by a writer or a pool.
    pub fn close(&self) -> Result<()> {
        let (primary, aux) = {
            let mut lane = self.gc.lock();
            (lane.primary.take(), lane.aux.take())
        };
        for zone in [primary, aux].into_iter().flatten() {
            zone.check_release()?;
        }

        for zone in &self.io_zones {
            if zone.acquire() {
                let closed = zone.close();
                let released = zone.check_release();
                closed?;
                released?;
            }
        }
        Ok(())
    }

    /// Sum of remaining writable bytes over all IO zones.
    pub fn free_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.capacity_left()).sum()
    }

    /// Sum of live data bytes over all IO zones.
    pub fn used_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.used_capacity()).sum()
    }

    /// Bytes that a reset of every full zone would recover.
    pub fn reclaimable_space(&self) -> u64 {
        self.io_zones
            .iter()
            .filter(|z| z.is_full())
            .map(|z| z.max_capacity() - z.used_capacity())
            .sum()
    }

    /// The IO zone covering `offset`, if any. Linear scan over the zone
    /// vector.
    pub fn get_io_zone(&self, offset: u64) -> Option<Arc<Zone>> {
        let zone_size = self.backend.zone_size();
        self.io_zones
            .iter()
            .find(|z| z.start() <= offset && offset < z.start() + zone_size)
            .cloned()
    }

    /// Reads `buf.len()` bytes at `offset`, looping over short reads and
    /// retrying interrupted ones. Returns the bytes read, which is short
    /// only at end of device.
    pub fn read(&self, buf: &mut [u8], offset: u64, direct: bool) -> Result<usize> {
        let mut done = 0usize;

        while done < buf.len() {
            match self
                .backend
                .read_at(&mut buf[done..], offset + done as u64, direct)
            {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(done)
    }

    /// Drops cached pages for the byte range.
    pub fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()> {
        self.backend
            .invalidate_cache(offset, len)
            .map_err(|_| ZbdError::Io("failed to invalidate cache".into()))
    }

    /// Latches the first error a background task encountered. Later calls
    /// keep the original status.
    pub fn set_deferred_error(&self, error: ZbdError) {
        let mut deferred = self.deferred.lock();
        if deferred.is_none() {
            *deferred = Some(error);
        }
    }

    /// The latched background error, if any.
    pub fn deferred_error(&self) -> Option<ZbdError> {
        self.deferred.lock().clone()
    }

    /// Clears the latch so allocations can proceed again.
    pub fn clear_deferred_error(&self) {
        *self.deferred.lock() = None;
    }

    pub(crate) fn check_deferred(&self) -> Result<()> {
        match self.deferred.lock().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.backend.block_size()
    }

    pub fn zone_size(&self) -> u64 {
        self.backend.zone_size()
    }

    pub fn zone_count(&self) -> u32 {
        self.backend.zone_count()
    }

    /// Currently held open tokens.
    pub fn open_io_zones(&self) -> i64 {
        self.open_io_zones.load(Ordering::SeqCst)
    }

    /// Currently held active tokens.
    pub fn active_io_zones(&self) -> i64 {
        self.active_io_zones.load(Ordering::SeqCst)
    }

    pub fn max_open_io_zones(&self) -> i64 {
        self.max_open_io_zones
    }

    pub fn max_active_io_zones(&self) -> i64 {
        self.max_active_io_zones
    }

    pub fn meta_zone_count(&self) -> usize {
        self.meta_zones.len()
    }

    pub fn io_zone_count(&self) -> usize {
        self.io_zones.len()
    }

    pub fn stats(&self) -> &Arc<DeviceStats> {
        &self.stats
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Logs an aggregate line: uptime, used and reclaimable capacity, and
    /// the zone gauges.
    pub fn log_zone_stats(&self) {
        let mut used_capacity = 0u64;
        let mut reclaimable_capacity = 0u64;
        let mut reclaimables_max_capacity = 0u64;
        let mut partial = 0u64;

        for zone in &self.io_zones {
            let used = zone.used_capacity();
            used_capacity += used;

            if used > 0 {
                reclaimable_capacity += zone.max_capacity() - used;
                reclaimables_max_capacity += zone.max_capacity();
            }

            if !(zone.is_full() || zone.is_empty()) {
                partial += 1;
            }
        }

        if reclaimables_max_capacity == 0 {
            reclaimables_max_capacity = 1;
        }

        info!(
            uptime_s = self.start_time.elapsed().as_secs(),
            used_mb = used_capacity >> 20,
            reclaimable_mb = reclaimable_capacity >> 20,
            avg_reclaimable_pct = 100 * reclaimable_capacity / reclaimables_max_capacity,
            partial_zones = partial,
            active_zones = self.active_io_zones(),
            open_zones = self.open_io_zones(),
            "zone stats"
        );
    }

    /// Logs per-zone live data counts at debug level.
    pub fn log_zone_usage(&self) {
        for zone in &self.io_zones {
            let used = zone.used_capacity();
            if used > 0 {
                debug!(
                    zone = zone.zone_nr(),
                    used_bytes = used,
                    used_mb = used >> 20,
                    "zone usage"
                );
            }
        }
    }

    /// Samples the garbage ratio of every acquirable IO zone into a
    /// 12-bucket histogram. Bucket 0 counts empty zones, bucket 11 zones
    /// that are pure garbage, buckets in between are 10% steps. Busy zones
    /// are skipped; the numbers are a sample, not an audit.
    pub fn garbage_histogram(&self) -> [u32; 12] {
        let mut histogram = [0u32; 12];

        for zone in &self.io_zones {
            if !zone.acquire() {
                continue;
            }

            if zone.is_empty() {
                histogram[0] += 1;
                zone.release();
                continue;
            }

            let written = if zone.is_full() {
                zone.max_capacity()
            } else {
                zone.wp() - zone.start()
            };
            let bucket = garbage_bucket(written, zone.used_capacity(), zone.max_capacity());
            histogram[bucket] += 1;

            zone.release();
        }

        histogram
    }

    /// Logs the [`ZonedDevice::garbage_histogram`] sample.
    pub fn log_garbage_info(&self) {
        let histogram = self.garbage_histogram();
        info!(?histogram, "zone garbage histogram");
    }

    pub(crate) fn io_zones(&self) -> &[Arc<Zone>] {
        &self.io_zones
    }

    pub(crate) fn meta_zones(&self) -> &[Arc<Zone>] {
        &self.meta_zones
    }
}

fn derive_io_limit(device_limit: u32, zone_count: u32) -> Result<i64> {
    // A zero limit means the device does not constrain the resource.
    let limit = if device_limit == 0 {
        zone_count as i64
    } else {
        device_limit as i64 - RESERVED_ZONE_COUNT as i64
    };

    if limit <= 0 {
        return Err(ZbdError::NotSupported(format!(
            "device limit of {device_limit} zones leaves no room for io zones"
        )));
    }
    Ok(limit)
}

/// Histogram bucket for a non-empty zone with `written` bytes behind the
/// write pointer and `used_capacity` bytes of live data. Bucket 1 holds
/// zones with under 10% garbage, each step covers another 10%, bucket 11
/// saturates at pure garbage.
fn garbage_bucket(written: u64, used_capacity: u64, max_capacity: u64) -> usize {
    let garbage = written.saturating_sub(used_capacity) as f64 / max_capacity as f64;
    (((garbage + 0.1) * 10.0) as usize).min(11)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ZoneFsBackend, ZoneFsGeometry};
    use tempfile::tempdir;

    const BLOCK: u64 = 4096;
    const ZONE_SIZE: u64 = 1 << 20;

    #[test]
    fn garbage_bucket_maps_ratios_to_ten_percent_steps() {
        let max = 20 * BLOCK;

        // A fully live zone has no garbage at all.
        assert_eq!(garbage_bucket(max, max, max), 1);
        // 5% garbage stays in the first non-empty bucket.
        assert_eq!(garbage_bucket(BLOCK, 0, max), 1);
        // 25% garbage.
        assert_eq!(garbage_bucket(5 * BLOCK, 0, max), 3);
        // 55% garbage.
        assert_eq!(garbage_bucket(11 * BLOCK, 0, max), 6);
        // 95% garbage.
        assert_eq!(garbage_bucket(19 * BLOCK, 0, max), 10);
        // A full zone with no live data saturates the last bucket.
        assert_eq!(garbage_bucket(max, 0, max), 11);
    }

    #[test]
    fn garbage_bucket_counts_garbage_against_the_full_zone_size() {
        let max = 20 * BLOCK;

        // A quarter-written zone with half its data dead: 10% of the zone
        // is garbage relative to max capacity, not to what was written.
        assert_eq!(garbage_bucket(5 * BLOCK, 3 * BLOCK, max), 2);
    }

    #[test]
    fn garbage_histogram_buckets_known_zone_states() {
        let dir = tempdir().unwrap();
        ZoneFsBackend::format(
            dir.path(),
            ZoneFsGeometry {
                block_size: BLOCK as u32,
                zone_size: ZONE_SIZE,
                zone_count: 64,
                max_open_zones: 14,
                max_active_zones: 14,
            },
        )
        .unwrap();

        // Zone 10: full, all garbage. Zone 12: a quarter written.
        let blocks_per_zone = (ZONE_SIZE / BLOCK) as usize;
        std::fs::write(
            dir.path().join("seq").join("10"),
            vec![0xEEu8; blocks_per_zone * BLOCK as usize],
        )
        .unwrap();
        std::fs::write(
            dir.path().join("seq").join("12"),
            vec![0xEEu8; blocks_per_zone / 4 * BLOCK as usize],
        )
        .unwrap();

        let options =
            DeviceOptions::new(BackendKind::zonefs(dir.path())).with_level_count(1);
        let device = ZonedDevice::open(options, false, true).unwrap();

        let histogram = device.garbage_histogram();

        // 61 IO zones minus the busy pool seed and the two prefilled ones.
        assert_eq!(histogram[0], 58);
        // The quarter-written zone with no live data: 25% garbage.
        assert_eq!(histogram[3], 1);
        // The full dead zone saturates the last bucket.
        assert_eq!(histogram[11], 1);
        assert_eq!(histogram.iter().sum::<u32>(), 60);

        // Crediting live data moves the partial zone down a bucket.
        let partial = device.get_io_zone(12 * ZONE_SIZE).unwrap();
        partial.inc_used_capacity(ZONE_SIZE / 8);

        let histogram = device.garbage_histogram();
        assert_eq!(histogram[3], 0);
        assert_eq!(histogram[2], 1);
    }
}


//! In-memory zone handles.
//!
//! One [`Zone`] exists per physical zone, created at mount and alive until
//! the device is dropped; there is no dynamic zone allocation afterwards.
//! The handle caches the device-visible state (`wp`, `capacity`,
//! `max_capacity`) as sequentially-consistent atomics and layers two pieces
//! of coordination state on top:
//!
//! - `busy`, an atomic lease. Whoever flips it false→true owns the
//!   exclusive right to mutate `wp`, `capacity` and `lifetime` until they
//!   flip it back. A failed release is an invariant violation, not a
//!   recoverable error.
//! - `in_pool_use`, which arbitrates between writers sharing a level pool.
//!   It is only ever read or written under the device's pool mutex.
//!
//! `used_capacity` is the live-data byte count and belongs to the
//! filesystem layer above; the allocator only reads it to decide whether a
//! zone holds nothing but garbage.
//!
//! A zone holds its backend and the shared stats, never the device, so
//! there is no ownership cycle between the two.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::backend::{AnyBackend, ZoneBackend, ZoneInfo};
use crate::error::{Result, ZbdError};
use crate::lifetime::Lifetime;
use crate::stats::DeviceStats;

/// Handle for one physical zone.
#[derive(Debug)]
pub struct Zone {
    start: u64,
    zone_size: u64,
    block_size: u32,
    max_capacity: AtomicU64,
    wp: AtomicU64,
    capacity: AtomicU64,
    used_capacity: AtomicU64,
    lifetime: AtomicU8,
    busy: AtomicBool,
    in_pool_use: AtomicBool,
    backend: Arc<AnyBackend>,
    stats: Arc<DeviceStats>,
}

impl Zone {
    pub(crate) fn new(
        info: &ZoneInfo,
        backend: Arc<AnyBackend>,
        stats: Arc<DeviceStats>,
    ) -> Zone {
        let capacity = if info.writable {
            info.max_capacity - (info.wp - info.start)
        } else {
            0
        };

        Zone {
            start: info.start,
            zone_size: backend.zone_size(),
            block_size: backend.block_size(),
            max_capacity: AtomicU64::new(info.max_capacity),
            wp: AtomicU64::new(info.wp),
            capacity: AtomicU64::new(capacity),
            used_capacity: AtomicU64::new(0),
            lifetime: AtomicU8::new(Lifetime::NOT_SET.as_raw()),
            busy: AtomicBool::new(false),
            in_pool_use: AtomicBool::new(false),
            backend,
            stats,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn wp(&self) -> u64 {
        self.wp.load(Ordering::SeqCst)
    }

    /// Writable bytes remaining before the zone is full.
    pub fn capacity_left(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity.load(Ordering::SeqCst)
    }

    /// Live-data byte count, maintained by the layer above.
    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::SeqCst)
    }

    pub fn lifetime(&self) -> Lifetime {
        Lifetime::from_raw(self.lifetime.load(Ordering::SeqCst))
    }

    /// Index of this zone on the device.
    pub fn zone_nr(&self) -> u64 {
        self.start / self.zone_size
    }

    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0
    }

    pub fn is_full(&self) -> bool {
        self.capacity_left() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.wp() == self.start
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Credits `n` bytes of live data to the zone.
    pub fn inc_used_capacity(&self, n: u64) {
        self.used_capacity.fetch_add(n, Ordering::SeqCst);
    }

    /// Removes `n` bytes of live data from the zone, e.g. after a file
    /// delete or an extent migration.
    pub fn dec_used_capacity(&self, n: u64) {
        let prev = self.used_capacity.fetch_sub(n, Ordering::SeqCst);
        debug_assert!(prev >= n, "used_capacity underflow on zone {}", self.zone_nr());
    }

    /// Takes the exclusive lease. Returns false when another owner holds it.
    pub fn acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Drops the exclusive lease. Returns false when the lease was not held,
    /// which means the busy protocol was violated somewhere.
    pub fn release(&self) -> bool {
        self.busy
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release that treats failure as the invariant violation it is.
    pub fn check_release(&self) -> Result<()> {
        if !self.release() {
            debug_assert!(false, "released a zone that was not busy");
            return Err(ZbdError::Corruption(format!(
                "failed to unset busy flag of zone {}",
                self.zone_nr()
            )));
        }
        Ok(())
    }

    pub(crate) fn in_pool_use(&self) -> bool {
        self.in_pool_use.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_pool_use(&self, in_use: bool) {
        self.in_pool_use.store(in_use, Ordering::SeqCst);
    }

    pub(crate) fn set_lifetime(&self, lifetime: Lifetime) {
        debug_assert!(self.is_busy());
        self.lifetime.store(lifetime.as_raw(), Ordering::SeqCst);
    }

    /// Appends `data` at the write pointer. The size must be a multiple of
    /// the device block size and fit in the remaining capacity. Short
    /// backend writes are retried until the buffer is drained.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        debug_assert!(self.is_busy());

        let size = data.len() as u64;
        if self.capacity_left() < size {
            return Err(ZbdError::NoSpace("not enough capacity for append".into()));
        }
        if size % self.block_size as u64 != 0 {
            return Err(ZbdError::InvalidArgument(format!(
                "append of {size} bytes is not aligned to the {} byte block size",
                self.block_size
            )));
        }

        let mut left = data;
        while !left.is_empty() {
            let wp = self.wp.load(Ordering::SeqCst);
            match self.backend.write_at(left, wp) {
                Ok(0) => {
                    return Err(ZbdError::Io(format!(
                        "backend wrote zero bytes at 0x{wp:x}"
                    )))
                }
                Ok(n) => {
                    self.wp.fetch_add(n as u64, Ordering::SeqCst);
                    self.capacity.fetch_sub(n as u64, Ordering::SeqCst);
                    self.stats.add_bytes_written(n as u64);
                    left = &left[n..];
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Erases the zone and snaps the write pointer back to the start. Only
    /// legal while the zone holds no live data. The device may report a new
    /// maximum capacity, or that the zone went offline.
    pub fn reset(&self) -> Result<()> {
        debug_assert!(self.is_busy());
        debug_assert!(!self.is_used());

        let outcome = self.backend.reset_zone(self.start)?;

        if outcome.offline {
            self.capacity.store(0, Ordering::SeqCst);
        } else {
            self.max_capacity.store(outcome.max_capacity, Ordering::SeqCst);
            self.capacity.store(outcome.max_capacity, Ordering::SeqCst);
        }

        self.wp.store(self.start, Ordering::SeqCst);
        self.lifetime
            .store(Lifetime::NOT_SET.as_raw(), Ordering::SeqCst);
        self.stats.record_reset();

        Ok(())
    }

    /// Transitions the zone to full. No more writes are accepted until a
    /// reset.
    pub fn finish(&self) -> Result<()> {
        debug_assert!(self.is_busy());

        self.backend.finish_zone(self.start)?;
        self.capacity.store(0, Ordering::SeqCst);
        self.wp.store(self.start + self.zone_size, Ordering::SeqCst);
        self.stats.record_finish();

        Ok(())
    }

    /// Moves a partially written zone from open to closed. Empty and full
    /// zones are left alone.
    pub fn close(&self) -> Result<()> {
        debug_assert!(self.is_busy());

        if !(self.is_empty() || self.is_full()) {
            self.backend.close_zone(self.start)?;
        }
        Ok(())
    }
}

//! # Backend Transport Abstraction
//!
//! This module defines the [`ZoneBackend`] trait, the contract between the
//! allocator core and the hardware, plus a type-erased [`AnyBackend`] enum
//! so the device can hold either transport without generics.
//!
//! ## Contract
//!
//! A backend exposes a fixed array of append-only zones and the handful of
//! operations a zoned device accepts:
//!
//! ```text
//! fn list_zones(&self) -> io::Result<Vec<ZoneInfo>>;
//! fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
//! fn read_at(&self, buf: &mut [u8], offset: u64, direct: bool) -> io::Result<usize>;
//! fn reset_zone(&self, start: u64) -> io::Result<ResetOutcome>;
//! fn finish_zone(&self, start: u64) -> io::Result<()>;
//! fn close_zone(&self, start: u64) -> io::Result<()>;
//! ```
//!
//! Reads and writes may be short; the core loops. Errors stay
//! `std::io::Error` down here so errno detail (including `EINTR`, which the
//! core retries) is preserved; the mapping into the crate taxonomy happens
//! in [`zone`](crate::zone) and [`device`](crate::device).
//!
//! ## Transports
//!
//! | Backend           | Target                      | Zone ops          |
//! |-------------------|-----------------------------|-------------------|
//! | `BlockDevBackend` | Kernel zoned block device   | `BLK*ZONE` ioctls |
//! | `ZoneFsBackend`   | Directory of per-zone files | truncate/pwrite   |
//!
//! The zonefs-style transport runs on any ordinary filesystem, which is what
//! the test suite uses.

mod blkdev;
mod zonefs;

pub use blkdev::BlockDevBackend;
pub use zonefs::{ZoneFsBackend, ZoneFsGeometry};

use std::io;

/// Device-reported limits on simultaneously open and active zones.
/// Zero means the device does not limit that resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenLimits {
    pub max_open_zones: u32,
    pub max_active_zones: u32,
}

/// One zone as reported by the backend at mount time.
#[derive(Debug, Clone, Copy)]
pub struct ZoneInfo {
    /// First byte of the zone.
    pub start: u64,
    /// Current write pointer.
    pub wp: u64,
    /// Bytes writable after a reset.
    pub max_capacity: u64,
    /// Whether the zone accepts writes at its write pointer.
    pub writable: bool,
    /// Whether the device counts the zone against its active limit.
    pub active: bool,
    /// Whether the device counts the zone against its open limit.
    pub open: bool,
    /// Whether the zone is dead to the device.
    pub offline: bool,
    /// Sequential-write-required zone type.
    pub swr: bool,
}

/// Result of a zone reset. A reset can reveal that the zone went offline or
/// that its usable capacity changed.
#[derive(Debug, Clone, Copy)]
pub struct ResetOutcome {
    pub offline: bool,
    pub max_capacity: u64,
}

/// Transport contract for a zoned address space.
pub trait ZoneBackend: Send + Sync {
    /// Device-reported open/active limits.
    fn limits(&self) -> OpenLimits;

    /// Reports every zone in index order.
    fn list_zones(&self) -> io::Result<Vec<ZoneInfo>>;

    /// Writes at `offset`, which must equal the owning zone's write
    /// pointer. May write fewer bytes than requested.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Reads at `offset`, optionally bypassing the page cache. May read
    /// fewer bytes than requested.
    fn read_at(&self, buf: &mut [u8], offset: u64, direct: bool) -> io::Result<usize>;

    /// Resets the zone starting at `start`, snapping its write pointer back
    /// to the zone start.
    fn reset_zone(&self, start: u64) -> io::Result<ResetOutcome>;

    /// Transitions the zone to full, ending further writes until a reset.
    fn finish_zone(&self, start: u64) -> io::Result<()>;

    /// Moves an open zone to the closed state. The zone stays active.
    fn close_zone(&self, start: u64) -> io::Result<()>;

    /// Drops any cached pages for the byte range.
    fn invalidate_cache(&self, offset: u64, len: u64) -> io::Result<()>;

    /// Minimum write granularity in bytes.
    fn block_size(&self) -> u32;

    /// Distance between zone starts in bytes.
    fn zone_size(&self) -> u64;

    /// Total number of zones.
    fn zone_count(&self) -> u32;

    /// Human-readable identity of the backing store, for logs.
    fn describe(&self) -> String;
}

/// Type-erased backend so `ZonedDevice` works with either transport
/// without generics.
#[derive(Debug)]
pub enum AnyBackend {
    BlockDev(BlockDevBackend),
    ZoneFs(ZoneFsBackend),
}

impl ZoneBackend for AnyBackend {
    fn limits(&self) -> OpenLimits {
        match self {
            AnyBackend::BlockDev(b) => b.limits(),
            AnyBackend::ZoneFs(b) => b.limits(),
        }
    }

    fn list_zones(&self) -> io::Result<Vec<ZoneInfo>> {
        match self {
            AnyBackend::BlockDev(b) => b.list_zones(),
            AnyBackend::ZoneFs(b) => b.list_zones(),
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        match self {
            AnyBackend::BlockDev(b) => b.write_at(buf, offset),
            AnyBackend::ZoneFs(b) => b.write_at(buf, offset),
        }
    }

    fn read_at(&self, buf: &mut [u8], offset: u64, direct: bool) -> io::Result<usize> {
        match self {
            AnyBackend::BlockDev(b) => b.read_at(buf, offset, direct),
            AnyBackend::ZoneFs(b) => b.read_at(buf, offset, direct),
        }
    }

    fn reset_zone(&self, start: u64) -> io::Result<ResetOutcome> {
        match self {
            AnyBackend::BlockDev(b) => b.reset_zone(start),
            AnyBackend::ZoneFs(b) => b.reset_zone(start),
        }
    }

    fn finish_zone(&self, start: u64) -> io::Result<()> {
        match self {
            AnyBackend::BlockDev(b) => b.finish_zone(start),
            AnyBackend::ZoneFs(b) => b.finish_zone(start),
        }
    }

    fn close_zone(&self, start: u64) -> io::Result<()> {
        match self {
            AnyBackend::BlockDev(b) => b.close_zone(start),
            AnyBackend::ZoneFs(b) => b.close_zone(start),
        }
    }

    fn invalidate_cache(&self, offset: u64, len: u64) -> io::Result<()> {
        match self {
            AnyBackend::BlockDev(b) => b.invalidate_cache(offset, len),
            AnyBackend::ZoneFs(b) => b.invalidate_cache(offset, len),
        }
    }

    fn block_size(&self) -> u32 {
        match self {
            AnyBackend::BlockDev(b) => b.block_size(),
            AnyBackend::ZoneFs(b) => b.block_size(),
        }
    }

    fn zone_size(&self) -> u64 {
        match self {
            AnyBackend::BlockDev(b) => b.zone_size(),
            AnyBackend::ZoneFs(b) => b.zone_size(),
        }
    }

    fn zone_count(&self) -> u32 {
        match self {
            AnyBackend::BlockDev(b) => b.zone_count(),
            AnyBackend::ZoneFs(b) => b.zone_count(),
        }
    }

    fn describe(&self) -> String {
        match self {
            AnyBackend::BlockDev(b) => b.describe(),
            AnyBackend::ZoneFs(b) => b.describe(),
        }
    }
}

//! # zonekv - Zone Allocation for Zoned Block Devices
//!
//! `zonekv` is the zone allocator and lifecycle manager a log-structured
//! key-value engine runs on top of a zoned block device (ZNS NVMe,
//! host-managed SMR, or a zonefs mount). A zoned device exposes its
//! capacity as a fixed array of append-only zones that must be written at
//! their write pointer and reset wholesale, and it caps how many zones may
//! be simultaneously *open* (accepting writes) and *active* (open or
//! partially written). This crate owns everything between those device
//! rules and the engine's "give me somewhere to write" calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        Filesystem / KV engine (external)      │
//! ├───────────────────────────────────────────────┤
//! │  ZonedDevice                                  │
//! │  ├── Allocator (lifetime-partitioned pools)   │
//! │  ├── Token manager (open × active semaphores) │
//! │  ├── Reclaim (reset / finish policies)        │
//! │  └── GC lane (primary + auxiliary zone)       │
//! ├───────────────────────────────────────────────┤
//! │  Zone handles (per-zone busy lease, wp)       │
//! ├───────────────────────────────────────────────┤
//! │  ZoneBackend: BlockDevBackend │ ZoneFsBackend │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Writers declare a [`Lifetime`] hint and the allocator keeps one pool of
//! zones per lifetime class, so data that dies together is erased
//! together. Admission is a two-dimensional token scheme mirroring the
//! device's open/active caps; per-zone mutual exclusion is an atomic busy
//! lease so independent writers never serialise on a global lock.
//!
//! ## Quick Start
//!
//! ```ignore
//! use zonekv::{BackendKind, DeviceOptions, IoType, Lifetime, ZonedDevice};
//!
//! let options = DeviceOptions::new(BackendKind::block_dev("/dev/nvme0n2"))
//!     .with_finish_threshold(25);
//! let device = ZonedDevice::open(options, false, true)?;
//!
//! let zone = device.allocate_io_zone(Lifetime::SHORT, IoType::Other, 42)?;
//! zone.append(&block_aligned_payload)?;
//! zone.inc_used_capacity(block_aligned_payload.len() as u64);
//! device.release_level_zone(&zone)?;
//! # Ok::<(), zonekv::ZbdError>(())
//! ```
//!
//! ## Module Overview
//!
//! - [`device`]: the [`ZonedDevice`] core (allocation, tokens, pools,
//!   reclaim, GC lane, snapshots)
//! - [`zone`]: per-zone handles and the busy-lease protocol
//! - [`backend`]: the transport trait and its two implementations
//! - [`lifetime`]: write-lifetime hints and class arithmetic
//! - [`config`]: mount-time options
//! - [`stats`]: device-wide counters
//! - [`error`]: the crate error taxonomy

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod lifetime;
pub mod stats;
pub mod zone;

pub use backend::{
    AnyBackend, BlockDevBackend, OpenLimits, ResetOutcome, ZoneBackend, ZoneFsBackend,
    ZoneFsGeometry, ZoneInfo,
};
pub use config::{BackendKind, DeviceOptions, DEFAULT_LEVEL_COUNT};
pub use device::{
    EmitOutcome, ZoneSnapshot, ZonedDevice, METADATA_FILE_ID, META_ZONE_COUNT, MIN_ZONE_COUNT,
    RESERVED_ZONE_COUNT,
};
pub use error::{Result, ZbdError};
pub use lifetime::{
    lifetime_diff, IoType, Lifetime, LIFETIME_DIFF_COULD_BE_WORSE, LIFETIME_DIFF_NOT_GOOD,
};
pub use stats::{DeviceStats, DeviceStatsSnapshot};
pub use zone::Zone;

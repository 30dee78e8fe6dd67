//! Device configuration.
//!
//! [`DeviceOptions`] is the mount-time configuration for a
//! [`ZonedDevice`](crate::device::ZonedDevice): which backend transport to
//! use, how many lifetime classes the level pools partition into, and the
//! finish-threshold policy. Options are validated once at open time so the
//! rest of the crate can rely on them being coherent.

use std::path::PathBuf;

use crate::error::{Result, ZbdError};
use crate::lifetime::Lifetime;

/// Default number of lifetime classes.
pub const DEFAULT_LEVEL_COUNT: u32 = 8;

/// Backend transport selection.
///
/// Both variants expose identical zone semantics; see the
/// [`backend`](crate::backend) module for the transport contracts.
#[derive(Debug, Clone)]
pub enum BackendKind {
    /// A kernel zoned block device, e.g. `/dev/nvme0n2`, driven through the
    /// `BLK*ZONE` ioctl family.
    BlockDev(PathBuf),

    /// A zonefs-style directory of per-zone files. Also the transport used
    /// by the test suite on ordinary filesystems.
    ZoneFs(PathBuf),
}

impl BackendKind {
    /// Creates a block device backend kind for the given device node.
    pub fn block_dev<P: Into<PathBuf>>(path: P) -> Self {
        BackendKind::BlockDev(path.into())
    }

    /// Creates a zonefs-style backend kind for the given directory.
    pub fn zonefs<P: Into<PathBuf>>(path: P) -> Self {
        BackendKind::ZoneFs(path.into())
    }

    /// Returns the path this backend kind points at.
    pub fn path(&self) -> &PathBuf {
        match self {
            BackendKind::BlockDev(path) => path,
            BackendKind::ZoneFs(path) => path,
        }
    }
}

/// Mount-time options for a zoned device.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Backend transport to open.
    pub backend: BackendKind,

    /// Number of lifetime classes the level pools maintain.
    pub level_count: u32,

    /// Lifetime of class 0. Class `i` corresponds to `lifetime_begin + i`.
    pub lifetime_begin: Lifetime,

    /// Finish a zone once its remaining capacity drops below this percent
    /// of its maximum capacity. Zero disables the policy.
    pub finish_threshold: u32,
}

impl DeviceOptions {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            level_count: DEFAULT_LEVEL_COUNT,
            lifetime_begin: Lifetime::NONE,
            finish_threshold: 0,
        }
    }

    pub fn with_level_count(mut self, level_count: u32) -> Self {
        self.level_count = level_count;
        self
    }

    pub fn with_lifetime_begin(mut self, lifetime_begin: Lifetime) -> Self {
        self.lifetime_begin = lifetime_begin;
        self
    }

    pub fn with_finish_threshold(mut self, finish_threshold: u32) -> Self {
        self.finish_threshold = finish_threshold;
        self
    }

    /// Validates the option set.
    pub fn validate(&self) -> Result<()> {
        if self.level_count == 0 {
            return Err(ZbdError::InvalidArgument(
                "level_count must be at least 1".into(),
            ));
        }

        if self.finish_threshold > 100 {
            return Err(ZbdError::InvalidArgument(format!(
                "finish_threshold {} is not a percentage",
                self.finish_threshold
            )));
        }

        let highest = self.lifetime_begin.as_raw() as u32 + self.level_count - 1;
        if highest >= Lifetime::GC.as_raw() as u32 {
            return Err(ZbdError::InvalidArgument(format!(
                "{} classes starting at {} collide with the gc lifetime tag",
                self.level_count, self.lifetime_begin
            )));
        }

        Ok(())
    }
}

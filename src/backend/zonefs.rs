//! # ZoneFs-Style File Transport
//!
//! This backend maps a zoned address space onto a directory of ordinary
//! files, one fixed-capacity file per zone, the way zonefs exposes a zoned
//! device. It is the portable transport: it behaves identically on a real
//! zonefs mount and on any plain filesystem, which is what the test suite
//! relies on.
//!
//! ## Directory Layout
//!
//! ```text
//! device_dir/
//! ├── super        # 56-byte geometry superblock, CRC64 protected
//! └── seq/
//!     ├── 0        # zone 0, file length == write pointer offset
//!     ├── 1
//!     └── ...
//! ```
//!
//! A zone file's length *is* its write pointer: appends grow the file,
//! `reset` truncates it to zero and `finish` truncates it up to the full
//! zone size. A zone is reported active while partially written, mirroring
//! how a zoned device accounts a non-empty, non-full zone.
//!
//! ## Superblock
//!
//! The geometry (block size, zone size, zone count, open/active limits)
//! cannot be recovered from empty zone files, so [`ZoneFsBackend::format`]
//! writes it once into a `super` file: magic, version, the geometry fields
//! and a CRC64 of everything before the checksum. [`ZoneFsBackend::open`]
//! verifies all three before touching a zone.
//!
//! ## Locking and Descriptors
//!
//! Open exclusivity is enforced with an advisory `flock` on the superblock
//! (exclusive for write opens, shared for readonly). Write handles for hot
//! zones are kept in a bounded cache so a device with tens of thousands of
//! zones cannot exhaust file descriptors.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use hashbrown::HashMap;
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{OpenLimits, ResetOutcome, ZoneBackend, ZoneInfo};

pub const SUPER_FILE_NAME: &str = "super";
pub const SEQ_DIR_NAME: &str = "seq";

/// Maximum number of cached per-zone write handles.
pub const MAX_CACHED_WRITE_HANDLES: usize = 64;

const SUPER_MAGIC: &[u8; 16] = b"zonekv zonefs\x00\x00\x00";
const SUPER_VERSION: u32 = 1;
const SUPER_SIZE: usize = 56;
const SUPER_CHECKSUM_OFFSET: usize = 48;

const SUPER_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SuperBlock {
    magic: [u8; 16],
    version: U32,
    block_size: U32,
    zone_size: U64,
    zone_count: U32,
    max_open_zones: U32,
    max_active_zones: U32,
    _pad: [u8; 4],
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<SuperBlock>() == SUPER_SIZE);

impl SuperBlock {
    fn new(geometry: &ZoneFsGeometry) -> Self {
        let mut block = Self {
            magic: *SUPER_MAGIC,
            version: U32::new(SUPER_VERSION),
            block_size: U32::new(geometry.block_size),
            zone_size: U64::new(geometry.zone_size),
            zone_count: U32::new(geometry.zone_count),
            max_open_zones: U32::new(geometry.max_open_zones),
            max_active_zones: U32::new(geometry.max_active_zones),
            _pad: [0u8; 4],
            checksum: U64::new(0),
        };
        let crc = SUPER_CRC.checksum(&block.as_bytes()[..SUPER_CHECKSUM_OFFSET]);
        block.checksum = U64::new(crc);
        block
    }

    fn parse(bytes: &[u8]) -> io::Result<Self> {
        let block = SuperBlock::read_from_bytes(bytes)
            .map_err(|_| invalid_data("superblock is truncated"))?;

        if &block.magic != SUPER_MAGIC {
            return Err(invalid_data("bad magic in superblock"));
        }
        if block.version.get() != SUPER_VERSION {
            return Err(invalid_data(format!(
                "unsupported superblock version {}",
                block.version.get()
            )));
        }

        let crc = SUPER_CRC.checksum(&bytes[..SUPER_CHECKSUM_OFFSET]);
        if crc != block.checksum.get() {
            return Err(invalid_data("superblock checksum mismatch"));
        }

        Ok(block)
    }

    fn geometry(&self) -> ZoneFsGeometry {
        ZoneFsGeometry {
            block_size: self.block_size.get(),
            zone_size: self.zone_size.get(),
            zone_count: self.zone_count.get(),
            max_open_zones: self.max_open_zones.get(),
            max_active_zones: self.max_active_zones.get(),
        }
    }
}

fn invalid_data<E: Into<String>>(msg: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn invalid_input<E: Into<String>>(msg: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

/// Geometry of a zonefs-style device directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneFsGeometry {
    /// Minimum write granularity in bytes.
    pub block_size: u32,
    /// Capacity of every zone in bytes.
    pub zone_size: u64,
    /// Number of sequential zones.
    pub zone_count: u32,
    /// Open-zone limit reported to the core. Zero means unlimited.
    pub max_open_zones: u32,
    /// Active-zone limit reported to the core. Zero means unlimited.
    pub max_active_zones: u32,
}

impl ZoneFsGeometry {
    fn validate(&self) -> io::Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(invalid_input("block_size must be a power of two"));
        }
        if self.zone_size == 0 || self.zone_size % self.block_size as u64 != 0 {
            return Err(invalid_input(
                "zone_size must be a non-zero multiple of block_size",
            ));
        }
        if self.zone_count == 0 {
            return Err(invalid_input("zone_count must be at least 1"));
        }
        Ok(())
    }
}

/// Zoned backend over a directory of per-zone files.
#[derive(Debug)]
pub struct ZoneFsBackend {
    root: PathBuf,
    // Keeps the advisory lock for the lifetime of the backend.
    _super_file: File,
    geometry: ZoneFsGeometry,
    readonly: bool,
    write_handles: Mutex<HashMap<u32, File>>,
}

impl ZoneFsBackend {
    /// Initialises a fresh device directory: the superblock and one empty
    /// file per zone. Refuses to overwrite an existing superblock.
    pub fn format<P: AsRef<Path>>(root: P, geometry: ZoneFsGeometry) -> io::Result<()> {
        let root = root.as_ref();
        geometry.validate()?;

        let super_path = root.join(SUPER_FILE_NAME);
        if super_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("'{}' is already formatted", root.display()),
            ));
        }

        fs::create_dir_all(root.join(SEQ_DIR_NAME))?;
        for index in 0..geometry.zone_count {
            File::create(root.join(SEQ_DIR_NAME).join(index.to_string()))?;
        }

        let block = SuperBlock::new(&geometry);
        fs::write(&super_path, block.as_bytes())?;
        Ok(())
    }

    /// Opens a formatted device directory. Write opens take an exclusive
    /// advisory lock on the superblock; readonly opens take a shared one.
    pub fn open<P: AsRef<Path>>(root: P, readonly: bool, exclusive: bool) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let super_path = root.join(SUPER_FILE_NAME);

        let super_file = File::open(&super_path)?;
        let lock_op = if exclusive {
            libc::LOCK_EX | libc::LOCK_NB
        } else {
            libc::LOCK_SH | libc::LOCK_NB
        };
        // SAFETY: flock takes a descriptor and an operation flag and touches
        // no user memory. This is safe because:
        // 1. The descriptor comes from `super_file`, open for the whole call
        // 2. LOCK_NB makes the call non-blocking, so it cannot park the
        //    thread inside the syscall
        // 3. The lock is advisory and the kernel drops it when the
        //    descriptor closes, which is tied to the backend's lifetime
        if unsafe { libc::flock(super_file.as_raw_fd(), lock_op) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut bytes = [0u8; SUPER_SIZE];
        super_file.read_exact_at(&mut bytes, 0)?;
        let geometry = SuperBlock::parse(&bytes)?.geometry();

        Ok(Self {
            root,
            _super_file: super_file,
            geometry,
            readonly,
            write_handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn geometry(&self) -> ZoneFsGeometry {
        self.geometry
    }

    fn zone_path(&self, index: u32) -> PathBuf {
        self.root.join(SEQ_DIR_NAME).join(index.to_string())
    }

    fn zone_index(&self, offset: u64) -> io::Result<u32> {
        let index = offset / self.geometry.zone_size;
        if index >= self.geometry.zone_count as u64 {
            return Err(invalid_input(format!(
                "offset 0x{offset:x} is beyond the last zone"
            )));
        }
        Ok(index as u32)
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.readonly {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "device was opened readonly",
            ));
        }
        Ok(())
    }

    /// Runs `op` with a cached write handle for the zone, evicting an
    /// arbitrary entry when the cache is at capacity.
    fn with_write_handle<T>(
        &self,
        index: u32,
        op: impl FnOnce(&File) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut handles = self.write_handles.lock();

        if !handles.contains_key(&index) {
            if handles.len() >= MAX_CACHED_WRITE_HANDLES {
                if let Some(evicted) = handles.keys().next().copied() {
                    handles.remove(&evicted);
                }
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.zone_path(index))?;
            handles.insert(index, file);
        }

        op(handles.get(&index).unwrap())
    }

    fn drop_write_handle(&self, index: u32) {
        self.write_handles.lock().remove(&index);
    }
}

impl ZoneBackend for ZoneFsBackend {
    fn limits(&self) -> OpenLimits {
        OpenLimits {
            max_open_zones: self.geometry.max_open_zones,
            max_active_zones: self.geometry.max_active_zones,
        }
    }

    fn list_zones(&self) -> io::Result<Vec<ZoneInfo>> {
        let zone_size = self.geometry.zone_size;
        let mut zones = Vec::with_capacity(self.geometry.zone_count as usize);

        for index in 0..self.geometry.zone_count {
            let len = fs::metadata(self.zone_path(index))?.len().min(zone_size);
            let start = index as u64 * zone_size;

            zones.push(ZoneInfo {
                start,
                wp: start + len,
                max_capacity: zone_size,
                writable: len < zone_size,
                active: len > 0 && len < zone_size,
                open: false,
                offline: false,
                swr: true,
            });
        }

        Ok(zones)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.check_writable()?;
        let index = self.zone_index(offset)?;
        let in_zone = offset % self.geometry.zone_size;

        self.with_write_handle(index, |file| {
            let len = file.metadata()?.len();
            if in_zone != len {
                return Err(invalid_input(format!(
                    "write at 0x{offset:x} is not at the zone write pointer"
                )));
            }

            let room = (self.geometry.zone_size - in_zone) as usize;
            if room == 0 {
                return Err(io::Error::from_raw_os_error(libc::ENOSPC));
            }

            file.write_at(&buf[..buf.len().min(room)], in_zone)
        })
    }

    fn read_at(&self, buf: &mut [u8], offset: u64, _direct: bool) -> io::Result<usize> {
        let index = self.zone_index(offset)?;
        let in_zone = offset % self.geometry.zone_size;
        let room = (self.geometry.zone_size - in_zone) as usize;
        let want = buf.len().min(room);

        let file = File::open(self.zone_path(index))?;
        file.read_at(&mut buf[..want], in_zone)
    }

    fn reset_zone(&self, start: u64) -> io::Result<ResetOutcome> {
        self.check_writable()?;
        let index = self.zone_index(start)?;
        self.drop_write_handle(index);

        OpenOptions::new()
            .write(true)
            .open(self.zone_path(index))?
            .set_len(0)?;

        Ok(ResetOutcome {
            offline: false,
            max_capacity: self.geometry.zone_size,
        })
    }

    fn finish_zone(&self, start: u64) -> io::Result<()> {
        self.check_writable()?;
        let index = self.zone_index(start)?;
        self.drop_write_handle(index);

        OpenOptions::new()
            .write(true)
            .open(self.zone_path(index))?
            .set_len(self.geometry.zone_size)
    }

    fn close_zone(&self, start: u64) -> io::Result<()> {
        let index = self.zone_index(start)?;
        self.drop_write_handle(index);
        Ok(())
    }

    fn invalidate_cache(&self, offset: u64, len: u64) -> io::Result<()> {
        let zone_size = self.geometry.zone_size;
        let first = offset / zone_size;
        let last = offset.saturating_add(len.max(1) - 1) / zone_size;

        for index in first..=last.min(self.geometry.zone_count as u64 - 1) {
            let file = File::open(self.zone_path(index as u32))?;
            // SAFETY: posix_fadvise is advisory and never dereferences user
            // memory. This is safe because:
            // 1. `file` was just opened and stays open until the end of the
            //    iteration
            // 2. A zero offset and length cover the whole file, so no range
            //    arithmetic can go out of bounds
            // 3. Dropping cached pages cannot affect on-disk data, matching
            //    the semantics of the raw device transport
            unsafe {
                libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
            }
        }
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    fn zone_size(&self) -> u64 {
        self.geometry.zone_size
    }

    fn zone_count(&self) -> u32 {
        self.geometry.zone_count
    }

    fn describe(&self) -> String {
        format!("zonefs:{}", self.root.display())
    }
}

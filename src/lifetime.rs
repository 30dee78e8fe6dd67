//! Write-lifetime hints and lifetime classes.
//!
//! Writers tag their data with an expected longevity and the allocator
//! partitions zones into per-class pools so data that dies together lands
//! together. A [`Lifetime`] is a thin `u8` newtype rather than a closed
//! enum: the pool configuration may define more classes than the named
//! hints (class `i` is `lifetime_begin + i`), and the raw value is what
//! gets stamped into snapshots.

use std::fmt;

use serde::Serialize;

/// Penalty returned by [`lifetime_diff`] when a zone is an unacceptable
/// placement for the data.
pub const LIFETIME_DIFF_NOT_GOOD: u32 = 100;

/// Threshold above which a match is considered poor enough that opening a
/// fresh zone is preferable when resources allow it.
pub const LIFETIME_DIFF_COULD_BE_WORSE: u32 = 50;

/// Expected longevity of written data.
///
/// Ordered from unknown to longest-lived. Values above [`Lifetime::EXTREME`]
/// are valid when the pool configuration defines that many classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Lifetime(u8);

impl Lifetime {
    /// No hint has been applied to the zone or file.
    pub const NOT_SET: Lifetime = Lifetime(0);
    /// Explicitly unhinted data.
    pub const NONE: Lifetime = Lifetime(1);
    pub const SHORT: Lifetime = Lifetime(2);
    pub const MEDIUM: Lifetime = Lifetime(3);
    pub const LONG: Lifetime = Lifetime(4);
    pub const EXTREME: Lifetime = Lifetime(5);

    /// Tag for zones owned by the migration lane. Outside every configurable
    /// class range so GC zones can never be mistaken for pool members.
    pub const GC: Lifetime = Lifetime(255);

    pub const fn from_raw(raw: u8) -> Lifetime {
        Lifetime(raw)
    }

    pub const fn as_raw(self) -> u8 {
        self.0
    }

    /// Lifetime of pool class `class` for a pool based at `base`.
    pub fn for_class(base: Lifetime, class: u32) -> Lifetime {
        debug_assert!(class <= (u8::MAX - base.0) as u32);
        Lifetime(base.0 + class as u8)
    }

    /// Pool class index of this lifetime relative to `base`, if any.
    pub fn class(self, base: Lifetime) -> Option<u32> {
        self.0.checked_sub(base.0).map(u32::from)
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Lifetime::NOT_SET => write!(f, "not-set"),
            Lifetime::NONE => write!(f, "none"),
            Lifetime::SHORT => write!(f, "short"),
            Lifetime::MEDIUM => write!(f, "medium"),
            Lifetime::LONG => write!(f, "long"),
            Lifetime::EXTREME => write!(f, "extreme"),
            Lifetime::GC => write!(f, "gc"),
            Lifetime(raw) => write!(f, "class+{raw}"),
        }
    }
}

/// Distance between a zone's lifetime tag and a file's lifetime hint.
///
/// Zero is a perfect match. A zone that outlives the file scores the
/// difference in levels. A zone that dies before the file, or any pairing
/// involving an unhinted file that does not match exactly, scores
/// [`LIFETIME_DIFF_NOT_GOOD`].
pub fn lifetime_diff(zone_lifetime: Lifetime, file_lifetime: Lifetime) -> u32 {
    if file_lifetime == Lifetime::NOT_SET || file_lifetime == Lifetime::NONE {
        return if file_lifetime == zone_lifetime {
            0
        } else {
            LIFETIME_DIFF_NOT_GOOD
        };
    }

    if zone_lifetime > file_lifetime {
        (zone_lifetime.as_raw() - file_lifetime.as_raw()) as u32
    } else if zone_lifetime == file_lifetime {
        0
    } else {
        LIFETIME_DIFF_NOT_GOOD
    }
}

/// Kind of traffic requesting an allocation. WAL writers skip background
/// reclaim work to keep tail latency down and get the reserved open-token
/// slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Wal,
    L0,
    Other,
}

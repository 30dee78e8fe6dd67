//! Zone snapshots and JSON encoding for debugging and metrics export.

use std::io::Write;

use serde::Serialize;

use super::ZonedDevice;
use crate::error::{Result, ZbdError};
use crate::lifetime::Lifetime;
use crate::zone::Zone;

/// Point-in-time copy of one zone's externally visible state.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneSnapshot {
    pub start: u64,
    pub capacity: u64,
    pub max_capacity: u64,
    pub wp: u64,
    pub lifetime: Lifetime,
    pub used_capacity: u64,
}

impl ZoneSnapshot {
    fn of(zone: &Zone) -> ZoneSnapshot {
        ZoneSnapshot {
            start: zone.start(),
            capacity: zone.capacity_left(),
            max_capacity: zone.max_capacity(),
            wp: zone.wp(),
            lifetime: zone.lifetime(),
            used_capacity: zone.used_capacity(),
        }
    }
}

#[derive(Serialize)]
struct DeviceSnapshot {
    meta: Vec<ZoneSnapshot>,
    io: Vec<ZoneSnapshot>,
}

impl ZonedDevice {
    /// Snapshots every IO zone. The copies are unsynchronized reads of
    /// atomics, good enough for debugging and metrics.
    pub fn zone_snapshot(&self) -> Vec<ZoneSnapshot> {
        self.io_zones().iter().map(|z| ZoneSnapshot::of(z)).collect()
    }

    /// Writes `{"meta":[...],"io":[...]}` with one record per zone.
    pub fn encode_json<W: Write>(&self, writer: W) -> Result<()> {
        let snapshot = DeviceSnapshot {
            meta: self.meta_zones().iter().map(|z| ZoneSnapshot::of(z)).collect(),
            io: self.io_zones().iter().map(|z| ZoneSnapshot::of(z)).collect(),
        };

        serde_json::to_writer(writer, &snapshot)
            .map_err(|e| ZbdError::Io(format!("failed to encode zone state: {e}")))
    }
}

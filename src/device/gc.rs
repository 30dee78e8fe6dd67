//! The migration lane.
//!
//! Garbage collection migrates live extents out of mostly-dead zones. It
//! writes through a dedicated pair of zones: the primary receives
//! migrated data, the auxiliary is pre-allocated so promotion never has to
//! wait for an empty zone mid-migration. Both carry the [`Lifetime::GC`]
//! tag and are never pool members; their busy leases belong to the lane.
//!
//! The primary's tokens are taken explicitly; the auxiliary rides on the
//! two zones the device reserved at mount for metadata and migration.

use std::sync::Arc;

use tracing::{debug, info};

use super::allocator::backoff_sleep;
use super::ZonedDevice;
use crate::error::{Result, ZbdError};
use crate::lifetime::Lifetime;
use crate::zone::Zone;

#[derive(Debug, Default)]
pub(super) struct GcLane {
    pub(super) primary: Option<Arc<Zone>>,
    pub(super) aux: Option<Arc<Zone>>,
}

impl ZonedDevice {
    /// Reserves an empty zone for migration. The primary takes one open
    /// and one active token first, blocking until both are held; the
    /// auxiliary only takes the zone. Backs off while the device has no
    /// empty zone.
    pub fn allocate_gc_zone(&self, is_aux: bool) -> Result<()> {
        if !is_aux {
            self.wait_for_open_io_zone_token(false);
            self.wait_for_active_io_zone_token();
        }

        let mut attempt = 0u32;
        let zone = loop {
            match self.allocate_empty_zone() {
                Ok(Some(zone)) => break zone,
                Ok(None) => {
                    attempt += 1;
                    backoff_sleep(attempt);
                }
                Err(e) => {
                    if !is_aux {
                        self.put_open_io_zone_token();
                        self.put_active_io_zone_token();
                    }
                    return Err(e);
                }
            }
        };

        zone.set_lifetime(Lifetime::GC);
        debug!(zone = zone.zone_nr(), aux = is_aux, "reserved gc zone");

        let previous = {
            let mut lane = self.gc.lock();
            let slot = if is_aux { &mut lane.aux } else { &mut lane.primary };
            slot.replace(zone)
        };

        if let Some(previous) = previous {
            debug_assert!(false, "gc slot was still occupied");
            previous.check_release()?;
        }

        Ok(())
    }

    /// Hands the migration caller a zone with at least `min_capacity`
    /// bytes left. An exhausted primary is finished, released and replaced
    /// by the auxiliary; the caller is expected to re-arm the auxiliary
    /// with [`ZonedDevice::allocate_gc_zone`] afterwards.
    ///
    /// Panics when finishing the exhausted primary fails, because the
    /// open/active accounting cannot be repaired after that.
    pub fn take_migrate_zone(&self, min_capacity: u64) -> Result<Arc<Zone>> {
        let mut lane = self.gc.lock();

        let primary = lane
            .primary
            .clone()
            .ok_or_else(|| ZbdError::NoSpace("gc lane has no zone".into()))?;

        if primary.capacity_left() < min_capacity {
            debug!(zone = primary.zone_nr(), "finishing exhausted gc zone");
            if let Err(e) = primary.finish() {
                panic!("failed to finish gc zone {}: {e}", primary.zone_nr());
            }
            primary.check_release()?;
            lane.primary = lane.aux.take();
        }

        let zone = lane
            .primary
            .clone()
            .ok_or_else(|| ZbdError::NoSpace("gc zones exhausted".into()))?;

        info!(zone = zone.zone_nr(), "migrate zone taken");
        Ok(zone)
    }

    /// Releases a zone the migration caller is done with. The current
    /// primary stays held by the lane; anything else gets its busy lease
    /// dropped.
    pub fn release_migrate_zone(&self, zone: &Arc<Zone>) -> Result<()> {
        let is_primary = {
            let lane = self.gc.lock();
            lane.primary
                .as_ref()
                .is_some_and(|primary| Arc::ptr_eq(primary, zone))
        };

        if !is_primary {
            zone.check_release()?;
            info!(zone = zone.zone_nr(), "released migrate zone");
        }

        Ok(())
    }
}

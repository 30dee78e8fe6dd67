//! Reset and finish policies.
//!
//! The reclaim pass turns zones whose live data has died back into empty
//! zones, and the two finish policies trade unwritten capacity for token
//! headroom: the threshold policy finishes nearly-full zones eagerly, the
//! cheapest-zone fallback finishes the zone that wastes the fewest bytes
//! when nothing else frees a token.

use std::sync::Arc;

use tracing::debug;

use super::ZonedDevice;
use crate::error::Result;
use crate::zone::Zone;

impl ZonedDevice {
    /// Resets every zone that is non-empty but holds no live data.
    ///
    /// Token accounting follows where the zone stood:
    /// - a free-floating zone that was not yet full refunds one active
    ///   token (a full zone's tokens were settled when it filled),
    /// - an idle pool member is claimed through the pool arbitration,
    ///   reset, and emitted, which retires or replaces it and settles its
    ///   tokens either way.
    pub fn reset_unused_io_zones(&self) -> Result<()> {
        for zone in self.io_zones() {
            if zone.acquire() {
                if !zone.is_empty() && !zone.is_used() {
                    let was_full = zone.is_full();
                    debug!(zone = zone.zone_nr(), "resetting unused zone");

                    let reset = zone.reset();
                    let released = zone.check_release();
                    reset?;
                    released?;

                    if !was_full {
                        self.put_active_io_zone_token();
                    }
                } else {
                    zone.check_release()?;
                }
            } else if self.claim_idle_pool_member(zone) {
                debug!(zone = zone.zone_nr(), "resetting unused pool zone");

                if let Err(e) = zone.reset() {
                    self.unclaim_pool_member(zone);
                    return Err(e);
                }
                self.emit_level_zone(zone)?;
            }
        }

        Ok(())
    }

    /// Finishes every acquirable, partially written zone whose remaining
    /// capacity dropped below the configured percentage of its maximum,
    /// refunding one active token per finished zone. Disabled when the
    /// threshold is zero.
    pub fn apply_finish_threshold(&self) -> Result<()> {
        if self.finish_threshold == 0 {
            return Ok(());
        }

        for zone in self.io_zones() {
            if !zone.acquire() {
                continue;
            }

            let within_threshold = zone.capacity_left()
                < zone.max_capacity() * self.finish_threshold as u64 / 100;

            if !(zone.is_empty() || zone.is_full()) && within_threshold {
                debug!(zone = zone.zone_nr(), "finishing zone under threshold");
                let finished = zone.finish();
                let released = zone.check_release();
                finished?;
                released?;
                self.put_active_io_zone_token();
            } else {
                zone.check_release()?;
            }
        }

        Ok(())
    }

    /// Finishes the acquirable partially written zone with the least
    /// remaining capacity, returning its active token to the pool. Ties go
    /// to the zone encountered first. A no-op when every such zone is empty
    /// or full.
    ///
    /// Panics when the device refuses the finish: the token books cannot
    /// be balanced after a half-finished zone.
    pub fn finish_cheapest_io_zone(&self) -> Result<()> {
        let mut victim: Option<Arc<Zone>> = None;

        for zone in self.io_zones() {
            if !zone.acquire() {
                continue;
            }

            if zone.is_empty() || zone.is_full() {
                zone.check_release()?;
                continue;
            }

            match &victim {
                Some(current) if current.capacity_left() <= zone.capacity_left() => {
                    zone.check_release()?;
                }
                Some(current) => {
                    current.check_release()?;
                    victim = Some(Arc::clone(zone));
                }
                None => victim = Some(Arc::clone(zone)),
            }
        }

        let Some(victim) = victim else {
            return Ok(());
        };

        debug!(
            zone = victim.zone_nr(),
            left = victim.capacity_left(),
            "finishing cheapest zone"
        );

        if let Err(e) = victim.finish() {
            panic!("failed to finish zone {}: {e}", victim.zone_nr());
        }

        victim.check_release()?;
        self.put_active_io_zone_token();
        Ok(())
    }
}

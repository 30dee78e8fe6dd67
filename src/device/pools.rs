//! Level pools: per-lifetime-class zone sets.
//!
//! Each lifetime class owns a set of zones dedicated to it. Zones in a pool
//! keep their `busy` lease held by the pool for their whole residency;
//! writers are arbitrated by the `in_pool_use` flag and the per-class
//! `available` counter, both only touched under the pool mutex. The
//! counter invariant: `available[class]` equals the number of pool members
//! with `in_pool_use == false`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use super::allocator::backoff_sleep;
use super::ZonedDevice;
use crate::error::{Result, ZbdError};
use crate::lifetime::Lifetime;
use crate::zone::Zone;

/// What [`ZonedDevice::emit_level_zone`] did with the class the zone left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// The class would have gone empty; a fresh empty zone took over the
    /// emitted zone's place and its tokens.
    Replaced,
    /// The class still has members; the emitted zone's open and active
    /// tokens were returned.
    Retired,
}

impl ZonedDevice {
    /// Seeds every lifetime class with one empty zone at mount. Each seed
    /// consumes one open and one active token. Failure means the backing
    /// store cannot host the configured pools and the mount must not
    /// proceed.
    pub(crate) fn initial_level_zones(&self) -> Result<()> {
        let mut pools = self.pools.lock();

        for class in 0..self.level_count {
            self.open_io_zones.fetch_add(1, Ordering::SeqCst);
            self.active_io_zones.fetch_add(1, Ordering::SeqCst);

            let zone = self.allocate_empty_zone()?.ok_or_else(|| {
                ZbdError::NoSpace(format!(
                    "no empty zone available to seed lifetime class {class}"
                ))
            })?;

            zone.set_lifetime(Lifetime::for_class(self.lifetime_begin, class));
            debug!(zone = zone.zone_nr(), class, "seeded level pool");
            pools[class as usize].push(zone);
            self.level_available[class as usize].fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Removes a fully reclaimed (empty, unused) zone from its class pool.
    ///
    /// The zone's busy lease, held by the pool, is released here. If the
    /// class would go empty, a replacement empty zone is allocated (backing
    /// off outside the mutex while the device has none) and inherits the
    /// emitted zone's tokens; otherwise the tokens are returned.
    pub fn emit_level_zone(&self, zone: &Arc<Zone>) -> Result<EmitOutcome> {
        let mut pools = self.pools.lock();

        let (class, index) = find_member(&pools, zone).ok_or_else(|| {
            ZbdError::Corruption(format!(
                "zone {} is not a member of any level pool",
                zone.zone_nr()
            ))
        })?;

        if !zone.in_pool_use() {
            self.level_available[class].fetch_sub(1, Ordering::SeqCst);
        }
        pools[class].swap_remove(index);
        zone.set_in_pool_use(false);
        zone.check_release()?;
        debug!(zone = zone.zone_nr(), class, "emitted zone from level pool");

        if pools[class].is_empty() {
            drop(pools);

            let mut attempt = 0u32;
            let replacement = loop {
                if let Some(z) = self.allocate_empty_zone()? {
                    break z;
                }
                attempt += 1;
                backoff_sleep(attempt);
            };

            replacement.set_lifetime(Lifetime::for_class(self.lifetime_begin, class as u32));
            debug!(
                zone = replacement.zone_nr(),
                class, "replaced emitted zone in level pool"
            );

            let mut pools = self.pools.lock();
            pools[class].push(replacement);
            self.level_available[class].fetch_add(1, Ordering::SeqCst);
            drop(pools);
            self.pool_resources.notify_all();

            Ok(EmitOutcome::Replaced)
        } else {
            self.open_io_zones.fetch_sub(1, Ordering::SeqCst);
            self.active_io_zones.fetch_sub(1, Ordering::SeqCst);
            drop(pools);
            self.pool_resources.notify_all();

            Ok(EmitOutcome::Retired)
        }
    }

    /// Hands a zone back to its class pool after a writer is done with it.
    /// The zone stays a pool member and stays busy-held; it only becomes
    /// grantable to the next writer.
    pub fn release_level_zone(&self, zone: &Arc<Zone>) -> Result<()> {
        let class = zone
            .lifetime()
            .class(self.lifetime_begin)
            .filter(|c| *c < self.level_count)
            .ok_or_else(|| {
                ZbdError::InvalidArgument(format!(
                    "zone {} with lifetime {} is not a level zone",
                    zone.zone_nr(),
                    zone.lifetime()
                ))
            })? as usize;

        {
            let _pools = self.pools.lock();
            zone.set_in_pool_use(false);
            self.level_available[class].fetch_add(1, Ordering::SeqCst);
        }
        self.pool_resources.notify_all();

        Ok(())
    }

    /// Whether the zone currently belongs to any level pool.
    pub fn is_level_zone(&self, zone: &Arc<Zone>) -> bool {
        find_member(&self.pools.lock(), zone).is_some()
    }

    /// Claims an idle pool member that holds nothing but garbage, so
    /// reclaim can reset it. The claim uses the same `in_pool_use`
    /// arbitration as writers; the zone's busy lease stays with the pool.
    pub(crate) fn claim_idle_pool_member(&self, zone: &Arc<Zone>) -> bool {
        let pools = self.pools.lock();

        let Some((class, _)) = find_member(&pools, zone) else {
            return false;
        };
        if zone.in_pool_use() || zone.is_empty() || zone.is_used() {
            return false;
        }

        zone.set_in_pool_use(true);
        self.level_available[class].fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Returns a claimed pool member untouched, e.g. after a failed reset.
    pub(crate) fn unclaim_pool_member(&self, zone: &Arc<Zone>) {
        {
            let pools = self.pools.lock();
            if let Some((class, _)) = find_member(&pools, zone) {
                zone.set_in_pool_use(false);
                self.level_available[class].fetch_add(1, Ordering::SeqCst);
            }
        }
        self.pool_resources.notify_all();
    }
}

fn find_member(pools: &[Vec<Arc<Zone>>], zone: &Arc<Zone>) -> Option<(usize, usize)> {
    for (class, members) in pools.iter().enumerate() {
        if let Some(index) = members.iter().position(|z| Arc::ptr_eq(z, zone)) {
            return Some((class, index));
        }
    }
    None
}

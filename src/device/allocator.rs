//! Zone placement.
//!
//! `allocate_io_zone` is the public placement API: given a write-lifetime
//! hint it hands back an exclusively held zone from the matching level
//! pool, growing the pool with a fresh empty zone when the open limit
//! allows it. The pool mutex plus its condvar form the single admission
//! point; everything else (zone scans, the backoff sleep, zone I/O) runs
//! outside it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use super::{ZonedDevice, METADATA_FILE_ID};
use crate::error::{Result, ZbdError};
use crate::lifetime::{IoType, Lifetime};
use crate::zone::Zone;

/// Randomized sleep used while waiting for an empty zone to appear. Grows
/// with the attempt count, capped at one second. Callers must not hold the
/// pool mutex across this.
pub(crate) fn backoff_sleep(attempt: u32) {
    let cap = (4_000u64 * attempt as u64).clamp(1, 1_000_000);
    let micros = rand::thread_rng().gen_range(0..cap);
    std::thread::sleep(Duration::from_micros(micros));
}

impl ZonedDevice {
    /// Places a write stream into a zone chosen by its lifetime hint.
    ///
    /// The returned zone is exclusively held for the caller; hand it back
    /// with [`ZonedDevice::release_level_zone`] once the stream is done
    /// with it. Non-WAL calls run the reclaim policies first; WAL calls
    /// skip them to keep tail latency down.
    pub fn allocate_io_zone(
        &self,
        file_lifetime: Lifetime,
        io_type: IoType,
        file_id: u64,
    ) -> Result<Arc<Zone>> {
        self.check_deferred()?;

        if io_type != IoType::Wal {
            self.apply_finish_threshold()?;
            self.reset_unused_io_zones()?;
        }

        // Unhinted data goes to the longest-lived class, except the
        // metadata file which cycles fast and belongs in class 0.
        let mut lifetime = file_lifetime;
        if lifetime < Lifetime::SHORT {
            lifetime = if file_id == METADATA_FILE_ID {
                self.lifetime_begin
            } else {
                Lifetime::for_class(self.lifetime_begin, self.level_count - 1)
            };
        }

        let level = lifetime
            .class(self.lifetime_begin)
            .filter(|class| *class < self.level_count)
            .ok_or_else(|| {
                ZbdError::InvalidArgument(format!(
                    "lifetime {lifetime} is outside the configured classes"
                ))
            })? as usize;

        let reuse = {
            let mut pools = self.pools.lock();

            loop {
                if self.level_available[level].load(Ordering::SeqCst) > 0
                    || self.open_io_zones.load(Ordering::SeqCst) < self.max_open_io_zones
                {
                    break;
                }
                self.pool_resources.wait(&mut pools);
            }

            if self.level_available[level].load(Ordering::SeqCst) > 0 {
                self.level_available[level].fetch_sub(1, Ordering::SeqCst);
                let zone = pools[level]
                    .iter()
                    .find(|z| !z.in_pool_use())
                    .cloned()
                    .ok_or_else(|| {
                        ZbdError::Corruption(format!(
                            "level {level} accounting says a zone is available but none is"
                        ))
                    })?;
                zone.set_in_pool_use(true);
                Some(zone)
            } else {
                self.open_io_zones.fetch_add(1, Ordering::SeqCst);
                self.active_io_zones.fetch_add(1, Ordering::SeqCst);
                None
            }
        };

        let (allocated, new_zone) = match reuse {
            Some(zone) => (zone, false),
            None => {
                // Tokens are held; find an empty zone, sleeping between
                // scans while the device has none.
                let mut attempt = 0u32;
                let zone = loop {
                    match self.allocate_empty_zone() {
                        Ok(Some(zone)) => break zone,
                        Ok(None) => {
                            attempt += 1;
                            backoff_sleep(attempt);
                        }
                        Err(e) => {
                            {
                                let _pools = self.pools.lock();
                                self.open_io_zones.fetch_sub(1, Ordering::SeqCst);
                                self.active_io_zones.fetch_sub(1, Ordering::SeqCst);
                            }
                            self.pool_resources.notify_all();
                            return Err(e);
                        }
                    }
                };

                zone.set_lifetime(lifetime);
                zone.set_in_pool_use(true);
                self.pools.lock()[level].push(Arc::clone(&zone));
                (zone, true)
            }
        };

        debug!(
            zone = allocated.zone_nr(),
            new = new_zone,
            level,
            file_id,
            wp = allocated.wp(),
            "allocated io zone"
        );

        self.stats.record_allocation(io_type);
        self.stats
            .set_zone_gauges(self.open_io_zones(), self.active_io_zones());
        if io_type != IoType::Wal {
            self.log_zone_stats();
        }

        Ok(allocated)
    }

    /// First acquirable empty IO zone, if the device has one. Zones held by
    /// writers, pools or the GC lane are skipped.
    pub(crate) fn allocate_empty_zone(&self) -> Result<Option<Arc<Zone>>> {
        for zone in self.io_zones() {
            if zone.acquire() {
                if zone.is_empty() {
                    return Ok(Some(Arc::clone(zone)));
                }
                zone.check_release()?;
            }
        }
        Ok(None)
    }

    /// An acquirable meta zone with no live data, reset first when it still
    /// holds stale log records. The caller owns the zone's busy lease.
    pub fn allocate_meta_zone(&self) -> Result<Arc<Zone>> {
        for zone in self.meta_zones() {
            if !zone.acquire() {
                continue;
            }

            if zone.is_used() {
                zone.check_release()?;
                continue;
            }

            if !zone.is_empty() {
                if let Err(e) = zone.reset() {
                    warn!(zone = zone.zone_nr(), error = %e, "failed resetting meta zone");
                    zone.check_release()?;
                    continue;
                }
            }

            return Ok(Arc::clone(zone));
        }

        error!("out of metadata zones, the filesystem should go read-only");
        Err(ZbdError::NoSpace("out of metadata zones".into()))
    }
}

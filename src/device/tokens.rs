//! Open/active token management.
//!
//! Two counted resources gate zone admission: `open` tokens bound the zones
//! concurrently accepting writes, `active` tokens bound the zones the
//! device tracks as open or partially written. Both counters live on the
//! device as atomics but are only mutated under the pool mutex, and every
//! release broadcasts on the pool condvar so blocked allocators re-check
//! their admission condition.

use std::sync::atomic::Ordering;

use super::ZonedDevice;

impl ZonedDevice {
    /// Blocks until an open token is available, then takes it.
    ///
    /// Non-prioritized callers wait for one slot more than prioritized
    /// ones, which keeps WAL writers from being starved by background
    /// traffic. The caller owns the token and must return it with
    /// [`ZonedDevice::put_open_io_zone_token`].
    pub fn wait_for_open_io_zone_token(&self, prioritized: bool) {
        let limit = if prioritized {
            self.max_open_io_zones
        } else {
            self.max_open_io_zones - 1
        };

        let mut pools = self.pools.lock();
        while self.open_io_zones.load(Ordering::SeqCst) >= limit {
            self.pool_resources.wait(&mut pools);
        }
        self.open_io_zones.fetch_add(1, Ordering::SeqCst);
    }

    /// Takes an active token if one is available right now.
    pub fn get_active_io_zone_token_if_available(&self) -> bool {
        let _pools = self.pools.lock();
        if self.active_io_zones.load(Ordering::SeqCst) < self.max_active_io_zones {
            self.active_io_zones.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Blocks until an active token is available, then takes it.
    pub(crate) fn wait_for_active_io_zone_token(&self) {
        let mut pools = self.pools.lock();
        while self.active_io_zones.load(Ordering::SeqCst) >= self.max_active_io_zones {
            self.pool_resources.wait(&mut pools);
        }
        self.active_io_zones.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns an open token and wakes blocked allocators.
    pub fn put_open_io_zone_token(&self) {
        {
            let _pools = self.pools.lock();
            self.open_io_zones.fetch_sub(1, Ordering::SeqCst);
        }
        self.pool_resources.notify_all();
    }

    /// Returns an active token and wakes blocked allocators.
    pub fn put_active_io_zone_token(&self) {
        {
            let _pools = self.pools.lock();
            self.active_io_zones.fetch_sub(1, Ordering::SeqCst);
        }
        self.pool_resources.notify_all();
    }
}

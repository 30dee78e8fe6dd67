//! End-to-end allocator scenarios against the zonefs-style transport.
//!
//! Every test formats a fresh device directory in a tempdir, mounts a
//! `ZonedDevice` on it and drives the public allocation API the way the
//! filesystem layer above would. Zone geometry is kept small (1 MiB zones,
//! 4 KiB blocks) so full-zone scenarios stay fast.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use zonekv::{
    BackendKind, DeviceOptions, IoType, Lifetime, ZbdError, ZoneFsBackend, ZoneFsGeometry,
    ZonedDevice, META_ZONE_COUNT,
};

const BLOCK: usize = 4096;
const ZONE_SIZE: u64 = 1 << 20;
const ZONE_COUNT: u32 = 64;

fn format_device(dir: &Path) {
    ZoneFsBackend::format(
        dir,
        ZoneFsGeometry {
            block_size: BLOCK as u32,
            zone_size: ZONE_SIZE,
            zone_count: ZONE_COUNT,
            max_open_zones: 14,
            max_active_zones: 14,
        },
    )
    .unwrap();
}

fn open_device(dir: &Path, level_count: u32, finish_threshold: u32) -> ZonedDevice {
    let options = DeviceOptions::new(BackendKind::zonefs(dir))
        .with_level_count(level_count)
        .with_finish_threshold(finish_threshold);
    ZonedDevice::open(options, false, true).unwrap()
}

/// Writes `blocks` blocks straight into a zone file, simulating state left
/// behind by a previous incarnation of the device.
fn prefill_zone(dir: &Path, zone_index: u32, blocks: usize) {
    let path = dir.join("seq").join(zone_index.to_string());
    std::fs::write(path, vec![0xEEu8; blocks * BLOCK]).unwrap();
}

#[test]
fn fresh_mount_classifies_zones_and_seeds_pools() {
    let dir = tempdir().unwrap();
    format_device(dir.path());

    let device = open_device(dir.path(), 8, 0);

    assert_eq!(device.meta_zone_count(), META_ZONE_COUNT);
    assert_eq!(device.io_zone_count(), 61);
    assert_eq!(device.max_open_io_zones(), 12);
    assert_eq!(device.max_active_io_zones(), 12);
    assert_eq!(device.open_io_zones(), 8);
    assert_eq!(device.active_io_zones(), 8);
    assert_eq!(device.free_space(), 61 * ZONE_SIZE);
    assert_eq!(device.used_space(), 0);
}

#[test]
fn mount_requires_exclusive_write_open() {
    let dir = tempdir().unwrap();
    format_device(dir.path());

    let options = DeviceOptions::new(BackendKind::zonefs(dir.path()));
    let err = ZonedDevice::open(options, false, false).unwrap_err();

    assert!(matches!(err, ZbdError::InvalidArgument(_)));
}

#[test]
fn second_exclusive_mount_is_locked_out() {
    let dir = tempdir().unwrap();
    format_device(dir.path());

    let _device = open_device(dir.path(), 8, 0);

    let options = DeviceOptions::new(BackendKind::zonefs(dir.path()));
    let err = ZonedDevice::open(options, false, true).unwrap_err();
    assert!(matches!(err, ZbdError::Io(_)));
}

#[test]
fn too_few_zones_is_not_supported() {
    let dir = tempdir().unwrap();
    ZoneFsBackend::format(
        dir.path(),
        ZoneFsGeometry {
            block_size: BLOCK as u32,
            zone_size: ZONE_SIZE,
            zone_count: 16,
            max_open_zones: 14,
            max_active_zones: 14,
        },
    )
    .unwrap();

    let options = DeviceOptions::new(BackendKind::zonefs(dir.path()));
    let err = ZonedDevice::open(options, false, true).unwrap_err();
    assert!(matches!(err, ZbdError::NotSupported(_)));
}

#[test]
fn allocation_reuses_the_class_zone_then_grows_the_pool() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 8, 0);

    // Class 3 is seeded with one zone; the first writer reuses it.
    let first = device
        .allocate_io_zone(Lifetime::for_class(Lifetime::NONE, 3), IoType::Other, 1)
        .unwrap();
    assert_eq!(device.open_io_zones(), 8);

    // A second concurrent writer of the same class forces pool growth.
    let second = device
        .allocate_io_zone(Lifetime::for_class(Lifetime::NONE, 3), IoType::Other, 2)
        .unwrap();
    assert_eq!(device.open_io_zones(), 9);
    assert_eq!(device.active_io_zones(), 9);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.lifetime(), Lifetime::for_class(Lifetime::NONE, 3));

    device.release_level_zone(&first).unwrap();
    device.release_level_zone(&second).unwrap();
}

#[test]
fn unhinted_writes_map_to_metadata_or_highest_class() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 8, 0);

    let metadata = device
        .allocate_io_zone(Lifetime::NOT_SET, IoType::Other, zonekv::METADATA_FILE_ID)
        .unwrap();
    assert_eq!(metadata.lifetime(), Lifetime::NONE);

    let other = device
        .allocate_io_zone(Lifetime::NOT_SET, IoType::Other, 77)
        .unwrap();
    assert_eq!(other.lifetime(), Lifetime::for_class(Lifetime::NONE, 7));

    device.release_level_zone(&metadata).unwrap();
    device.release_level_zone(&other).unwrap();
}

#[test]
fn writers_block_once_open_tokens_are_exhausted() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    // One reuse plus eleven pool growths exhaust the 12 open tokens.
    let mut held = Vec::new();
    for id in 0..12u64 {
        held.push(
            device
                .allocate_io_zone(Lifetime::NONE, IoType::Other, id)
                .unwrap(),
        );
    }
    assert_eq!(device.open_io_zones(), 12);
    assert_eq!(device.active_io_zones(), 12);

    let starts: HashSet<u64> = held.iter().map(|z| z.start()).collect();
    assert_eq!(starts.len(), 12, "writers must hold distinct zones");

    let unblocked = AtomicBool::new(false);
    thread::scope(|scope| {
        let blocked_writer = scope.spawn(|| {
            let zone = device
                .allocate_io_zone(Lifetime::NONE, IoType::Other, 99)
                .unwrap();
            unblocked.store(true, Ordering::SeqCst);
            zone
        });

        thread::sleep(Duration::from_millis(200));
        assert!(
            !unblocked.load(Ordering::SeqCst),
            "13th writer must block while no token or pool zone is free"
        );

        device.release_level_zone(&held[0]).unwrap();
        let granted = blocked_writer.join().unwrap();

        assert!(unblocked.load(Ordering::SeqCst));
        assert!(Arc::ptr_eq(&granted, &held[0]));
        assert!(device.open_io_zones() <= device.max_open_io_zones());
        assert!(device.active_io_zones() <= device.max_active_io_zones());
    });
}

#[test]
fn reclaim_resets_an_invalidated_pool_zone_and_keeps_the_class_seeded() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    let zone = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 1)
        .unwrap();
    zone.append(&[0x11u8; BLOCK]).unwrap();
    zone.inc_used_capacity(BLOCK as u64);
    device.release_level_zone(&zone).unwrap();

    // Live data still present: reclaim must leave the zone alone.
    device.reset_unused_io_zones().unwrap();
    assert!(!zone.is_empty());

    // The filesystem layer invalidates the data; the zone is now garbage.
    zone.dec_used_capacity(BLOCK as u64);
    device.reset_unused_io_zones().unwrap();

    assert!(zone.is_empty(), "garbage zone must be reset");
    // The zone was the last member of its class, so the pool was reseeded
    // and the tokens moved to the replacement.
    assert_eq!(device.open_io_zones(), 1);
    assert_eq!(device.active_io_zones(), 1);

    // A fresh allocation still succeeds from the reseeded pool.
    let next = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 2)
        .unwrap();
    device.release_level_zone(&next).unwrap();
}

#[test]
fn reclaim_retires_surplus_pool_zones_and_refunds_their_tokens() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    let first = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 1)
        .unwrap();
    let second = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 2)
        .unwrap();
    assert_eq!(device.open_io_zones(), 2);

    for zone in [&first, &second] {
        zone.append(&[0x22u8; BLOCK]).unwrap();
        device.release_level_zone(zone).unwrap();
    }

    // Both zones hold only garbage. One is retired, the class keeps the
    // other's replacement, and the books return to one token pair.
    device.reset_unused_io_zones().unwrap();

    assert_eq!(device.open_io_zones(), 1);
    assert_eq!(device.active_io_zones(), 1);
    assert!(first.is_empty() && second.is_empty());

    // Idempotence: a second pass with no intervening writes changes
    // nothing.
    device.reset_unused_io_zones().unwrap();
    assert_eq!(device.open_io_zones(), 1);
    assert_eq!(device.active_io_zones(), 1);
}

#[test]
fn reclaim_refunds_an_active_token_for_partial_free_floating_zones() {
    let dir = tempdir().unwrap();
    // A previous incarnation left a partially written zone behind.
    format_device(dir.path());
    prefill_zone(dir.path(), 10, 1);

    let device = open_device(dir.path(), 1, 0);
    assert_eq!(device.active_io_zones(), 2, "1 pool seed + 1 mount-time active");

    device.reset_unused_io_zones().unwrap();

    assert_eq!(device.active_io_zones(), 1, "partial zone refunds its token");
    let zone = device.get_io_zone(10 * ZONE_SIZE).unwrap();
    assert!(zone.is_empty());
}

#[test]
fn reclaim_does_not_refund_tokens_for_full_zones() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    prefill_zone(dir.path(), 10, (ZONE_SIZE as usize) / BLOCK);

    let device = open_device(dir.path(), 1, 0);
    // A full zone is not active, so only the pool seed holds a token.
    assert_eq!(device.active_io_zones(), 1);
    assert_eq!(device.reclaimable_space(), ZONE_SIZE);

    device.reset_unused_io_zones().unwrap();

    assert_eq!(device.active_io_zones(), 1);
    assert_eq!(device.reclaimable_space(), 0);
    assert_eq!(device.free_space(), 61 * ZONE_SIZE);
}

#[test]
fn after_reclaim_no_zone_holds_garbage_only_data() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    prefill_zone(dir.path(), 5, 3);
    prefill_zone(dir.path(), 20, 7);

    let device = open_device(dir.path(), 2, 0);
    device.log_garbage_info();
    device.log_zone_usage();
    device.reset_unused_io_zones().unwrap();

    for snapshot in device.zone_snapshot() {
        assert!(
            !(snapshot.used_capacity == 0 && snapshot.wp > snapshot.start),
            "zone at 0x{:x} still holds garbage",
            snapshot.start
        );
    }
}

#[test]
fn finish_threshold_finishes_nearly_full_zones_and_refunds_the_token() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    // 0.8 MiB written leaves 0.2 MiB, under 25% of 1 MiB.
    prefill_zone(dir.path(), 10, 200);

    let device = open_device(dir.path(), 1, 25);
    let zone = device.get_io_zone(10 * ZONE_SIZE).unwrap();
    zone.inc_used_capacity(200 * BLOCK as u64);
    assert_eq!(device.active_io_zones(), 2);

    device.apply_finish_threshold().unwrap();

    assert!(zone.is_full());
    assert_eq!(zone.wp(), zone.start() + ZONE_SIZE);
    assert_eq!(device.active_io_zones(), 1);

    // Idempotent: the zone is full now and no longer eligible.
    device.apply_finish_threshold().unwrap();
    assert_eq!(device.active_io_zones(), 1);
}

#[test]
fn non_wal_allocation_drives_the_finish_threshold() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    prefill_zone(dir.path(), 10, 200);

    let device = open_device(dir.path(), 1, 25);
    let prefilled = device.get_io_zone(10 * ZONE_SIZE).unwrap();
    prefilled.inc_used_capacity(200 * BLOCK as u64);

    let zone = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 1)
        .unwrap();

    assert!(prefilled.is_full());
    assert_eq!(device.active_io_zones(), 1);
    device.release_level_zone(&zone).unwrap();
}

#[test]
fn wal_allocation_skips_reclaim_policies() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    prefill_zone(dir.path(), 10, 200);

    let device = open_device(dir.path(), 1, 25);
    let prefilled = device.get_io_zone(10 * ZONE_SIZE).unwrap();
    prefilled.inc_used_capacity(200 * BLOCK as u64);

    let zone = device
        .allocate_io_zone(Lifetime::NONE, IoType::Wal, 1)
        .unwrap();

    assert!(!prefilled.is_full(), "WAL writers must not pay for reclaim");
    device.release_level_zone(&zone).unwrap();
}

#[test]
fn cheapest_finish_picks_the_zone_with_least_remaining_capacity() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    prefill_zone(dir.path(), 10, 128); // 0.5 MiB left
    prefill_zone(dir.path(), 12, 64); // 0.75 MiB left

    let device = open_device(dir.path(), 1, 0);
    let cheap = device.get_io_zone(10 * ZONE_SIZE).unwrap();
    let expensive = device.get_io_zone(12 * ZONE_SIZE).unwrap();
    cheap.inc_used_capacity(128 * BLOCK as u64);
    expensive.inc_used_capacity(64 * BLOCK as u64);
    let active_before = device.active_io_zones();

    device.finish_cheapest_io_zone().unwrap();

    assert!(cheap.is_full());
    assert!(!expensive.is_full());
    assert_eq!(device.active_io_zones(), active_before - 1);
}

#[test]
fn cheapest_finish_breaks_ties_towards_the_first_zone() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    prefill_zone(dir.path(), 10, 64);
    prefill_zone(dir.path(), 12, 64);

    let device = open_device(dir.path(), 1, 0);
    let first = device.get_io_zone(10 * ZONE_SIZE).unwrap();
    let second = device.get_io_zone(12 * ZONE_SIZE).unwrap();
    first.inc_used_capacity(64 * BLOCK as u64);
    second.inc_used_capacity(64 * BLOCK as u64);

    device.finish_cheapest_io_zone().unwrap();

    assert!(first.is_full());
    assert!(!second.is_full());
}

#[test]
fn cheapest_finish_is_a_no_op_without_partial_zones() {
    let dir = tempdir().unwrap();
    format_device(dir.path());

    let device = open_device(dir.path(), 1, 0);
    let active_before = device.active_io_zones();

    device.finish_cheapest_io_zone().unwrap();

    assert_eq!(device.active_io_zones(), active_before);
}

#[test]
fn meta_zone_allocation_resets_stale_log_zones() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    // Meta zone 0 still holds records from the previous log generation.
    prefill_zone(dir.path(), 0, 4);

    let device = open_device(dir.path(), 1, 0);
    let meta = device.allocate_meta_zone().unwrap();

    assert!(meta.start() < META_ZONE_COUNT as u64 * ZONE_SIZE);
    assert!(meta.is_empty(), "stale meta zone must be reset before reuse");

    meta.append(&[0x33u8; BLOCK]).unwrap();
    meta.check_release().unwrap();
}

#[test]
fn meta_zones_with_live_records_are_skipped() {
    let dir = tempdir().unwrap();
    format_device(dir.path());

    let device = open_device(dir.path(), 1, 0);

    let first = device.allocate_meta_zone().unwrap();
    first.append(&[0x44u8; BLOCK]).unwrap();
    first.inc_used_capacity(BLOCK as u64);
    first.check_release().unwrap();

    let second = device.allocate_meta_zone().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    second.check_release().unwrap();
}

#[test]
fn deferred_errors_fail_allocations_until_cleared() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    device.set_deferred_error(ZbdError::Io("lost the device".into()));
    // The first latched error wins over later ones.
    device.set_deferred_error(ZbdError::NoSpace("later".into()));
    assert_eq!(
        device.deferred_error(),
        Some(ZbdError::Io("lost the device".into()))
    );

    let err = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 1)
        .unwrap_err();
    assert_eq!(err, ZbdError::Io("lost the device".into()));

    device.clear_deferred_error();
    let zone = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 1)
        .unwrap();
    device.release_level_zone(&zone).unwrap();
}

#[test]
fn appended_data_reads_back_through_the_device() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    let zone = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 1)
        .unwrap();
    let payload: Vec<u8> = (0..BLOCK * 2).map(|i| (i % 251) as u8).collect();
    zone.append(&payload).unwrap();
    zone.inc_used_capacity(payload.len() as u64);

    let mut readback = vec![0u8; payload.len()];
    let n = device.read(&mut readback, zone.start(), false).unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(readback, payload);

    device.invalidate_cache(zone.start(), payload.len() as u64).unwrap();
    device.release_level_zone(&zone).unwrap();
}

#[test]
fn get_io_zone_maps_offsets_to_zones() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    let zone = device.get_io_zone(5 * ZONE_SIZE + 4096).unwrap();
    assert_eq!(zone.start(), 5 * ZONE_SIZE);

    assert!(device.get_io_zone(ZONE_COUNT as u64 * ZONE_SIZE).is_none());
}

#[test]
fn token_waits_reserve_a_slot_for_prioritized_writers() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    // Fill up to one below the open limit.
    while device.open_io_zones() < device.max_open_io_zones() - 1 {
        device.wait_for_open_io_zone_token(false);
    }

    let unblocked = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            device.wait_for_open_io_zone_token(false);
            unblocked.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(150));
        assert!(
            !unblocked.load(Ordering::SeqCst),
            "non-prioritized waiter must not take the reserved slot"
        );

        // A prioritized writer takes the last slot immediately.
        device.wait_for_open_io_zone_token(true);
        assert_eq!(device.open_io_zones(), device.max_open_io_zones());

        // Returning tokens unblocks the waiter.
        device.put_open_io_zone_token();
        device.put_open_io_zone_token();
    });
    assert!(unblocked.load(Ordering::SeqCst));
}

#[test]
fn free_space_accounting_matches_write_pointers() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 2, 0);

    let zone = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 1)
        .unwrap();
    zone.append(&[0x55u8; BLOCK * 3]).unwrap();
    device.release_level_zone(&zone).unwrap();

    let written: u64 = device
        .zone_snapshot()
        .iter()
        .map(|s| s.wp - s.start)
        .sum();
    let max: u64 = device.zone_snapshot().iter().map(|s| s.max_capacity).sum();

    assert_eq!(device.free_space() + written, max);
}

#[test]
fn json_encoding_lists_meta_and_io_zones() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    let mut encoded = Vec::new();
    device.encode_json(&mut encoded).unwrap();

    let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
    assert_eq!(value["meta"].as_array().unwrap().len(), 3);
    assert_eq!(value["io"].as_array().unwrap().len(), 61);

    let zone = &value["io"][0];
    for field in ["start", "capacity", "max_capacity", "wp", "lifetime", "used_capacity"] {
        assert!(zone.get(field).is_some(), "missing field {field}");
    }
}

#[test]
fn stats_track_allocations_and_bytes() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    let zone = device
        .allocate_io_zone(Lifetime::NONE, IoType::Other, 1)
        .unwrap();
    zone.append(&[0x66u8; BLOCK]).unwrap();
    device.release_level_zone(&zone).unwrap();

    let snapshot = device.stats().snapshot();
    assert_eq!(snapshot.other_allocations, 1);
    assert!(snapshot.bytes_written >= BLOCK as u64);
    assert_eq!(snapshot.open_io_zones, device.open_io_zones());
}

#[test]
fn close_quiesces_the_device() {
    let dir = tempdir().unwrap();
    format_device(dir.path());
    let device = open_device(dir.path(), 1, 0);

    device.close().unwrap();
}

#[test]
fn readonly_mount_skips_pool_seeding() {
    let dir = tempdir().unwrap();
    format_device(dir.path());

    let options = DeviceOptions::new(BackendKind::zonefs(dir.path()));
    let device = ZonedDevice::open(options, true, false).unwrap();

    assert_eq!(device.open_io_zones(), 0);
    assert_eq!(device.active_io_zones(), 0);
}

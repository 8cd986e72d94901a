//! # Persistence Tests
//!
//! Durability guarantees across close/reopen cycles: byte-identical
//! content at byte-identical addresses, metadata replica selection under
//! corruption, free-space caches rebuilt from the page directory, and the
//! copy-on-write protocol observed across epochs.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use permarena::config::{METADATA_BYTES, PAGE_SIZE, SNAPSHOT_FILENAME};
use permarena::{Arena, ArenaOptions, PageStatus};
use tempfile::tempdir;

static NEXT_BASE: AtomicU64 = AtomicU64::new(0);

fn test_options() -> ArenaOptions {
    let slot = NEXT_BASE.fetch_add(1, Ordering::Relaxed);
    ArenaOptions {
        base_addr: 0x1600_0000_0000 + slot * 0x40_0000_0000,
        strict: false,
    }
}

fn write_bytes(ptr: NonNull<u8>, pattern: u8, len: usize) {
    // Content writes go straight through the mapping; the pages are
    // writable (fresh allocation or prepared for write).
    unsafe { ptr.as_ptr().write_bytes(pattern, len) };
}

fn read_bytes(addr: u64, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
}

mod round_trip {
    use super::*;

    #[test]
    fn content_and_addresses_survive_reopen() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        let (small_addr, large_addr) = {
            let mut arena = Arena::create_with(&path, options).unwrap();
            let small = arena.allocate(64).unwrap();
            let large = arena.allocate(2 * PAGE_SIZE).unwrap();
            write_bytes(small, 0xC3, 64);
            write_bytes(large, 0x7E, 2 * PAGE_SIZE);
            arena.sync(1, 1).unwrap();
            (small.as_ptr() as u64, large.as_ptr() as u64)
        };

        let arena = Arena::open_with(&path, options).unwrap();

        assert_eq!(
            arena.page_status(small_addr as *const u8),
            Some(PageStatus::Shared)
        );
        assert_eq!(
            arena.page_status(large_addr as *const u8),
            Some(PageStatus::First)
        );
        assert!(read_bytes(small_addr, 64).iter().all(|&b| b == 0xC3));
        assert!(read_bytes(large_addr, 2 * PAGE_SIZE).iter().all(|&b| b == 0x7E));
    }

    #[test]
    fn slab_pages_keep_working_after_reopen() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        let first_addr = {
            let mut arena = Arena::create_with(&path, options).unwrap();
            let first = arena.allocate(64).unwrap();
            write_bytes(first, 0x11, 64);
            arena.sync(1, 1).unwrap();
            first.as_ptr() as u64
        };

        let mut arena = Arena::open_with(&path, options).unwrap();

        // The bucket stack head persisted through metadata, so the next
        // same-class allocation packs into the same page without touching
        // the preserved slot.
        let second = arena.allocate(64).unwrap();
        let second_addr = second.as_ptr() as u64;
        assert_eq!(
            first_addr & !(PAGE_SIZE as u64 - 1),
            second_addr & !(PAGE_SIZE as u64 - 1)
        );
        assert_ne!(first_addr, second_addr);
        assert!(read_bytes(first_addr, 64).iter().all(|&b| b == 0x11));

        // Freeing the preserved slot still works across the restart.
        arena.deallocate(first_addr as *mut u8);
        let reused = arena.allocate(64).unwrap();
        assert_eq!(reused.as_ptr() as u64, first_addr);
    }

    #[test]
    fn mutation_after_reopen_round_trips_again() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        let addr = {
            let mut arena = Arena::create_with(&path, options).unwrap();
            let ptr = arena.allocate(PAGE_SIZE).unwrap();
            write_bytes(ptr, 0xAA, PAGE_SIZE);
            arena.sync(1, 1).unwrap();
            ptr.as_ptr() as u64
        };

        {
            let mut arena = Arena::open_with(&path, options).unwrap();
            let ptr = NonNull::new(addr as *mut u8).unwrap();
            arena.prepare_write(ptr, PAGE_SIZE).unwrap();
            write_bytes(ptr, 0xBB, PAGE_SIZE);
            arena.sync(2, 2).unwrap();
        }

        let _arena = Arena::open_with(&path, options).unwrap();
        assert!(read_bytes(addr, PAGE_SIZE).iter().all(|&b| b == 0xBB));
    }
}

mod free_space {
    use super::*;

    #[test]
    fn free_runs_are_rebuilt_from_the_directory() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        let run_addr = {
            let mut arena = Arena::create_with(&path, options).unwrap();
            let run = arena.allocate(3 * PAGE_SIZE).unwrap();
            arena.deallocate(run.as_ptr());
            arena.sync(1, 1).unwrap();
            run.as_ptr() as u64
        };

        let mut arena = Arena::open_with(&path, options).unwrap();

        assert_eq!(arena.stats().free_run_pages, 3);
        // Exact-length reuse hands back the same base address.
        let again = arena.allocate(3 * PAGE_SIZE).unwrap();
        assert_eq!(again.as_ptr() as u64, run_addr);
        assert_eq!(arena.stats().free_run_pages, 0);
    }

    #[test]
    fn single_free_pages_are_rebuilt_too() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        let page_addr = {
            let mut arena = Arena::create_with(&path, options).unwrap();
            let page = arena.allocate(PAGE_SIZE).unwrap();
            arena.deallocate(page.as_ptr());
            arena.sync(1, 1).unwrap();
            page.as_ptr() as u64
        };

        let mut arena = Arena::open_with(&path, options).unwrap();

        assert_eq!(arena.stats().free_single_pages, 1);
        let again = arena.allocate(PAGE_SIZE).unwrap();
        assert_eq!(again.as_ptr() as u64, page_addr);
    }
}

mod copy_on_write {
    use super::*;

    #[test]
    fn first_touch_after_reopen_relocates_exactly_once() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        let addr = {
            let mut arena = Arena::create_with(&path, options).unwrap();
            let ptr = arena.allocate(PAGE_SIZE).unwrap();
            arena.sync(1, 1).unwrap();
            ptr.as_ptr() as u64
        };

        let mut arena = Arena::open_with(&path, options).unwrap();
        let ptr = NonNull::new(addr as *mut u8).unwrap();

        arena.prepare_write(ptr, PAGE_SIZE).unwrap();
        let after_first = arena.stats();

        // Preparing the same range again in the same epoch is free: the
        // page is already writable, so no block moves and nothing is
        // logged.
        arena.prepare_write(ptr, PAGE_SIZE).unwrap();
        let after_second = arena.stats();

        assert_eq!(after_first, after_second);
        assert!(after_first.dirty_log_len >= 1);
    }
}

mod metadata_replicas {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::unix::fs::FileExt;

    fn corrupt_replica(path: &std::path::Path, replica: usize) {
        let snap = OpenOptions::new()
            .write(true)
            .open(path.join(SNAPSHOT_FILENAME))
            .unwrap();
        snap.write_all_at(&[0x5C; 256], (replica * PAGE_SIZE) as u64 + 64)
            .unwrap();
    }

    #[test]
    fn one_torn_replica_is_survivable() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        let addr = {
            let mut arena = Arena::create_with(&path, options).unwrap();
            let ptr = arena.allocate(128).unwrap();
            write_bytes(ptr, 0x42, 128);
            arena.sync(1, 1).unwrap();
            ptr.as_ptr() as u64
        };

        corrupt_replica(&path, 0);

        let arena = Arena::open_with(&path, options).unwrap();
        assert_eq!(arena.page_status(addr as *const u8), Some(PageStatus::Shared));
        assert!(read_bytes(addr, 128).iter().all(|&b| b == 0x42));
    }

    #[test]
    fn losing_every_replica_is_fatal() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        {
            let mut arena = Arena::create_with(&path, options).unwrap();
            arena.sync(1, 1).unwrap();
        }

        for replica in 0..(METADATA_BYTES / PAGE_SIZE) {
            corrupt_replica(&path, replica);
        }

        assert!(Arena::open_with(&path, options).is_err());
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn open_of_a_missing_arena_fails() {
        let dir = tempdir().unwrap();
        assert!(Arena::open_with(dir.path().join("nope"), test_options()).is_err());
    }

    #[test]
    fn load_creates_then_reopens() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        let addr = {
            let mut arena = Arena::load_with(&path, options).unwrap();
            let ptr = arena.allocate(32).unwrap();
            arena.sync(1, 1).unwrap();
            ptr.as_ptr() as u64
        };

        let arena = Arena::load_with(&path, options).unwrap();
        assert_eq!(arena.page_status(addr as *const u8), Some(PageStatus::Shared));
    }

    #[test]
    fn reopening_at_a_different_base_is_rejected() {
        let dir = tempdir().unwrap();
        let options = test_options();
        let path = dir.path().join("arena");

        {
            let mut arena = Arena::create_with(&path, options).unwrap();
            arena.sync(1, 1).unwrap();
        }

        let mut other = options;
        other.base_addr += 0x1000_0000;
        assert!(Arena::open_with(&path, other).is_err());
    }
}

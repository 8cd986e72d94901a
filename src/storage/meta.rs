//! # Arena Metadata and Dirty-Page Log
//!
//! The metadata record describes the whole arena: bounds, slab bucket
//! heads, dpage-cache location, snapshot file accounting, the most recent
//! processed event, and the dirty-page log of directory mutations not yet
//! applied. It occupies exactly one page and is stored as
//! `METADATA_PAGE_COUNT` byte-identical replicas at the front of the
//! snapshot file.
//!
//! ## Crash Atomicity
//!
//! Replication is the atomic-update mechanism. A sync writes the sealed
//! page to each replica slot in order, with a data sync after each, so a
//! torn write can corrupt at most the replica being written while the
//! others stay valid. On reload every replica is checksum-validated and
//! the valid one with the greatest `(epoch, event)` wins.
//!
//! ## The Dirty Log as Redo Record
//!
//! The persisted log rides inside the metadata page and records exactly
//! the directory mutations the owning sync pass was about to apply (in
//! append order, which encodes causal dependency). Applying a log
//! record is idempotent, so reload can always replay the newest replica's
//! log against the page directory without knowing whether the pass
//! finished.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size   Field
//! ------  -----  ---------------------------------------------
//! 0       8      magic
//! 8       4      checksum (CRC-32 of the page with this field zeroed)
//! 12      4      version
//! 16      8      epoch
//! 24      8      event
//! 32      8      arena_start
//! 40      8      arena_end
//! 48      56     shared_heads[7] (slab bucket stack heads, page indices)
//! 104     8      dpage_cache_index
//! 112     8      snapshot_size
//! 120     8      next_offset
//! 128     4      dirty_len
//! 132     4      reserved
//! 136     3960   dirty_log[165] (24 bytes each)
//! ```

use std::fs::File;
use std::os::unix::fs::FileExt;

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::directory::PageStatus;
use crate::config::{
    DATA_VERSION, DIRTY_ENTRY_BYTES, DIRTY_LOG_CAPACITY, MAGIC_CODE, METADATA_BYTES,
    META_FIXED_BYTES, NO_PAGE, PAGE_SIZE, SHARED_BUCKET_COUNT,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The checksum collaborator: CRC-32 over `bytes`.
pub fn checksum(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Byte range of the checksum field within the metadata page.
const CHECKSUM_RANGE: std::ops::Range<usize> = 8..12;

/// One pending page-directory mutation.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DirtyLogEntry {
    index: U64,
    offset: U64,
    page_count: U32,
    status: u8,
    reserved: [u8; 3],
}

const _: () = assert!(std::mem::size_of::<DirtyLogEntry>() == DIRTY_ENTRY_BYTES);

impl DirtyLogEntry {
    pub fn new(index: u64, offset: u64, status: PageStatus, page_count: u32) -> Self {
        Self {
            index: U64::new(index),
            offset: U64::new(offset),
            page_count: U32::new(page_count),
            status: status as u8,
            reserved: [0; 3],
        }
    }

    pub fn index(&self) -> u64 {
        self.index.get()
    }

    /// Disk offset the record assigns, or 0 for "leave the stored offset
    /// unchanged".
    pub fn offset(&self) -> u64 {
        self.offset.get()
    }

    pub fn status(&self) -> PageStatus {
        PageStatus::from_byte(self.status)
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }
}

/// The arena metadata page.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Metadata {
    magic: U64,
    checksum: U32,
    version: U32,
    epoch: U64,
    event: U64,
    arena_start: U64,
    arena_end: U64,
    shared_heads: [U64; SHARED_BUCKET_COUNT],
    dpage_cache_index: U64,
    snapshot_size: U64,
    next_offset: U64,
    dirty_len: U32,
    reserved: U32,
    dirty_log: [DirtyLogEntry; DIRTY_LOG_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<Metadata>() == PAGE_SIZE);
const _: () = {
    assert!(std::mem::offset_of!(Metadata, dirty_log) == META_FIXED_BYTES);
    assert!(std::mem::offset_of!(Metadata, checksum) == CHECKSUM_RANGE.start);
};

impl Metadata {
    /// Fresh-arena metadata for an arena whose reserved range starts at
    /// `base_addr`. The content area begins above the replica pages and is
    /// empty; the snapshot file is pre-sized and its first free block sits
    /// just past the replicas.
    pub fn new(base_addr: u64) -> Self {
        let arena_start = base_addr + METADATA_BYTES as u64;
        Self {
            magic: U64::new(MAGIC_CODE),
            checksum: U32::new(0),
            version: U32::new(DATA_VERSION),
            epoch: U64::new(0),
            event: U64::new(0),
            arena_start: U64::new(arena_start),
            arena_end: U64::new(arena_start),
            shared_heads: [U64::new(NO_PAGE); SHARED_BUCKET_COUNT],
            dpage_cache_index: U64::new(NO_PAGE),
            snapshot_size: U64::new(crate::config::INITIAL_SNAPSHOT_BYTES),
            next_offset: U64::new(METADATA_BYTES as u64),
            dirty_len: U32::new(0),
            reserved: U32::new(0),
            dirty_log: [DirtyLogEntry::new(0, 0, PageStatus::Unallocated, 0); DIRTY_LOG_CAPACITY],
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = U64::new(epoch);
    }

    pub fn event(&self) -> u64 {
        self.event.get()
    }

    pub fn set_event(&mut self, event: u64) {
        self.event = U64::new(event);
    }

    pub fn arena_start(&self) -> u64 {
        self.arena_start.get()
    }

    pub fn arena_end(&self) -> u64 {
        self.arena_end.get()
    }

    pub fn set_arena_end(&mut self, end: u64) {
        self.arena_end = U64::new(end);
    }

    /// Head page index of the slab stack for bucket slot `slot`
    /// (`NO_PAGE` when empty).
    pub fn shared_head(&self, slot: usize) -> u64 {
        self.shared_heads[slot].get()
    }

    pub fn set_shared_head(&mut self, slot: usize, index: u64) {
        self.shared_heads[slot] = U64::new(index);
    }

    pub fn dpage_cache_index(&self) -> u64 {
        self.dpage_cache_index.get()
    }

    pub fn set_dpage_cache_index(&mut self, index: u64) {
        self.dpage_cache_index = U64::new(index);
    }

    pub fn snapshot_size(&self) -> u64 {
        self.snapshot_size.get()
    }

    pub fn set_snapshot_size(&mut self, size: u64) {
        self.snapshot_size = U64::new(size);
    }

    /// Next never-handed-out disk block offset at the end of the file.
    pub fn next_offset(&self) -> u64 {
        self.next_offset.get()
    }

    pub fn set_next_offset(&mut self, offset: u64) {
        self.next_offset = U64::new(offset);
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty_len.get() as usize
    }

    /// Slots left in the dirty log.
    pub fn dirty_remaining(&self) -> usize {
        DIRTY_LOG_CAPACITY - self.dirty_len()
    }

    /// The pending mutations, in append order.
    pub fn dirty_entries(&self) -> &[DirtyLogEntry] {
        &self.dirty_log[..self.dirty_len()]
    }

    /// Appends a pending mutation. The caller maintains headroom via
    /// `dirty_remaining`; a full log here is a hard error.
    pub fn push_dirty(&mut self, entry: DirtyLogEntry) -> Result<()> {
        let len = self.dirty_len();
        ensure!(
            len < DIRTY_LOG_CAPACITY,
            "dirty-page log overflow ({} entries)",
            DIRTY_LOG_CAPACITY
        );
        self.dirty_log[len] = entry;
        self.dirty_len = U32::new(len as u32 + 1);
        Ok(())
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_len = U32::new(0);
    }

    /// CRC-32 of the page with the checksum field zeroed.
    fn compute_checksum(&self) -> u32 {
        let mut page = [0u8; PAGE_SIZE];
        page.copy_from_slice(self.as_bytes());
        page[CHECKSUM_RANGE].fill(0);
        checksum(&page)
    }

    /// Stamps the checksum field.
    pub fn seal(&mut self) {
        self.checksum = U32::new(0);
        let sum = self.compute_checksum();
        self.checksum = U32::new(sum);
    }

    /// Decodes and validates one replica page.
    pub fn validate(bytes: &[u8]) -> Result<Metadata> {
        ensure!(
            bytes.len() == PAGE_SIZE,
            "metadata replica must be exactly one page, got {} bytes",
            bytes.len()
        );
        let meta = Metadata::read_from_bytes(bytes)
            .map_err(|e| eyre::eyre!("failed to decode metadata page: {e:?}"))?;
        ensure!(meta.magic.get() == MAGIC_CODE, "bad magic in metadata page");
        ensure!(
            meta.version.get() == DATA_VERSION,
            "unsupported snapshot version {} (expected {})",
            meta.version.get(),
            DATA_VERSION
        );
        ensure!(
            meta.dirty_len() <= DIRTY_LOG_CAPACITY,
            "metadata dirty-log length {} exceeds capacity",
            meta.dirty_len()
        );
        let recorded = meta.checksum.get();
        ensure!(
            recorded == meta.compute_checksum(),
            "metadata checksum mismatch"
        );
        Ok(meta)
    }

    /// Reads every replica slot and returns the valid copy with the
    /// greatest `(epoch, event)`.
    pub fn read_newest(file: &File) -> Result<Metadata> {
        let mut newest: Option<Metadata> = None;
        let mut rejected = 0usize;
        for slot in 0..crate::config::METADATA_PAGE_COUNT {
            let mut page = [0u8; PAGE_SIZE];
            file.read_exact_at(&mut page, (slot * PAGE_SIZE) as u64)
                .wrap_err_with(|| format!("failed to read metadata replica {slot}"))?;
            match Metadata::validate(&page) {
                Ok(meta) => {
                    let better = newest
                        .as_ref()
                        .is_none_or(|best| (meta.epoch(), meta.event()) > (best.epoch(), best.event()));
                    if better {
                        newest = Some(meta);
                    }
                }
                Err(_) => rejected += 1,
            }
        }
        match newest {
            Some(meta) => Ok(meta),
            None => bail!("no valid metadata replica found ({rejected} rejected)"),
        }
    }

    /// Seals and writes this page to every replica slot, syncing after
    /// each so a torn write can corrupt at most one copy.
    pub fn write_replicas(&mut self, file: &File) -> Result<()> {
        self.seal();
        for slot in 0..crate::config::METADATA_PAGE_COUNT {
            file.write_all_at(self.as_bytes(), (slot * PAGE_SIZE) as u64)
                .wrap_err_with(|| format!("failed to write metadata replica {slot}"))?;
            file.sync_data()
                .wrap_err_with(|| format!("failed to sync metadata replica {slot}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn snapshot_file() -> (tempfile::TempDir, File) {
        let dir = tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("snap.bin"))
            .unwrap();
        file.set_len(METADATA_BYTES as u64).unwrap();
        (dir, file)
    }

    #[test]
    fn metadata_is_exactly_one_page() {
        assert_eq!(std::mem::size_of::<Metadata>(), PAGE_SIZE);
        assert_eq!(std::mem::size_of::<DirtyLogEntry>(), DIRTY_ENTRY_BYTES);
    }

    #[test]
    fn seal_then_validate_round_trips() {
        let mut meta = Metadata::new(0x10000);
        meta.set_event(7);
        meta.seal();

        let parsed = Metadata::validate(meta.as_bytes()).unwrap();
        assert_eq!(parsed.event(), 7);
        assert_eq!(parsed.arena_start(), 0x10000 + METADATA_BYTES as u64);
    }

    #[test]
    fn validate_rejects_corruption() {
        let mut meta = Metadata::new(0x10000);
        meta.seal();
        let mut bytes = meta.as_bytes().to_vec();
        bytes[200] ^= 0xFF;

        assert!(Metadata::validate(&bytes).is_err());
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut meta = Metadata::new(0x10000);
        meta.magic = U64::new(0xDEAD_BEEF);
        meta.seal();

        assert!(Metadata::validate(meta.as_bytes()).is_err());
    }

    #[test]
    fn dirty_log_push_and_clear() {
        let mut meta = Metadata::new(0x10000);
        meta.push_dirty(DirtyLogEntry::new(4, 0x3000, PageStatus::First, 2))
            .unwrap();
        meta.push_dirty(DirtyLogEntry::new(9, 0, PageStatus::Free, 1))
            .unwrap();

        assert_eq!(meta.dirty_len(), 2);
        assert_eq!(meta.dirty_remaining(), DIRTY_LOG_CAPACITY - 2);
        let entries = meta.dirty_entries();
        assert_eq!(entries[0].index(), 4);
        assert_eq!(entries[0].status(), PageStatus::First);
        assert_eq!(entries[0].page_count(), 2);
        assert_eq!(entries[1].offset(), 0);

        meta.clear_dirty();
        assert_eq!(meta.dirty_len(), 0);
    }

    #[test]
    fn dirty_log_overflow_is_an_error() {
        let mut meta = Metadata::new(0x10000);
        for i in 0..DIRTY_LOG_CAPACITY {
            meta.push_dirty(DirtyLogEntry::new(i as u64, 0, PageStatus::First, 1))
                .unwrap();
        }
        assert!(meta
            .push_dirty(DirtyLogEntry::new(999, 0, PageStatus::First, 1))
            .is_err());
    }

    #[test]
    fn replicas_round_trip_through_the_file() {
        let (_dir, file) = snapshot_file();
        let mut meta = Metadata::new(0x10000);
        meta.set_epoch(3);
        meta.set_event(41);
        meta.write_replicas(&file).unwrap();

        let read = Metadata::read_newest(&file).unwrap();
        assert_eq!(read.epoch(), 3);
        assert_eq!(read.event(), 41);
    }

    #[test]
    fn newest_valid_replica_wins_over_corrupted_one() {
        use std::os::unix::fs::FileExt;
        let (_dir, file) = snapshot_file();

        let mut old = Metadata::new(0x10000);
        old.set_event(1);
        old.write_replicas(&file).unwrap();
        let mut new = Metadata::new(0x10000);
        new.set_event(2);
        new.write_replicas(&file).unwrap();

        // Tear replica 0 (the newer write landed in both; corrupt one).
        file.write_all_at(&[0xFF; 64], 100).unwrap();

        let read = Metadata::read_newest(&file).unwrap();
        assert_eq!(read.event(), 2);
    }

    #[test]
    fn all_replicas_corrupted_is_fatal() {
        use std::os::unix::fs::FileExt;
        let (_dir, file) = snapshot_file();
        let mut meta = Metadata::new(0x10000);
        meta.write_replicas(&file).unwrap();

        for slot in 0..crate::config::METADATA_PAGE_COUNT {
            file.write_all_at(&[0xAB; 16], (slot * PAGE_SIZE) as u64 + 50)
                .unwrap();
        }

        assert!(Metadata::read_newest(&file).is_err());
    }

    #[test]
    fn checksum_collaborator_is_stable() {
        // CRC-32/ISO-HDLC of "123456789" is the classic check value.
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }
}

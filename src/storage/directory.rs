//! # Page Directory
//!
//! The page directory is the arena's ground truth: a disk-backed flat
//! array with one entry per virtual page, mapping page index to
//! `{status, disk offset}`. The entry at index `(address - arena_start) /
//! PAGE_SIZE` fully determines how that page's content is interpreted and
//! where it lives in the snapshot file.
//!
//! ## Entry Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  -----------------------------------------
//! 0       1     status    PageStatus discriminant
//! 1       7     reserved  Zero padding
//! 8       8     offset    Disk offset of the page in the snapshot file
//! ```
//!
//! ## Mapping Discipline
//!
//! The directory cannot be relocated once arena addresses are live, so the
//! file is mapped exactly once with a large reserved length
//! (`PAGE_DIR_MAX_BYTES`) and the file grows underneath the mapping in
//! `PAGE_DIR_GROWTH_BYTES` steps. Touching entries beyond the current file
//! size would fault, so every write path goes through `ensure_capacity`
//! first.
//!
//! ## Mutation Discipline
//!
//! Directory entries are mutated only while a synchronization pass applies
//! the dirty-page log, in append order. Between passes the mapping is
//! protected read-only; `unprotect`/`protect` bracket the apply phase.
//! Applying an entry is idempotent, which is what allows the reload path
//! to replay a persisted log after a crash without knowing how far the
//! interrupted pass got.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    INITIAL_PAGE_DIR_BYTES, PAGE_DIR_ENTRY_BYTES, PAGE_DIR_GROWTH_BYTES, PAGE_DIR_MAX_BYTES,
    PAGE_SHIFT,
};

/// Lifecycle state of a virtual page, as recorded in the directory.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Virtual space never yet touched.
    Unallocated = 0,
    /// Reserved page with no live content; reusable after the next sync.
    Free = 1,
    /// Slab page holding sub-page allocations.
    Shared = 2,
    /// First (or only) page of a whole-page allocation.
    First = 3,
    /// Continuation page of a multi-page allocation.
    Follow = 4,
}

impl PageStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => PageStatus::Free,
            2 => PageStatus::Shared,
            3 => PageStatus::First,
            4 => PageStatus::Follow,
            _ => PageStatus::Unallocated,
        }
    }
}

/// One directory entry: the status and disk offset of a virtual page.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageDirEntry {
    status: u8,
    reserved: [u8; 7],
    offset: U64,
}

const _: () = assert!(std::mem::size_of::<PageDirEntry>() == PAGE_DIR_ENTRY_BYTES);

impl PageDirEntry {
    pub fn status(&self) -> PageStatus {
        PageStatus::from_byte(self.status)
    }

    pub fn offset(&self) -> u64 {
        self.offset.get()
    }
}

/// The memory-mapped page-directory file.
#[derive(Debug)]
pub struct PageDirectory {
    file: File,
    map: MmapMut,
    file_len: u64,
}

impl PageDirectory {
    /// Creates a fresh directory file. `set_len` zero-fills, and a zeroed
    /// entry reads as `Unallocated` with offset 0, exactly the "nothing
    /// allocated yet" marker entry 0 must carry for reload detection.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page directory '{}'", path.display()))?;
        file.set_len(INITIAL_PAGE_DIR_BYTES)
            .wrap_err("failed to size page directory file")?;
        Self::map(file, INITIAL_PAGE_DIR_BYTES)
    }

    /// Opens an existing directory file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page directory '{}'", path.display()))?;
        let file_len = file
            .metadata()
            .wrap_err("failed to stat page directory file")?
            .len();
        ensure!(
            file_len > 0 && file_len % PAGE_DIR_ENTRY_BYTES as u64 == 0,
            "page directory '{}' has size {} which is not a positive multiple of {}",
            path.display(),
            file_len,
            PAGE_DIR_ENTRY_BYTES
        );
        Self::map(file, file_len)
    }

    fn map(file: File, file_len: u64) -> Result<Self> {
        // SAFETY: the mapping is private to this struct and all access is
        // bounds-checked against file_len; the reserved length beyond the
        // file is never touched until the file has grown under it.
        let map = unsafe {
            MmapOptions::new()
                .len(PAGE_DIR_MAX_BYTES)
                .map_mut(&file)
                .wrap_err("failed to map page directory")?
        };
        Ok(Self {
            file,
            map,
            file_len,
        })
    }

    /// Number of entries the current file size can hold.
    pub fn capacity(&self) -> u64 {
        self.file_len / PAGE_DIR_ENTRY_BYTES as u64
    }

    /// Returns the entry for `index`.
    pub fn entry(&self, index: u64) -> Result<PageDirEntry> {
        ensure!(
            index < self.capacity(),
            "page directory index {} out of bounds (capacity {})",
            index,
            self.capacity()
        );
        let at = index as usize * PAGE_DIR_ENTRY_BYTES;
        let entry = PageDirEntry::read_from_bytes(&self.map[at..at + PAGE_DIR_ENTRY_BYTES])
            .map_err(|e| eyre::eyre!("failed to decode page directory entry: {e:?}"))?;
        Ok(entry)
    }

    /// Grows the backing file until it can hold at least `entries` entries.
    /// The mapping itself never moves.
    pub fn ensure_capacity(&mut self, entries: u64) -> Result<()> {
        let needed = entries * PAGE_DIR_ENTRY_BYTES as u64;
        if needed <= self.file_len {
            return Ok(());
        }
        let mut new_len = self.file_len;
        while new_len < needed {
            new_len += PAGE_DIR_GROWTH_BYTES;
        }
        if new_len > PAGE_DIR_MAX_BYTES as u64 {
            bail!(
                "page directory capacity exhausted: need {} bytes, reserved maximum is {}",
                needed,
                PAGE_DIR_MAX_BYTES
            );
        }
        self.file
            .set_len(new_len)
            .wrap_err("failed to grow page directory file")?;
        self.file_len = new_len;
        Ok(())
    }

    /// Applies one dirty-log record: writes `status` (and `offset`, unless
    /// zero, which means "leave the stored offset alone") at `index`, then
    /// expands the record across its span: `First` spans continue as
    /// `Follow`, `Free` spans stay `Free`, and each continuation page gets
    /// its own per-page disk offset. Two runs adjacent in memory are not
    /// necessarily adjacent on disk, so continuation offsets matter for
    /// free-run bookkeeping even though no one reads a `Follow` page's
    /// offset directly.
    pub fn apply(
        &mut self,
        index: u64,
        offset: u64,
        status: PageStatus,
        page_count: u32,
    ) -> Result<()> {
        ensure!(page_count > 0, "dirty record with zero page count");
        self.ensure_capacity(index + page_count as u64)?;

        let follow_status = match status {
            PageStatus::First => PageStatus::Follow,
            other => other,
        };
        for j in 0..page_count as u64 {
            let at = (index + j) as usize * PAGE_DIR_ENTRY_BYTES;
            let entry =
                PageDirEntry::mut_from_bytes(&mut self.map[at..at + PAGE_DIR_ENTRY_BYTES])
                    .map_err(|e| eyre::eyre!("failed to decode page directory entry: {e:?}"))?;
            let page_status = if j == 0 { status } else { follow_status };
            entry.status = page_status as u8;
            if offset != 0 {
                entry.offset = U64::new(offset + (j << PAGE_SHIFT));
            }
        }
        Ok(())
    }

    /// Flushes the directory's written range to disk.
    pub fn flush(&self) -> Result<()> {
        self.map
            .flush_range(0, self.file_len as usize)
            .wrap_err("failed to flush page directory")
    }

    /// Withdraws write permission from the directory mapping.
    pub fn protect(&self) -> Result<()> {
        self.set_protection(libc::PROT_READ)
    }

    /// Restores write permission for an apply phase.
    pub fn unprotect(&self) -> Result<()> {
        self.set_protection(libc::PROT_READ | libc::PROT_WRITE)
    }

    fn set_protection(&self, prot: libc::c_int) -> Result<()> {
        // SAFETY: the range is exactly the mapping this struct owns.
        let rc = unsafe {
            libc::mprotect(
                self.map.as_ptr() as *mut libc::c_void,
                PAGE_DIR_MAX_BYTES,
                prot,
            )
        };
        ensure!(
            rc == 0,
            "mprotect of page directory failed: {}",
            std::io::Error::last_os_error()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_directory_reads_unallocated() {
        let dir = tempdir().unwrap();
        let pd = PageDirectory::create(dir.path().join("page.bin")).unwrap();

        let entry = pd.entry(0).unwrap();
        assert_eq!(entry.status(), PageStatus::Unallocated);
        assert_eq!(entry.offset(), 0);
        assert_eq!(pd.capacity(), INITIAL_PAGE_DIR_BYTES / 16);
    }

    #[test]
    fn create_rejects_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page.bin");
        PageDirectory::create(&path).unwrap();

        assert!(PageDirectory::create(&path).is_err());
    }

    #[test]
    fn apply_single_page_record() {
        let dir = tempdir().unwrap();
        let mut pd = PageDirectory::create(dir.path().join("page.bin")).unwrap();

        pd.apply(3, 0x4000, PageStatus::Shared, 1).unwrap();

        let entry = pd.entry(3).unwrap();
        assert_eq!(entry.status(), PageStatus::Shared);
        assert_eq!(entry.offset(), 0x4000);
    }

    #[test]
    fn apply_expands_first_into_follow_span() {
        let dir = tempdir().unwrap();
        let mut pd = PageDirectory::create(dir.path().join("page.bin")).unwrap();

        pd.apply(10, 0x10000, PageStatus::First, 3).unwrap();

        assert_eq!(pd.entry(10).unwrap().status(), PageStatus::First);
        assert_eq!(pd.entry(10).unwrap().offset(), 0x10000);
        assert_eq!(pd.entry(11).unwrap().status(), PageStatus::Follow);
        assert_eq!(pd.entry(11).unwrap().offset(), 0x11000);
        assert_eq!(pd.entry(12).unwrap().status(), PageStatus::Follow);
        assert_eq!(pd.entry(12).unwrap().offset(), 0x12000);
        assert_eq!(pd.entry(13).unwrap().status(), PageStatus::Unallocated);
    }

    #[test]
    fn apply_with_zero_offset_keeps_stored_offsets() {
        let dir = tempdir().unwrap();
        let mut pd = PageDirectory::create(dir.path().join("page.bin")).unwrap();
        pd.apply(5, 0x8000, PageStatus::First, 2).unwrap();

        pd.apply(5, 0, PageStatus::Free, 2).unwrap();

        assert_eq!(pd.entry(5).unwrap().status(), PageStatus::Free);
        assert_eq!(pd.entry(5).unwrap().offset(), 0x8000);
        assert_eq!(pd.entry(6).unwrap().status(), PageStatus::Free);
        assert_eq!(pd.entry(6).unwrap().offset(), 0x9000);
    }

    #[test]
    fn apply_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut pd = PageDirectory::create(dir.path().join("page.bin")).unwrap();

        pd.apply(2, 0x3000, PageStatus::First, 2).unwrap();
        pd.apply(2, 0x3000, PageStatus::First, 2).unwrap();

        assert_eq!(pd.entry(2).unwrap().status(), PageStatus::First);
        assert_eq!(pd.entry(2).unwrap().offset(), 0x3000);
        assert_eq!(pd.entry(3).unwrap().status(), PageStatus::Follow);
    }

    #[test]
    fn ensure_capacity_grows_the_file_in_place() {
        let dir = tempdir().unwrap();
        let mut pd = PageDirectory::create(dir.path().join("page.bin")).unwrap();
        let initial = pd.capacity();

        pd.ensure_capacity(initial + 1).unwrap();

        assert!(pd.capacity() > initial);
        pd.apply(initial, 0x5000, PageStatus::Shared, 1).unwrap();
        assert_eq!(pd.entry(initial).unwrap().status(), PageStatus::Shared);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page.bin");
        {
            let mut pd = PageDirectory::create(&path).unwrap();
            pd.apply(1, 0x2000, PageStatus::Shared, 1).unwrap();
            pd.flush().unwrap();
        }

        let pd = PageDirectory::open(&path).unwrap();
        assert_eq!(pd.entry(1).unwrap().status(), PageStatus::Shared);
        assert_eq!(pd.entry(1).unwrap().offset(), 0x2000);
    }

    #[test]
    fn status_from_byte_is_lenient() {
        assert_eq!(PageStatus::from_byte(0), PageStatus::Unallocated);
        assert_eq!(PageStatus::from_byte(3), PageStatus::First);
        assert_eq!(PageStatus::from_byte(0xFF), PageStatus::Unallocated);
    }
}

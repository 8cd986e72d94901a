//! # Fixed-Address Arena Mapping
//!
//! This module implements `ArenaMapping`, the single abstraction through
//! which the arena's virtual address range is created, grown, relocated
//! page-by-page, and protection-toggled. No other module performs pointer
//! arithmetic on arena addresses.
//!
//! ## Address Stability
//!
//! Every allocation must come back at the same virtual address after a
//! process restart, so nothing here ever accepts "wherever the kernel
//! likes". All arena mappings use `MAP_SHARED | MAP_FIXED_NOREPLACE` (or
//! `MAP_FIXED` when deliberately replacing a page during copy-on-write) at
//! a caller-chosen address derived from the arena base. A mapping that
//! lands anywhere else means the reserved range has been invaded by some
//! other mapping; that breaks the arena's core guarantee and is treated as
//! fatal.
//!
//! ## Layout
//!
//! ```text
//! base ──────────────► metadata replica pages (not mapped; file I/O only)
//! arena_start ───────► page 0
//!                      page 1
//!                      ...
//! arena_end ─────────► first unmapped address (grows monotonically)
//! ```
//!
//! The range `[arena_start, arena_end)` is always fully mapped, one
//! `PAGE_SIZE` page at a time, each page backed by some block of the
//! snapshot file. Copy-on-write remaps an individual page onto a different
//! block without moving its virtual address.
//!
//! ## Protection Discipline
//!
//! Pages that have been synchronized to disk are mapped `PROT_READ`; the
//! first allocator mutation after a sync relocates the page and restores
//! write permission. The mapping mirrors the kernel's per-page protection
//! state in a `HashSet` so the copy-on-write engine can ask "is this page
//! already writable this epoch?" without parsing `/proc/self/maps`.
//!
//! ## Safety Model
//!
//! `page()` borrows `&self` and `page_mut()`/`remap_page()` borrow
//! `&mut self`, so the borrow checker guarantees no page slice outlives a
//! remap, with zero runtime cost. `page_mut()` additionally requires the
//! page to be writable, since writing through it to a `PROT_READ` page
//! would fault.
//!
//! ## Platform Support
//!
//! Linux only: `MAP_FIXED_NOREPLACE` is what makes "map here or fail"
//! expressible without a race.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::slice;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashSet;
use tracing::error;

use crate::config::{PAGE_SHIFT, PAGE_SIZE};

/// The arena's owned virtual range and per-page protection state.
#[derive(Debug)]
pub struct ArenaMapping {
    start: u64,
    end: u64,
    writable: HashSet<u64>,
}

impl ArenaMapping {
    /// Creates an empty mapping anchored at `start` (the first content
    /// page's address, immediately above the metadata replicas).
    pub fn new(start: u64) -> Self {
        Self {
            start,
            end: start,
            writable: HashSet::new(),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// First address beyond the mapped range.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn page_count(&self) -> u64 {
        (self.end - self.start) >> PAGE_SHIFT
    }

    /// Virtual address of the page at `index`.
    pub fn address_of(&self, index: u64) -> u64 {
        debug_assert!(index <= self.page_count());
        self.start + (index << PAGE_SHIFT)
    }

    /// Page index containing `address`, or `None` if the address falls
    /// outside `[arena_start, arena_end)`.
    pub fn index_of(&self, address: u64) -> Option<u64> {
        if address < self.start || address >= self.end {
            return None;
        }
        Some((address - self.start) >> PAGE_SHIFT)
    }

    /// Whether the page at `index` is currently mapped read-write.
    pub fn is_writable(&self, index: u64) -> bool {
        self.writable.contains(&index)
    }

    /// Maps `count` fresh pages read-write at `arena_end`, backed by the
    /// snapshot file starting at `offset`. Returns the base address of the
    /// new pages.
    pub fn map_fresh(&mut self, file: &File, offset: u64, count: usize) -> Result<u64> {
        let address = self.end;
        self.mmap_fixed(
            address,
            count * PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
            file,
            offset,
        )
        .wrap_err_with(|| format!("failed to map {count} fresh page(s) at {address:#x}"))?;

        let first = (address - self.start) >> PAGE_SHIFT;
        self.end += (count * PAGE_SIZE) as u64;
        for i in 0..count as u64 {
            self.writable.insert(first + i);
        }
        Ok(address)
    }

    /// Maps one already-synchronized page read-only at `arena_end`, backed
    /// by the snapshot file at `offset`. Used by the reload path.
    pub fn map_existing(&mut self, file: &File, offset: u64) -> Result<u64> {
        let address = self.end;
        self.mmap_fixed(
            address,
            PAGE_SIZE,
            libc::PROT_READ,
            libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
            file,
            offset,
        )
        .wrap_err_with(|| format!("failed to remap existing page at {address:#x}"))?;
        self.end += PAGE_SIZE as u64;
        Ok(address)
    }

    /// Replaces the mapping of the page at `index` with a read-write
    /// mapping of the snapshot block at `offset`, keeping the virtual
    /// address. This is the relocation half of copy-on-write; the caller
    /// has already written the page's content to `offset`.
    pub fn remap_page(&mut self, index: u64, file: &File, offset: u64) -> Result<()> {
        ensure!(index < self.page_count(), "page {index} out of bounds");
        let address = self.address_of(index);
        self.mmap_fixed(
            address,
            PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file,
            offset,
        )
        .wrap_err_with(|| format!("failed to relocate page {index} onto block {offset:#x}"))?;
        self.writable.insert(index);
        Ok(())
    }

    /// Restores write permission on `count` pages starting at `index`
    /// without relocating them. Only correct for pages whose durable
    /// content is disposable (pages the directory records as free).
    pub fn make_writable(&mut self, index: u64, count: u64) -> Result<()> {
        self.mprotect(index, count, libc::PROT_READ | libc::PROT_WRITE)?;
        for i in 0..count {
            self.writable.insert(index + i);
        }
        Ok(())
    }

    /// Withdraws write permission from `count` pages starting at `index`.
    pub fn protect_read(&mut self, index: u64, count: u64) -> Result<()> {
        self.mprotect(index, count, libc::PROT_READ)?;
        for i in 0..count {
            self.writable.remove(&(index + i));
        }
        Ok(())
    }

    /// Withdraws write permission from every page still marked writable.
    /// The sync pass runs this after protecting the logged ranges so no
    /// page can slip through an epoch boundary writable.
    pub fn protect_remaining(&mut self) -> Result<()> {
        let leftover: Vec<u64> = self.writable.iter().copied().collect();
        for index in leftover {
            self.mprotect(index, 1, libc::PROT_READ)?;
            self.writable.remove(&index);
        }
        Ok(())
    }

    /// Flushes `count` pages starting at `index` to the backing file with
    /// a synchronous `msync`.
    pub fn sync_pages(&self, index: u64, count: u64) -> Result<()> {
        ensure!(
            index + count <= self.page_count(),
            "page range {index}+{count} out of bounds"
        );
        let address = self.address_of(index);
        // SAFETY: the range is inside [start, end), which this mapping
        // owns and keeps fully mapped; msync does not move or unmap it.
        let rc = unsafe {
            libc::msync(
                address as *mut libc::c_void,
                (count as usize) * PAGE_SIZE,
                libc::MS_SYNC,
            )
        };
        ensure!(
            rc == 0,
            "msync of page range {index}+{count} failed: {}",
            std::io::Error::last_os_error()
        );
        Ok(())
    }

    /// Read-only view of the page at `index`.
    pub fn page(&self, index: u64) -> &[u8] {
        assert!(index < self.page_count(), "page {index} out of bounds");
        // SAFETY: the page is inside the owned, fully-mapped range and at
        // least PROT_READ; the borrow of &self prevents any remap or unmap
        // while the slice is alive.
        unsafe { slice::from_raw_parts(self.address_of(index) as *const u8, PAGE_SIZE) }
    }

    /// Mutable view of the page at `index`. The page must currently be
    /// writable; writing through a read-only mapping would fault.
    pub fn page_mut(&mut self, index: u64) -> &mut [u8] {
        assert!(index < self.page_count(), "page {index} out of bounds");
        debug_assert!(
            self.writable.contains(&index),
            "page {index} mutated while read-only"
        );
        // SAFETY: as in `page`, plus the &mut self borrow makes this the
        // only live view and the writable check guarantees PROT_WRITE.
        unsafe { slice::from_raw_parts_mut(self.address_of(index) as *mut u8, PAGE_SIZE) }
    }

    fn mmap_fixed(
        &self,
        address: u64,
        len: usize,
        prot: libc::c_int,
        flags: libc::c_int,
        file: &File,
        offset: u64,
    ) -> Result<()> {
        // SAFETY: the requested range lies inside the arena's reserved
        // span, which nothing else in the process may occupy; with
        // MAP_FIXED the only mapping being replaced is our own page.
        let got = unsafe {
            libc::mmap(
                address as *mut libc::c_void,
                len,
                prot,
                flags,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        ensure!(
            got != libc::MAP_FAILED,
            "mmap({address:#x}, {len}) failed: {}",
            std::io::Error::last_os_error()
        );
        if got as u64 != address {
            // SAFETY: unmapping the mapping we just created.
            unsafe {
                libc::munmap(got, len);
            }
            error!(
                wanted = format_args!("{address:#x}"),
                got = format_args!("{:#x}", got as u64),
                "arena mapping landed at the wrong address"
            );
            panic!("arena mapping landed at {:#x}, wanted {address:#x}", got as u64);
        }
        Ok(())
    }

    fn mprotect(&self, index: u64, count: u64, prot: libc::c_int) -> Result<()> {
        ensure!(
            index + count <= self.page_count(),
            "page range {index}+{count} out of bounds"
        );
        let address = self.address_of(index);
        // SAFETY: the range is inside the owned, fully-mapped span.
        let rc = unsafe {
            libc::mprotect(
                address as *mut libc::c_void,
                (count as usize) * PAGE_SIZE,
                prot,
            )
        };
        ensure!(
            rc == 0,
            "mprotect of page range {index}+{count} failed: {}",
            std::io::Error::last_os_error()
        );
        Ok(())
    }
}

impl Drop for ArenaMapping {
    fn drop(&mut self) {
        if self.end > self.start {
            // SAFETY: unmapping exactly the span this mapping owns; no
            // slices into it can outlive self.
            unsafe {
                libc::munmap(
                    self.start as *mut libc::c_void,
                    (self.end - self.start) as usize,
                );
            }
        }
    }
}

// SAFETY: the mapping is exclusively owned; the raw addresses it stores are
// not shared with any other thread except through &self/&mut self.
unsafe impl Send for ArenaMapping {}

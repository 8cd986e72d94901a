//! # Arena Context
//!
//! `Arena` is the allocator: it owns the snapshot file, the page
//! directory, the fixed-address mapping, and the free caches, and it
//! orchestrates every public operation (allocate, deallocate, sync,
//! prepare_write) across them.
//!
//! ## Allocation Paths
//!
//! ```text
//! allocate(size)
//!   ├─ size == 0 or size + PAGE_SIZE overflows ──────────► None
//!   ├─ size <= PAGE_SIZE/4 ──► slab path
//!   │     bucket stack ─► page with free slot? ─► copy-on-write ─► slot
//!   │                └─ none ─► acquire page ─► init slab header ─► slot
//!   └─ larger ──────────────► multi-page path
//!         free-run cache (exact, then smallest adequate)
//!                └─ miss ─► fresh disk blocks + fresh mapping at arena_end
//! ```
//!
//! Both paths bottom out in the same supplies: the single-free-page stack,
//! the dpage cache of reusable disk blocks, and finally raw file growth.
//!
//! ## Epochs
//!
//! Between two `sync` calls the arena is in one epoch. Within an epoch,
//! the first mutation of any synced page relocates it to a fresh disk
//! block (copy-on-write) and re-enables writes; further mutations of the
//! same page are ordinary stores. Every page-level change is appended to
//! the dirty log, and `sync` makes the epoch durable: content first, then
//! the metadata replicas (the commit point), then the page directory.
//!
//! ## Single Mutator
//!
//! Every mutating operation takes `&mut self`, which statically enforces
//! the one-writer model. Embeddings that share an arena across threads
//! wrap it in [`SharedArena`], the required global lock made concrete.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::ptr::NonNull;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::config::{
    ArenaOptions, DIRTY_LOG_CAPACITY, DIRTY_LOG_SLACK, INITIAL_SNAPSHOT_BYTES, MAX_SHARED_SHIFT,
    METADATA_BYTES, MIN_ALLOC_SHIFT, NO_PAGE, PAGE_DIR_FILENAME, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE,
    SNAPSHOT_FILENAME, SNAPSHOT_GROWTH_BYTES,
};
use crate::storage::{
    bucket_for_size, bucket_slot, slot_for_offset, slot_offset, ArenaMapping, DirtyLogEntry,
    DpageCachePage, FreePageCache, Metadata, PageDirectory, PageStatus, SlabPageHeader,
};

/// A point-in-time view of arena bookkeeping, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Mapped arena pages (the arena's current extent).
    pub arena_pages: u64,
    /// Pending dirty-log entries.
    pub dirty_log_len: usize,
    /// Reusable disk blocks queued in the dpage cache.
    pub dpage_cache_len: usize,
    /// Free pages on the single-page stack.
    pub free_single_pages: usize,
    /// Total pages held in free runs.
    pub free_run_pages: u64,
    /// Snapshot file size in bytes.
    pub snapshot_size: u64,
    /// Next never-handed-out disk offset.
    pub next_free_offset: u64,
    /// Epoch id of the most recent sync.
    pub epoch: u64,
    /// Event id of the most recent sync.
    pub event: u64,
}

/// A persistent memory arena.
pub struct Arena {
    options: ArenaOptions,
    snapshot: File,
    meta: Box<Metadata>,
    mapping: ArenaMapping,
    directory: PageDirectory,
    free_pages: FreePageCache,
}

impl Arena {
    /// Creates a fresh arena at `path` with default options.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with(path, ArenaOptions::default())
    }

    /// Creates a fresh arena directory: sizes the backing files, maps the
    /// dpage-cache page as the arena's first page, and runs an initial
    /// sync so the empty state is durable before the first allocation.
    pub fn create_with<P: AsRef<Path>>(path: P, options: ArenaOptions) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .wrap_err_with(|| format!("failed to create arena directory '{}'", path.display()))?;

        let snapshot_path = path.join(SNAPSHOT_FILENAME);
        let snapshot = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&snapshot_path)
            .wrap_err_with(|| {
                format!("failed to create snapshot file '{}'", snapshot_path.display())
            })?;
        snapshot
            .set_len(INITIAL_SNAPSHOT_BYTES)
            .wrap_err("failed to size snapshot file")?;

        let directory = PageDirectory::create(path.join(PAGE_DIR_FILENAME))?;
        let meta = Box::new(Metadata::new(options.base_addr));
        let mapping = ArenaMapping::new(meta.arena_start());

        let mut arena = Self {
            options,
            snapshot,
            meta,
            mapping,
            directory,
            free_pages: FreePageCache::new(),
        };

        // The dpage cache lives in the arena's first page.
        let offset = arena.fresh_disk_block()?;
        arena.mapping.map_fresh(&arena.snapshot, offset, 1)?;
        arena.meta.set_arena_end(arena.mapping.end());
        DpageCachePage::from_bytes_mut(arena.mapping.page_mut(0))?.reset();
        arena.meta.set_dpage_cache_index(0);
        arena.mark_dirty(0, offset, PageStatus::First, 1)?;

        arena.sync_at(0, 0)?;
        Ok(arena)
    }

    /// Reopens an existing arena with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ArenaOptions::default())
    }

    /// Reopens an existing arena: selects the newest valid metadata
    /// replica, replays its dirty log onto the page directory (idempotent,
    /// so it does not matter how far an interrupted sync got), remaps
    /// every page read-only at its recorded address, and rebuilds the free
    /// caches from the directory.
    pub fn open_with<P: AsRef<Path>>(path: P, options: ArenaOptions) -> Result<Self> {
        let path = path.as_ref();
        let snapshot_path = path.join(SNAPSHOT_FILENAME);
        let snapshot = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&snapshot_path)
            .wrap_err_with(|| {
                format!("failed to open snapshot file '{}'", snapshot_path.display())
            })?;

        let mut meta = Box::new(Metadata::read_newest(&snapshot)?);
        ensure!(
            meta.arena_start() == options.base_addr + METADATA_BYTES as u64,
            "snapshot was created at base {:#x}, options request {:#x}",
            meta.arena_start() - METADATA_BYTES as u64,
            options.base_addr
        );

        let mut directory = PageDirectory::open(path.join(PAGE_DIR_FILENAME))?;
        for entry in meta.dirty_entries() {
            directory.apply(entry.index(), entry.offset(), entry.status(), entry.page_count())?;
        }
        directory.flush()?;
        meta.clear_dirty();

        let mut mapping = ArenaMapping::new(meta.arena_start());
        let page_count = (meta.arena_end() - meta.arena_start()) >> PAGE_SHIFT;
        directory.ensure_capacity(page_count)?;
        for index in 0..page_count {
            let entry = directory.entry(index)?;
            ensure!(
                entry.status() != PageStatus::Unallocated,
                "page {index} inside the arena bounds is marked unallocated"
            );
            mapping.map_existing(&snapshot, entry.offset())?;
        }
        directory.protect()?;

        let mut free_pages = FreePageCache::new();
        let mut index = 0;
        while index < page_count {
            if directory.entry(index)?.status() == PageStatus::Free {
                let mut len = 1;
                while index + len < page_count
                    && directory.entry(index + len)?.status() == PageStatus::Free
                {
                    len += 1;
                }
                free_pages.push_run(index, len);
                index += len;
            } else {
                index += 1;
            }
        }

        Ok(Self {
            options,
            snapshot,
            meta,
            mapping,
            directory,
            free_pages,
        })
    }

    /// Opens the arena at `path` if one exists there, otherwise creates a
    /// fresh one.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with(path, ArenaOptions::default())
    }

    pub fn load_with<P: AsRef<Path>>(path: P, options: ArenaOptions) -> Result<Self> {
        if path.as_ref().join(SNAPSHOT_FILENAME).exists() {
            Self::open_with(path, options)
        } else {
            Self::create_with(path, options)
        }
    }

    /// Allocates `size` bytes and returns the address, stable across
    /// restarts once synced. Returns `None` for a zero size (no side
    /// effect), on arithmetic overflow, and when backing storage cannot be
    /// grown.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if size.checked_add(PAGE_SIZE).is_none() {
            warn!(size, "allocation size overflow");
            return None;
        }
        if let Err(err) = self.flush_headroom() {
            error!(error = %err, "dirty-log flush failed; allocation denied");
            return None;
        }
        let result = match bucket_for_size(size) {
            Some(bucket) => self.allocate_small(bucket),
            None => self.allocate_large(size),
        };
        match result {
            Ok(address) => NonNull::new(address as *mut u8),
            Err(err) => {
                warn!(size, error = %err, "allocation failed");
                None
            }
        }
    }

    /// Returns an allocation to the arena. A null address is a silent
    /// no-op; an address outside the arena or already free is a warning
    /// no-op; an address into the middle of a multi-page block or into
    /// untracked space is fatal.
    pub fn deallocate(&mut self, address: *mut u8) {
        if address.is_null() {
            return;
        }
        let addr = address as u64;
        let Some(index) = self.mapping.index_of(addr) else {
            self.recoverable(addr, "address outside the arena");
            return;
        };
        if let Err(err) = self.flush_headroom() {
            error!(error = %err, "dirty-log flush failed; deallocation dropped");
            return;
        }
        let entry = match self.directory.entry(index) {
            Ok(entry) => entry,
            Err(err) => {
                error!(error = %err, "page directory lookup failed");
                return;
            }
        };
        match entry.status() {
            PageStatus::Unallocated => self.fatal(addr, "address marked unallocated"),
            PageStatus::Free => self.recoverable(addr, "address already free"),
            PageStatus::Shared => self.free_small(addr, index),
            PageStatus::First => self.free_large(addr, index),
            PageStatus::Follow => {
                self.fatal(addr, "address points into the middle of a multi-page allocation")
            }
        }
    }

    /// Makes the epoch durable: flushes and write-protects every dirtied
    /// page, commits the metadata replicas (carrying the dirty log), then
    /// applies the log to the page directory in append order. Freed runs
    /// become reusable only here.
    pub fn sync(&mut self, epoch: u64, event: u64) -> Result<()> {
        self.sync_at(epoch, event)
    }

    /// Copy-on-writes every page covering `[address, address + len)` so
    /// the caller may mutate allocation content in place. Allocations
    /// touched for the first time since the last sync are read-only; the
    /// allocator's own bookkeeping calls this machinery implicitly, but
    /// content writes need this explicit hook.
    ///
    /// A single range is limited by the dirty-log capacity (a bit over
    /// 150 pages); split larger content updates across syncs.
    pub fn prepare_write(&mut self, address: NonNull<u8>, len: usize) -> Result<()> {
        ensure!(len > 0, "cannot prepare an empty range");
        let start = address.as_ptr() as u64;
        let end = start
            .checked_add(len as u64 - 1)
            .ok_or_else(|| eyre::eyre!("range length overflows the address space"))?;
        let first = self
            .mapping
            .index_of(start)
            .ok_or_else(|| eyre::eyre!("address {start:#x} is outside the arena"))?;
        let last = self
            .mapping
            .index_of(end)
            .ok_or_else(|| eyre::eyre!("range end {end:#x} is outside the arena"))?;
        let span = (last - first + 1) as usize;
        // One log entry per relocated page, plus one for the dpage cache.
        ensure!(
            span + 1 <= DIRTY_LOG_CAPACITY - DIRTY_LOG_SLACK,
            "range of {span} pages cannot be prepared in one epoch"
        );
        if self.meta.dirty_remaining() < span + 1 + DIRTY_LOG_SLACK {
            let (epoch, event) = (self.meta.epoch(), self.meta.event());
            self.sync_at(epoch, event)?;
        }
        for index in first..=last {
            let status = self.directory.entry(index)?.status();
            ensure!(
                matches!(status, PageStatus::Shared | PageStatus::First | PageStatus::Follow),
                "page {index} in the range is not allocated"
            );
            self.ensure_page_writable(index)?;
        }
        Ok(())
    }

    /// Directory status of the page containing `address`, if it lies
    /// inside the arena.
    pub fn page_status(&self, address: *const u8) -> Option<PageStatus> {
        let index = self.mapping.index_of(address as u64)?;
        self.directory.entry(index).ok().map(|entry| entry.status())
    }

    /// Current bookkeeping snapshot.
    pub fn stats(&self) -> ArenaStats {
        let cache_index = self.meta.dpage_cache_index();
        let dpage_cache_len = if cache_index == NO_PAGE {
            0
        } else {
            DpageCachePage::from_bytes(self.mapping.page(cache_index))
                .map(|cache| cache.queued())
                .unwrap_or(0)
        };
        ArenaStats {
            arena_pages: self.mapping.page_count(),
            dirty_log_len: self.meta.dirty_len(),
            dpage_cache_len,
            free_single_pages: self.free_pages.single_count(),
            free_run_pages: self.free_pages.run_page_count(),
            snapshot_size: self.meta.snapshot_size(),
            next_free_offset: self.meta.next_offset(),
            epoch: self.meta.epoch(),
            event: self.meta.event(),
        }
    }

    // ------------------------------------------------------------------
    // Slab path
    // ------------------------------------------------------------------

    fn allocate_small(&mut self, bucket: u32) -> Result<u64> {
        let slot_index = bucket_slot(bucket);

        // Most-recently-created page first; first page with room wins.
        let mut index = self.meta.shared_head(slot_index);
        while index != NO_PAGE {
            let header = SlabPageHeader::from_bytes(self.mapping.page(index))?;
            if header.free_count() > 0 {
                break;
            }
            index = header.next();
        }

        let index = if index == NO_PAGE {
            self.new_slab_page(bucket)?
        } else {
            self.ensure_page_writable(index)?;
            index
        };

        let slot = {
            let header = SlabPageHeader::from_bytes_mut(self.mapping.page_mut(index))?;
            header.take_first_free()
        };
        match slot {
            Some(slot) => Ok(self.mapping.address_of(index) + slot_offset(bucket, slot) as u64),
            None => self.fatal(
                self.mapping.address_of(index),
                "slab page free count disagrees with its bitmap",
            ),
        }
    }

    fn new_slab_page(&mut self, bucket: u32) -> Result<u64> {
        let index = self.acquire_page(PageStatus::Shared)?;
        let head = self.meta.shared_head(bucket_slot(bucket));
        SlabPageHeader::from_bytes_mut(self.mapping.page_mut(index))?.init(bucket, head);
        self.meta.set_shared_head(bucket_slot(bucket), index);
        Ok(index)
    }

    fn free_small(&mut self, addr: u64, index: u64) {
        let offset_in_page = (addr & PAGE_MASK) as usize;
        let bucket = match SlabPageHeader::from_bytes(self.mapping.page(index)) {
            Ok(header) => header.size_class(),
            Err(err) => {
                error!(error = %err, "slab header read failed");
                return;
            }
        };
        if !(MIN_ALLOC_SHIFT..=MAX_SHARED_SHIFT).contains(&bucket) {
            self.fatal(addr, "slab page carries an impossible size class");
        }
        let Some(slot) = slot_for_offset(bucket, offset_in_page) else {
            self.recoverable(addr, "address does not point at a slab slot");
            return;
        };
        // Freeing flips a bit in the page, so the page must be writable.
        if let Err(err) = self.ensure_page_writable(index) {
            warn!(error = %err, "copy-on-write failed; free dropped");
            return;
        }
        let released = match SlabPageHeader::from_bytes_mut(self.mapping.page_mut(index)) {
            Ok(header) => header.release_slot(slot),
            Err(err) => {
                error!(error = %err, "slab header read failed");
                return;
            }
        };
        if !released {
            self.recoverable(addr, "slab slot already free");
        }
    }

    // ------------------------------------------------------------------
    // Multi-page path
    // ------------------------------------------------------------------

    fn allocate_large(&mut self, size: usize) -> Result<u64> {
        let pages = size.div_ceil(PAGE_SIZE);
        let n = pages as u64;

        if n == 1 {
            let index = self.acquire_page(PageStatus::First)?;
            return Ok(self.mapping.address_of(index));
        }

        if let Some(index) = self.free_pages.take_run(n) {
            self.mapping.make_writable(index, n)?;
            self.mark_dirty(index, 0, PageStatus::First, n as u32)?;
            return Ok(self.mapping.address_of(index));
        }

        let offset = self.fresh_disk_run(n)?;
        let index = self.mapping.page_count();
        self.directory.ensure_capacity(index + n)?;
        let address = self.mapping.map_fresh(&self.snapshot, offset, pages)?;
        self.meta.set_arena_end(self.mapping.end());
        self.mark_dirty(index, offset, PageStatus::First, n as u32)?;
        Ok(address)
    }

    fn free_large(&mut self, addr: u64, index: u64) {
        if addr & PAGE_MASK != 0 {
            self.fatal(addr, "address does not point at the start of a page");
        }
        // The directory still says First until the next sync applies the
        // log, so a repeat free this epoch shows up only as a pending entry.
        let pending = self
            .meta
            .dirty_entries()
            .iter()
            .any(|entry| entry.status() == PageStatus::Free && entry.index() == index);
        if pending {
            self.recoverable(addr, "address already freed this epoch");
            return;
        }
        let page_count = self.mapping.page_count();
        let mut n = 1u64;
        while index + n < page_count {
            match self.directory.entry(index + n) {
                Ok(entry) if entry.status() == PageStatus::Follow => n += 1,
                _ => break,
            }
        }
        // Freed pages stay out of the in-memory caches until the next
        // sync; reusing them earlier could clobber content a crash would
        // re-expose.
        if let Err(err) = self.mark_dirty(index, 0, PageStatus::Free, n as u32) {
            error!(error = %err, "failed to record free; dropped");
        }
    }

    // ------------------------------------------------------------------
    // Single-page acquisition
    // ------------------------------------------------------------------

    fn acquire_page(&mut self, status: PageStatus) -> Result<u64> {
        if let Some(index) = self.free_pages.take_single() {
            self.mapping.make_writable(index, 1)?;
            self.mark_dirty(index, 0, status, 1)?;
            return Ok(index);
        }
        let offset = self.acquire_disk_block()?;
        let index = self.mapping.page_count();
        self.directory.ensure_capacity(index + 1)?;
        self.mapping.map_fresh(&self.snapshot, offset, 1)?;
        self.meta.set_arena_end(self.mapping.end());
        self.mark_dirty(index, offset, status, 1)?;
        Ok(index)
    }

    // ------------------------------------------------------------------
    // Copy-on-write engine
    // ------------------------------------------------------------------

    /// Relocation happens at most once per page per epoch: a page that is
    /// already writable was either created or relocated since the last
    /// sync and needs nothing.
    fn ensure_page_writable(&mut self, index: u64) -> Result<()> {
        if self.mapping.is_writable(index) {
            return Ok(());
        }
        let status = self.directory.entry(index)?.status();
        let target = self.acquire_disk_block()?;
        // The relocation below pushes the old block into the dpage cache,
        // so the cache page must be writable before the push lands.
        self.ensure_dpage_cache_writable()?;
        self.relocate_page(index, target, status)
    }

    fn relocate_page(&mut self, index: u64, target: u64, status: PageStatus) -> Result<()> {
        let old_offset = self.directory.entry(index)?.offset();
        self.snapshot
            .write_all_at(self.mapping.page(index), target)
            .wrap_err("failed to write relocated page content")?;
        self.mapping.remap_page(index, &self.snapshot, target)?;
        self.recycle_block(old_offset);
        self.mark_dirty(index, target, status, 1)
    }

    fn ensure_dpage_cache_writable(&mut self) -> Result<()> {
        let cache_index = self.meta.dpage_cache_index();
        let dirty = DpageCachePage::from_bytes(self.mapping.page(cache_index))?.is_dirty();
        if dirty {
            return Ok(());
        }
        self.relocate_dpage_cache()
    }

    /// Copy-on-write for the dpage cache itself. The relocation target is
    /// taken from the cache's own queue when possible, because going
    /// through the generic supply could recurse straight back here. The
    /// in-page dirty flag is raised before any push lands in the queue.
    fn relocate_dpage_cache(&mut self) -> Result<()> {
        let cache_index = self.meta.dpage_cache_index();
        let queued = DpageCachePage::from_bytes(self.mapping.page(cache_index))?.peek_front();
        let (target, from_own_queue) = match queued {
            Some(offset) => (offset, true),
            None => (self.fresh_disk_block()?, false),
        };

        let old_offset = self.directory.entry(cache_index)?.offset();
        self.snapshot
            .write_all_at(self.mapping.page(cache_index), target)
            .wrap_err("failed to write relocated dpage cache")?;
        self.mapping.remap_page(cache_index, &self.snapshot, target)?;
        {
            let cache = DpageCachePage::from_bytes_mut(self.mapping.page_mut(cache_index))?;
            cache.set_dirty(true);
            if from_own_queue {
                cache.pop_front();
            }
            if !cache.push_back(old_offset) {
                debug!(offset = old_offset, "dpage cache full; dropping recycled block");
            }
        }
        self.mark_dirty(cache_index, target, PageStatus::First, 1)
    }

    fn recycle_block(&mut self, offset: u64) {
        let cache_index = self.meta.dpage_cache_index();
        match DpageCachePage::from_bytes_mut(self.mapping.page_mut(cache_index)) {
            Ok(cache) => {
                if !cache.push_back(offset) {
                    debug!(offset, "dpage cache full; dropping recycled block");
                }
            }
            Err(err) => error!(error = %err, "dpage cache page unreadable"),
        }
    }

    // ------------------------------------------------------------------
    // Disk block supply
    // ------------------------------------------------------------------

    fn acquire_disk_block(&mut self) -> Result<u64> {
        if let Some(offset) = self.pop_cached_dpage()? {
            return Ok(offset);
        }
        self.fresh_disk_block()
    }

    fn pop_cached_dpage(&mut self) -> Result<Option<u64>> {
        let cache_index = self.meta.dpage_cache_index();
        if cache_index == NO_PAGE {
            // Bootstrap: the cache page itself is being created.
            return Ok(None);
        }
        let (available, dirty) = {
            let cache = DpageCachePage::from_bytes(self.mapping.page(cache_index))?;
            (cache.available(), cache.is_dirty())
        };
        // A clean cache holding a single safe block is not worth touching:
        // the copy-on-write it would trigger consumes that block itself.
        if available == 0 || (available == 1 && !dirty) {
            return Ok(None);
        }
        if !dirty {
            self.relocate_dpage_cache()?;
        }
        let cache = DpageCachePage::from_bytes_mut(self.mapping.page_mut(cache_index))?;
        Ok(cache.pop_front())
    }

    fn fresh_disk_block(&mut self) -> Result<u64> {
        let offset = self.meta.next_offset();
        if offset + PAGE_SIZE as u64 > self.meta.snapshot_size() {
            self.extend_snapshot(1)?;
        }
        self.meta.set_next_offset(offset + PAGE_SIZE as u64);
        Ok(offset)
    }

    fn fresh_disk_run(&mut self, n: u64) -> Result<u64> {
        let offset = self.meta.next_offset();
        let end = offset + (n << PAGE_SHIFT);
        if end > self.meta.snapshot_size() {
            let deficit = end - self.meta.snapshot_size();
            self.extend_snapshot(deficit.div_ceil(SNAPSHOT_GROWTH_BYTES))?;
        }
        self.meta.set_next_offset(end);
        Ok(offset)
    }

    fn extend_snapshot(&mut self, increments: u64) -> Result<()> {
        let new_size = self.meta.snapshot_size() + increments * SNAPSHOT_GROWTH_BYTES;
        self.snapshot
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend snapshot file to {new_size} bytes"))?;
        self.meta.set_snapshot_size(new_size);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dirty log and synchronization
    // ------------------------------------------------------------------

    fn mark_dirty(&mut self, index: u64, offset: u64, status: PageStatus, pages: u32) -> Result<()> {
        self.meta
            .push_dirty(DirtyLogEntry::new(index, offset, status, pages))
    }

    /// Keeps enough dirty-log headroom that no single operation can
    /// overflow it mid-flight. Runs a sync at the current epoch and event
    /// ids when the slack is gone.
    fn flush_headroom(&mut self) -> Result<()> {
        if self.meta.dirty_remaining() < DIRTY_LOG_SLACK {
            let (epoch, event) = (self.meta.epoch(), self.meta.event());
            self.sync_at(epoch, event)?;
        }
        Ok(())
    }

    fn sync_at(&mut self, epoch: u64, event: u64) -> Result<()> {
        // 1. Quiesce: publish this epoch's retired blocks and settle the
        //    cache flag while its page is still writable, flush dirtied
        //    content, withdraw write permission.
        let cache_index = self.meta.dpage_cache_index();
        if cache_index != NO_PAGE && self.mapping.is_writable(cache_index) {
            let cache = DpageCachePage::from_bytes_mut(self.mapping.page_mut(cache_index))?;
            cache.publish();
            cache.set_dirty(false);
        }
        let entries: Vec<DirtyLogEntry> = self.meta.dirty_entries().to_vec();
        for entry in &entries {
            self.mapping
                .sync_pages(entry.index(), entry.page_count() as u64)?;
            self.mapping
                .protect_read(entry.index(), entry.page_count() as u64)?;
        }
        self.mapping.protect_remaining()?;

        // 2. Intent: the metadata replicas carry the dirty log; once one
        //    replica is durably written the epoch is committed, because
        //    replay of the log is idempotent.
        self.meta.set_epoch(epoch);
        self.meta.set_event(event);
        self.meta.write_replicas(&self.snapshot)?;

        // 3. Apply the log to the page directory in append order.
        self.directory.unprotect()?;
        for entry in &entries {
            self.directory
                .apply(entry.index(), entry.offset(), entry.status(), entry.page_count())?;
        }
        self.directory.flush()?;
        self.directory.protect()?;

        // 4. Freed runs become reusable only now that "free" is durable.
        for entry in &entries {
            if entry.status() == PageStatus::Free {
                self.free_pages.push_run(entry.index(), entry.page_count() as u64);
            }
        }
        self.meta.clear_dirty();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Error tiers
    // ------------------------------------------------------------------

    fn recoverable(&self, address: u64, msg: &str) {
        if self.options.strict {
            self.fatal(address, msg);
        }
        warn!("{} (address {:#x})", msg, address);
    }

    fn fatal(&self, address: u64, msg: &str) -> ! {
        error!("{} (address {:#x})", msg, address);
        panic!("{} (address {:#x})", msg, address);
    }
}

/// An arena behind the external lock the single-mutator model requires
/// when an embedding shares one arena across threads.
pub struct SharedArena {
    inner: Mutex<Arena>,
}

impl SharedArena {
    pub fn new(arena: Arena) -> Self {
        Self {
            inner: Mutex::new(arena),
        }
    }

    /// Exclusive access for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, Arena> {
        self.inner.lock()
    }

    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.lock().allocate(size)
    }

    pub fn deallocate(&self, address: *mut u8) {
        self.inner.lock().deallocate(address)
    }

    pub fn sync(&self, epoch: u64, event: u64) -> Result<()> {
        self.inner.lock().sync(epoch, event)
    }
}

//! # Dpage Cache
//!
//! A dpage is a page-sized block of *disk* space in the snapshot file,
//! independent of any virtual mapping. Copy-on-write relocation constantly
//! retires blocks (the pre-relocation copies), and this cache queues them
//! for reuse so the file only grows when the queue runs dry.
//!
//! The cache lives inside an ordinary arena page: it is itself subject to
//! copy-on-write like everything else. Its in-page `dirty` flag records
//! whether the cache page has already been relocated (and is therefore
//! writable) in the current epoch; the copy-on-write engine consults it to
//! avoid recursing while relocating the cache itself.
//!
//! ## The Safe Boundary
//!
//! A block retired by copy-on-write is still referenced by the durable
//! snapshot until the sync that relocated its page commits; handing it out
//! earlier would let this epoch overwrite content a crash still needs.
//! The queue therefore has two watermarks: pushes advance only `tail`,
//! while `len` counts the *safe* entries behind `head` that earlier syncs
//! have published. Pops are limited to `len`; each sync republishes
//! `len` to cover everything queued, at which point the whole backlog
//! becomes reusable.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Field   Description
//! ------  ----  ------  ------------------------------------------
//! 0       2     dirty   Non-zero once the page is writable this epoch
//! 2       2     len     Number of safe (poppable) entries
//! 4       2     head    Index of the oldest entry
//! 6       2     tail    Index one past the newest entry
//! 8       4088  queue   511-slot circular buffer of disk offsets
//! ```
//!
//! One slot is kept empty so a full queue is distinguishable from an
//! empty one; pushing into a full queue fails and the caller drops the
//! offset (leaking the block on disk, which is safe).

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{DPAGE_CACHE_CAPACITY, PAGE_SIZE};

/// The dpage cache's full-page representation.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DpageCachePage {
    dirty: U16,
    len: U16,
    head: U16,
    tail: U16,
    queue: [U64; DPAGE_CACHE_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<DpageCachePage>() == PAGE_SIZE);

impl DpageCachePage {
    pub fn from_bytes(page: &[u8]) -> Result<&Self> {
        ensure!(
            page.len() == PAGE_SIZE,
            "dpage cache page must be exactly {} bytes, got {}",
            PAGE_SIZE,
            page.len()
        );
        Self::ref_from_bytes(page)
            .map_err(|e| eyre::eyre!("failed to read dpage cache page: {e:?}"))
    }

    pub fn from_bytes_mut(page: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            page.len() == PAGE_SIZE,
            "dpage cache page must be exactly {} bytes, got {}",
            PAGE_SIZE,
            page.len()
        );
        Self::mut_from_bytes(page)
            .map_err(|e| eyre::eyre!("failed to read dpage cache page: {e:?}"))
    }

    /// Initializes a freshly acquired, writable page as an empty cache.
    pub fn reset(&mut self) {
        self.dirty = U16::new(1);
        self.len = U16::new(0);
        self.head = U16::new(0);
        self.tail = U16::new(0);
        self.queue = [U64::new(0); DPAGE_CACHE_CAPACITY];
    }

    /// Whether the cache page has already been made writable this epoch.
    pub fn is_dirty(&self) -> bool {
        self.dirty.get() != 0
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = U16::new(dirty as u16);
    }

    /// Safe entries: queued blocks that a completed sync has published
    /// for reuse.
    pub fn available(&self) -> usize {
        self.len.get() as usize
    }

    /// Everything in the queue, including blocks retired this epoch that
    /// are not reusable yet.
    pub fn queued(&self) -> usize {
        let head = self.head.get() as usize;
        let tail = self.tail.get() as usize;
        (tail + DPAGE_CACHE_CAPACITY - head) % DPAGE_CACHE_CAPACITY
    }

    /// The oldest safe offset without removing it.
    pub fn peek_front(&self) -> Option<u64> {
        if self.available() == 0 {
            return None;
        }
        Some(self.queue[self.head.get() as usize].get())
    }

    /// Removes and returns the oldest safe offset.
    pub fn pop_front(&mut self) -> Option<u64> {
        if self.available() == 0 {
            return None;
        }
        let head = self.head.get() as usize;
        let offset = self.queue[head].get();
        self.head = U16::new(((head + 1) % DPAGE_CACHE_CAPACITY) as u16);
        self.len = U16::new(self.len.get() - 1);
        Some(offset)
    }

    /// Queues a retired offset behind the safe boundary. Returns `false`
    /// when the queue is full and the offset was not recorded.
    pub fn push_back(&mut self, offset: u64) -> bool {
        if self.queued() == DPAGE_CACHE_CAPACITY - 1 {
            return false;
        }
        let tail = self.tail.get() as usize;
        self.queue[tail] = U64::new(offset);
        self.tail = U16::new(((tail + 1) % DPAGE_CACHE_CAPACITY) as u16);
        true
    }

    /// Moves the safe boundary over the whole backlog. Called while the
    /// epoch's sync quiesces the arena, so the published count lands in
    /// the same durable page content as the queue itself.
    pub fn publish(&mut self) {
        self.len = U16::new(self.queued() as u16);
    }
}

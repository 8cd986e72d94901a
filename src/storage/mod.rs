//! # Storage Layer
//!
//! Disk-resident structures and the mapping machinery underneath the
//! arena: every byte that must survive a restart is defined here, along
//! with the fixed-address mapping that makes those bytes addressable at
//! stable virtual locations.
//!
//! ## On-Disk Inventory
//!
//! ```text
//! arena_dir/
//! ├── snap.bin    # 2 metadata replica pages, then arena content pages
//! └── page.bin    # flat array of 16-byte page-directory entries
//! ```
//!
//! The snapshot file's content pages appear in allocation order, not
//! virtual-address order: copy-on-write relocates pages to whatever block
//! is free, and only the page directory knows which block backs which
//! virtual page.
//!
//! ## Module Organization
//!
//! - `mapping`: fixed-address per-page mmap, protection, address↔index
//! - `directory`: page statuses and the mmap'd page-directory array
//! - `meta`: the replicated, checksummed metadata page and dirty-page log
//! - `slab`: sub-page slot pages (header, bitmap, size-class math)
//! - `dpage`: the in-arena FIFO of reusable disk blocks
//! - `runs`: process-private free-page caches (rebuilt on reload)
//!
//! ## Consistency Model
//!
//! All durable structures obey one discipline: synced pages are read-only
//! and relocate before mutation (copy-on-write), while not-yet-synced
//! changes are described by append-only dirty-log entries that a sync pass
//! applies to the directory in order. The metadata replicas make the
//! transition between epochs atomic; everything else is recoverable from
//! them plus the directory.

mod directory;
mod dpage;
mod mapping;
mod meta;
mod runs;
mod slab;

pub use directory::{PageDirEntry, PageDirectory, PageStatus};
pub use dpage::DpageCachePage;
pub use mapping::ArenaMapping;
pub use meta::{checksum, DirtyLogEntry, Metadata};
pub use runs::{FreePageCache, PageRun};
pub use slab::{
    bucket_for_size, bucket_slot, slot_count, slot_for_offset, slot_offset, slot_size,
    SlabPageHeader, SlotBitmap,
};

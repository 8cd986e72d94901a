//! # Arena Configuration Constants
//!
//! This module centralizes every configuration constant, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch
//! bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SHIFT (12)
//!       │
//!       ├─> PAGE_SIZE (1 << PAGE_SHIFT = 4096 bytes)
//!       │     │
//!       │     ├─> PAGE_MASK (offset-within-page mask)
//!       │     │
//!       │     ├─> MAX_SHARED_SHIFT (PAGE_SHIFT - 2)
//!       │     │     Largest slab slot is 1/4 page. Anything larger would
//!       │     │     burn most of a page anyway once the in-page header is
//!       │     │     accounted for, so it goes through the multi-page path.
//!       │     │
//!       │     ├─> DIRTY_LOG_CAPACITY (derived, must fit the metadata page)
//!       │     │
//!       │     └─> DPAGE_CACHE_CAPACITY (derived, fills one page exactly)
//!       │
//!       └─> MIN_ALLOC_SHIFT (4)
//!             │
//!             ├─> MIN_ALLOC_SIZE (16 bytes, smallest slab slot)
//!             │
//!             └─> SHARED_BUCKET_COUNT (buckets MIN..=MAX shared shift)
//!
//! SLAB_HEADER_SIZE (48) + SLAB_BITMAP_BITS (248)
//!       │
//!       └─> Together bounded by PAGE_SIZE: the bitmap must never describe
//!           a minimum-size slot that would fall beyond the page end.
//!
//! METADATA_PAGE_COUNT (2)
//!       │
//!       └─> Replicated metadata pages at the front of the snapshot file.
//!           Two byte-identical, checksummed copies are what make metadata
//!           updates atomic across crashes: a torn write corrupts at most
//!           the copy being written.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `SLAB_HEADER_SIZE + SLAB_BITMAP_BITS * MIN_ALLOC_SIZE <= PAGE_SIZE`
//! 2. `META_FIXED_BYTES + DIRTY_LOG_CAPACITY * DIRTY_ENTRY_BYTES <= PAGE_SIZE`
//! 3. `DPAGE_CACHE_HEADER_BYTES + DPAGE_CACHE_CAPACITY * 8 == PAGE_SIZE`
//! 4. `METADATA_PAGE_COUNT >= 2` (a single copy cannot be crash-atomic)
//!
//! ## Modifying Constants
//!
//! Changing `PAGE_SHIFT` or `MIN_ALLOC_SHIFT` re-derives everything below
//! them; the compile-time assertions catch a combination that no longer
//! fits a page. The on-disk format version must be bumped for any change
//! that moves persisted bytes.

// ============================================================================
// PAGE GEOMETRY
// ============================================================================

/// log2 of the page size. Should match the native page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of an arena page in bytes (4096).
/// This is the unit of mapping, protection, and disk block allocation.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask for the offset of an address inside its page.
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

// ============================================================================
// ALLOCATION SIZE CLASSES
// These are tightly coupled - changing one may require changing others
// ============================================================================

/// log2 of the minimum allocation size.
pub const MIN_ALLOC_SHIFT: u32 = 4;

/// Minimum size of an allocation in bytes. Requests below this are rounded
/// up; anything smaller is more bookkeeping than payload.
pub const MIN_ALLOC_SIZE: usize = 1 << MIN_ALLOC_SHIFT;

/// log2 of the largest slab-allocated slot (1/4 page).
pub const MAX_SHARED_SHIFT: u32 = PAGE_SHIFT - 2;

/// Largest request served from a slab page. Larger requests round up to
/// whole pages.
pub const MAX_SHARED_ALLOC: usize = 1 << MAX_SHARED_SHIFT;

/// Number of slab size-class buckets (slot sizes 2^MIN..=2^MAX shared shift).
pub const SHARED_BUCKET_COUNT: usize = (MAX_SHARED_SHIFT - MIN_ALLOC_SHIFT + 1) as usize;

const _: () = assert!(
    MAX_SHARED_ALLOC == PAGE_SIZE / 4,
    "slab ceiling must be a quarter page"
);

// ============================================================================
// SLAB PAGE LAYOUT
// ============================================================================

/// Bytes reserved at the start of every slab page for its header.
pub const SLAB_HEADER_SIZE: usize = 48;

/// Bytes in the slab free-slot bitmap.
pub const SLAB_BITMAP_BYTES: usize = 31;

/// Bits in the slab free-slot bitmap (one per slot, 1 = free).
pub const SLAB_BITMAP_BITS: usize = SLAB_BITMAP_BYTES * 8;

const _: () = assert!(
    SLAB_HEADER_SIZE + SLAB_BITMAP_BITS * MIN_ALLOC_SIZE <= PAGE_SIZE,
    "bitmap must not describe slots beyond the end of the page"
);

// ============================================================================
// METADATA PAGE LAYOUT
// ============================================================================

/// Number of replicated metadata pages at the front of the snapshot file.
/// Minimum 2: replica redundancy is the atomic-update mechanism.
pub const METADATA_PAGE_COUNT: usize = 2;

/// Total bytes occupied by the metadata replicas.
pub const METADATA_BYTES: usize = METADATA_PAGE_COUNT * PAGE_SIZE;

const _: () = assert!(
    METADATA_PAGE_COUNT >= 2,
    "metadata needs at least two replicas"
);

/// Stamp identifying a file as an arena snapshot.
pub const MAGIC_CODE: u64 = 0xBADD_ECAF_C0FF_EE00;

/// On-disk format version, bumped on breaking layout changes.
pub const DATA_VERSION: u32 = 1;

/// Bytes of fixed metadata fields preceding the dirty log in the page.
pub const META_FIXED_BYTES: usize = 136;

/// Bytes per dirty-log entry.
pub const DIRTY_ENTRY_BYTES: usize = 24;

/// Dirty-log entries that fit in the metadata page after the fixed fields.
pub const DIRTY_LOG_CAPACITY: usize = (PAGE_SIZE - META_FIXED_BYTES) / DIRTY_ENTRY_BYTES;

/// Headroom kept in the dirty log: public operations trigger an internal
/// sync once fewer than this many slots remain, so the handful of entries a
/// single operation can append never overflows mid-operation.
pub const DIRTY_LOG_SLACK: usize = 8;

const _: () = assert!(
    META_FIXED_BYTES + DIRTY_LOG_CAPACITY * DIRTY_ENTRY_BYTES <= PAGE_SIZE,
    "metadata fixed fields plus dirty log must fit one page"
);

// ============================================================================
// DPAGE CACHE LAYOUT
// The cache of free disk blocks lives in an ordinary arena page
// ============================================================================

/// Bytes of queue bookkeeping at the start of the dpage-cache page.
pub const DPAGE_CACHE_HEADER_BYTES: usize = 8;

/// Free disk-block offsets the cache page can queue.
pub const DPAGE_CACHE_CAPACITY: usize = (PAGE_SIZE - DPAGE_CACHE_HEADER_BYTES) / 8;

const _: () = assert!(
    DPAGE_CACHE_HEADER_BYTES + DPAGE_CACHE_CAPACITY * 8 == PAGE_SIZE,
    "dpage cache must fill its page exactly"
);

// ============================================================================
// BACKING FILES
// ============================================================================

/// Snapshot file: metadata replicas followed by arena page content.
pub const SNAPSHOT_FILENAME: &str = "snap.bin";

/// Page-directory file: a flat array of page-directory entries.
pub const PAGE_DIR_FILENAME: &str = "page.bin";

/// Initial snapshot file size (1 GiB, sparse).
pub const INITIAL_SNAPSHOT_BYTES: u64 = 1 << 30;

/// Snapshot growth increment (4 GiB). Extension is monotonic; the file
/// never shrinks.
pub const SNAPSHOT_GROWTH_BYTES: u64 = 1 << 32;

/// Bytes per page-directory entry.
pub const PAGE_DIR_ENTRY_BYTES: usize = 16;

/// Initial page-directory file size (4 MiB = entries for a 1 GiB arena).
pub const INITIAL_PAGE_DIR_BYTES: u64 = 1 << 22;

/// Page-directory file growth increment.
pub const PAGE_DIR_GROWTH_BYTES: u64 = 1 << 22;

/// Reserved length of the page-directory mapping (4 GiB of entries, enough
/// for a 1 TiB arena). The mapping is created at this size once and the
/// file grows underneath it, so the directory never relocates.
pub const PAGE_DIR_MAX_BYTES: usize = 1 << 32;

const _: () = assert!(INITIAL_SNAPSHOT_BYTES % PAGE_SIZE as u64 == 0);
const _: () = assert!(INITIAL_PAGE_DIR_BYTES % PAGE_DIR_ENTRY_BYTES as u64 == 0);

// ============================================================================
// ADDRESS SPACE
// ============================================================================

/// Default base address for the arena's reserved virtual range. Low enough
/// that the range can grow for a long time before meeting the process
/// image; equal to the common `vm.mmap_min_addr` floor.
pub const DEFAULT_ARENA_BASE: u64 = 0x10000;

/// Sentinel page index meaning "no page" (empty slab bucket stack).
pub const NO_PAGE: u64 = u64::MAX;

//! # permarena - Persistent Memory Arena Allocator
//!
//! permarena is a `malloc`/`free`-equivalent allocator whose heap is a
//! single large virtual address range backed, page-for-page, by a disk
//! file. Unlike an ordinary heap, every allocation survives process
//! restart with byte-identical content *and address*, and every mutation
//! eventually becomes durable through an explicit, crash-safe
//! synchronization pass.
//!
//! ## Quick Start
//!
//! ```ignore
//! use permarena::Arena;
//!
//! let mut arena = Arena::load("./state")?;
//!
//! let ptr = arena.allocate(256).expect("out of memory");
//! // ... write through ptr ...
//! arena.sync(epoch, event)?;          // durable checkpoint
//! arena.deallocate(ptr.as_ptr());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │         Public API (Arena context)        │
//! ├─────────────────────┬─────────────────────┤
//! │  Slab Allocator     │ Multi-Page Allocator│
//! │  (≤ 1/4 page slots) │ (whole-page runs)   │
//! ├─────────────────────┴─────────────────────┤
//! │  Free Caches: single pages · page runs ·  │
//! │  dpage cache (reusable disk blocks)       │
//! ├───────────────────────────────────────────┤
//! │  Copy-on-Write Engine + Dirty-Page Log    │
//! ├───────────────────────────────────────────┤
//! │  Page Directory │ Replicated Metadata     │
//! ├─────────────────┴─────────────────────────┤
//! │  Fixed-Address mmap over snapshot file    │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! arena_dir/
//! ├── snap.bin    # 2 checksummed metadata replicas, then content pages
//! └── page.bin    # page directory: {status, disk offset} per page
//! ```
//!
//! ## Durability Model
//!
//! Synced pages are mapped read-only. The first mutation of such a page
//! relocates it to a fresh disk block (copy-on-write) so the previous
//! snapshot stays intact, and appends the change to a dirty-page log
//! carried inside the metadata. `Arena::sync` flushes content, commits
//! the metadata replicas (the atomic point), and then applies the log to
//! the page directory. A crash at any step leaves either the old or the
//! new snapshot fully recoverable, never a mix.
//!
//! ## Concurrency
//!
//! One mutator at a time, enforced statically by `&mut self`. Wrap the
//! arena in [`SharedArena`] to share it across threads behind the
//! required lock.
//!
//! ## Module Overview
//!
//! - [`arena`]: the allocator context and public operations
//! - [`storage`]: disk-resident structures and the mapping machinery
//! - [`config`]: constants and per-arena options

pub mod arena;
pub mod config;
pub mod storage;

pub use arena::{Arena, ArenaStats, SharedArena};
pub use config::ArenaOptions;
pub use storage::{checksum, PageStatus};

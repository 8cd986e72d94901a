//! Configuration: compile-time constants and per-arena options.

mod constants;

pub use constants::*;

/// Per-arena knobs supplied at creation or open time.
///
/// The base address must match between the process that created an arena
/// and every process that reopens it; it is recorded in the snapshot
/// metadata and verified on open.
#[derive(Debug, Clone, Copy)]
pub struct ArenaOptions {
    /// First address of the reserved virtual range. The arena content
    /// starts `METADATA_BYTES` above it.
    pub base_addr: u64,
    /// Promote recoverable warnings (double free, out-of-range free) to
    /// fatal errors. Intended for tests and debugging.
    pub strict: bool,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            base_addr: DEFAULT_ARENA_BASE,
            strict: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_capacities_match_the_page_layout() {
        assert_eq!(DIRTY_LOG_CAPACITY, 165);
        assert_eq!(DPAGE_CACHE_CAPACITY, 511);
        assert_eq!(SHARED_BUCKET_COUNT, 7);
        assert_eq!(MAX_SHARED_ALLOC, 1024);
    }

    #[test]
    fn default_options_use_low_base() {
        let opts = ArenaOptions::default();
        assert_eq!(opts.base_addr, DEFAULT_ARENA_BASE);
        assert!(!opts.strict);
    }
}

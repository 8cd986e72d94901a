//! # Free Page Caches
//!
//! Process-private bookkeeping for virtual pages that are reserved but
//! content-free: a stack of individual free pages and a list of contiguous
//! free-page runs. Both are pure memory-mapping optimizations: the page
//! directory is the ground truth and both structures are rebuilt from it
//! on reload, so they are plain index-based containers, not disk records.
//!
//! Pages enter these caches only during a synchronization pass (a freed
//! run must first be durably marked free before its space can be reused;
//! otherwise a crash could re-expose stale content) and leave them when an
//! allocation claims the space.

use smallvec::SmallVec;

/// A contiguous sequence of free virtual pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRun {
    pub index: u64,
    pub len: u64,
}

/// The single-page stack and run list.
#[derive(Debug, Default)]
pub struct FreePageCache {
    singles: Vec<u64>,
    runs: SmallVec<[PageRun; 8]>,
}

impl FreePageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a run of `len` free pages starting at `index`. A length-one
    /// run goes onto the single-page stack instead of the run list.
    pub fn push_run(&mut self, index: u64, len: u64) {
        debug_assert!(len > 0);
        if len == 1 {
            self.singles.push(index);
        } else {
            self.runs.push(PageRun { index, len });
        }
    }

    /// Pops one free page, most recently recorded first.
    pub fn take_single(&mut self) -> Option<u64> {
        self.singles.pop()
    }

    /// Claims `n` contiguous pages from the run list and returns the run's
    /// base index.
    ///
    /// Two-pass policy: an exactly-`n` run wins outright; otherwise the
    /// smallest run still at least `n` long is used. A run longer than
    /// `n + 1` shrinks in place (its base advances); a run of exactly `n`
    /// or `n + 1` is removed, with the one trailing page of an `n + 1` run
    /// moved to the single-page stack rather than left as a degenerate
    /// one-page run.
    pub fn take_run(&mut self, n: u64) -> Option<u64> {
        debug_assert!(n > 1);
        let mut best: Option<usize> = None;
        for (at, run) in self.runs.iter().enumerate() {
            if run.len == n {
                best = Some(at);
                break;
            }
            if run.len > n && best.is_none_or(|b| self.runs[b].len > run.len) {
                best = Some(at);
            }
        }
        let at = best?;

        let run = self.runs[at];
        if run.len > n + 1 {
            self.runs[at].index += n;
            self.runs[at].len -= n;
        } else {
            self.runs.swap_remove(at);
            if run.len == n + 1 {
                self.singles.push(run.index + n);
            }
        }
        Some(run.index)
    }

    pub fn clear(&mut self) {
        self.singles.clear();
        self.runs.clear();
    }

    pub fn single_count(&self) -> usize {
        self.singles.len()
    }

    /// Total pages held in multi-page runs.
    pub fn run_page_count(&self) -> u64 {
        self.runs.iter().map(|r| r.len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singles_are_a_lifo_stack() {
        let mut cache = FreePageCache::new();
        cache.push_run(3, 1);
        cache.push_run(9, 1);

        assert_eq!(cache.take_single(), Some(9));
        assert_eq!(cache.take_single(), Some(3));
        assert_eq!(cache.take_single(), None);
    }

    #[test]
    fn exact_run_wins_over_smaller_leftover() {
        let mut cache = FreePageCache::new();
        cache.push_run(10, 5);
        cache.push_run(30, 3);

        assert_eq!(cache.take_run(3), Some(30));
        // The 5-run must be untouched.
        assert_eq!(cache.run_page_count(), 5);
    }

    #[test]
    fn smallest_adequate_run_is_chosen_when_no_exact_match() {
        let mut cache = FreePageCache::new();
        cache.push_run(10, 8);
        cache.push_run(50, 4);
        cache.push_run(90, 6);

        assert_eq!(cache.take_run(3), Some(50));
    }

    #[test]
    fn oversized_run_shrinks_in_place() {
        let mut cache = FreePageCache::new();
        cache.push_run(10, 8);

        assert_eq!(cache.take_run(3), Some(10));
        assert_eq!(cache.take_run(5), Some(13));
        assert_eq!(cache.run_page_count(), 0);
        assert_eq!(cache.take_single(), None);
    }

    #[test]
    fn n_plus_one_run_spills_trailing_page_to_singles() {
        let mut cache = FreePageCache::new();
        cache.push_run(20, 4);

        assert_eq!(cache.take_run(3), Some(20));
        assert_eq!(cache.run_page_count(), 0);
        assert_eq!(cache.take_single(), Some(23));
    }

    #[test]
    fn run_too_small_is_not_used() {
        let mut cache = FreePageCache::new();
        cache.push_run(10, 2);

        assert_eq!(cache.take_run(3), None);
        assert_eq!(cache.run_page_count(), 2);
    }

    #[test]
    fn clear_drops_everything() {
        let mut cache = FreePageCache::new();
        cache.push_run(1, 1);
        cache.push_run(10, 4);

        cache.clear();

        assert_eq!(cache.single_count(), 0);
        assert_eq!(cache.run_page_count(), 0);
    }
}

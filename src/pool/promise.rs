// # DL Promises
//
// A display-list pool may hold at most one promise: a single contiguous
// reservation handed out as sequential word-aligned sub-allocations. The
// sub-allocations are never freed individually; ending the promise
// truncates the reservation to its used size, and freeing it abandons
// whatever part is still owned.
//
// The state is a strictly linear bump allocator: base <= next <= top.

/// Word alignment of promise sub-allocations.
pub const PROMISE_ALIGN: usize = std::mem::size_of::<usize>();

/// Promise state for one DL pool. Addresses are raw; 0 means "none".
#[derive(Debug, Default)]
pub(crate) struct PromiseState {
    /// Start of the active promise; `None` when no promise is active
    /// (an ended promise keeps next/top so it can still be freed).
    pub base: Option<usize>,
    pub next: usize,
    pub top: usize,
}

impl PromiseState {
    pub fn begin(&mut self, base: usize, size: usize) {
        debug_assert!(self.base.is_none(), "promise already made");
        self.base = Some(base);
        self.next = base;
        self.top = base + size;
    }

    /// Hand out the next `size` bytes, or `None` if the promise is
    /// exhausted.
    pub fn next_block(&mut self, size: usize) -> Option<usize> {
        debug_assert!(self.base.is_some(), "promise request with no active promise");
        let size = super::backend::round_up(size, PROMISE_ALIGN);
        if self.top - self.next < size {
            return None;
        }
        let result = self.next;
        self.next += size;
        Some(result)
    }

    /// Give back the last `size` bytes of what has been handed out.
    pub fn shrink(&mut self, size: usize) {
        debug_assert!(self.base.is_some(), "promise shrink with no active promise");
        let size = super::backend::round_down(size, PROMISE_ALIGN);
        self.next -= size;
        debug_assert!(
            self.base.map_or(true, |b| b <= self.next),
            "shrinking promise too far"
        );
    }

    /// End the promise. Returns what the caller must do with the
    /// reservation and the promise's final size.
    pub fn end(&mut self) -> (PromiseEnd, usize) {
        let base = self.base.take().expect("ending non-existent promise");
        let next = self.next;
        let top = self.top;
        debug_assert!(top >= next && next >= base, "inconsistent promise pointers");

        if next == base {
            // Untouched: free the whole reservation.
            self.next = 0;
            self.top = 0;
            (PromiseEnd::FreeWhole { base, size: top - base }, 0)
        } else {
            let old_size = top - base;
            let new_size = next - base;
            // Keep the used part addressable for a later promise_free.
            self.top = next;
            self.next = base;
            (
                PromiseEnd::Truncate { base, old_size, new_size },
                new_size,
            )
        }
    }

    /// Abandon whatever part of the promise is still owned. Returns the
    /// range to free, if any.
    pub fn free(&mut self) -> Option<(usize, usize)> {
        let start = match self.base.take() {
            Some(base) => base,
            // Already ended: free the used part recorded by end().
            None => self.next,
        };
        if start == 0 {
            return None;
        }
        let len = self.top - start;
        self.next = 0;
        self.top = 0;
        Some((start, len))
    }

    pub fn is_active(&self) -> bool {
        self.base.is_some()
    }
}

/// What ending a promise requires of the pool.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PromiseEnd {
    FreeWhole { base: usize, size: usize },
    Truncate { base: usize, old_size: usize, new_size: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_promise_frees_whole() {
        let mut p = PromiseState::default();
        p.begin(0x1000, 256);
        let (end, size) = p.end();
        assert_eq!(end, PromiseEnd::FreeWhole { base: 0x1000, size: 256 });
        assert_eq!(size, 0);
        assert!(!p.is_active());
        assert_eq!(p.free(), None);
    }

    #[test]
    fn sequential_suballocation_then_truncate() {
        let mut p = PromiseState::default();
        p.begin(0x1000, 256);
        assert_eq!(p.next_block(24), Some(0x1000));
        assert_eq!(p.next_block(8), Some(0x1018));
        let (end, size) = p.end();
        assert_eq!(
            end,
            PromiseEnd::Truncate { base: 0x1000, old_size: 256, new_size: 32 }
        );
        assert_eq!(size, 32);
        // The used part can still be freed afterwards.
        assert_eq!(p.free(), Some((0x1000, 32)));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut p = PromiseState::default();
        p.begin(0x1000, 16);
        assert_eq!(p.next_block(16), Some(0x1000));
        assert_eq!(p.next_block(8), None);
    }

    #[test]
    fn shrink_moves_next_back() {
        let mut p = PromiseState::default();
        p.begin(0x1000, 64);
        p.next_block(32);
        p.shrink(16);
        assert_eq!(p.next_block(8), Some(0x1010));
    }

    #[test]
    fn abandoning_active_promise_frees_all() {
        let mut p = PromiseState::default();
        p.begin(0x1000, 128);
        p.next_block(64);
        assert_eq!(p.free(), Some((0x1000, 128)));
        assert!(!p.is_active());
    }
}

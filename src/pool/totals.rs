// # Per-pool Debug Totals
//
// Lightweight accounting kept on every pool: live bytes, high-water mark,
// lifetime totals, and the worst fragmentation seen at an allocation
// failure. All counters are relaxed atomics; the numbers are for
// diagnosis, not for control flow.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Totals {
    current_alloc: AtomicUsize,
    highest_alloc: AtomicUsize,
    overall_alloc: AtomicU64,
    overall_obj: AtomicU64,
    highest_frag: AtomicUsize,
    sac_current: AtomicUsize,
    sac_overall: AtomicU64,
}

/// Point-in-time copy of a pool's totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalsSnapshot {
    pub current_alloc: usize,
    pub highest_alloc: usize,
    pub overall_alloc: u64,
    pub overall_obj: u64,
    pub highest_frag: usize,
    pub sac_current: usize,
    pub sac_overall: u64,
}

impl Totals {
    pub fn on_alloc(&self, size: usize) {
        let now = self.current_alloc.fetch_add(size, Ordering::Relaxed) + size;
        self.highest_alloc.fetch_max(now, Ordering::Relaxed);
        self.overall_alloc.fetch_add(size as u64, Ordering::Relaxed);
        self.overall_obj.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_free(&self, size: usize) {
        self.current_alloc.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn on_truncate(&self, surplus: usize) {
        self.current_alloc.fetch_sub(surplus, Ordering::Relaxed);
    }

    pub fn on_sac_alloc(&self, size: usize) {
        self.sac_current.fetch_add(size, Ordering::Relaxed);
        self.sac_overall.fetch_add(size as u64, Ordering::Relaxed);
        self.on_alloc(size);
    }

    pub fn on_sac_free(&self, size: usize) {
        self.sac_current.fetch_sub(size, Ordering::Relaxed);
        self.on_free(size);
    }

    pub fn on_alloc_fail(&self, free_size: usize) {
        self.highest_frag.fetch_max(free_size, Ordering::Relaxed);
    }

    pub fn clear_current(&self) {
        self.current_alloc.store(0, Ordering::Relaxed);
        self.sac_current.store(0, Ordering::Relaxed);
    }

    /// Resynchronise the live count with the backend (used after restore
    /// and collection, which free blocks behind the front-end's back).
    pub fn update_current(&self, current: usize) {
        self.current_alloc.store(current, Ordering::Relaxed);
    }

    pub fn current(&self) -> usize {
        self.current_alloc.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            current_alloc: self.current_alloc.load(Ordering::Relaxed),
            highest_alloc: self.highest_alloc.load(Ordering::Relaxed),
            overall_alloc: self.overall_alloc.load(Ordering::Relaxed),
            overall_obj: self.overall_obj.load(Ordering::Relaxed),
            highest_frag: self.highest_frag.load(Ordering::Relaxed),
            sac_current: self.sac_current.load(Ordering::Relaxed),
            sac_overall: self.sac_overall.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_tracks_peak() {
        let t = Totals::default();
        t.on_alloc(100);
        t.on_alloc(200);
        t.on_free(100);
        t.on_alloc(50);

        let snap = t.snapshot();
        assert_eq!(snap.current_alloc, 250);
        assert_eq!(snap.highest_alloc, 300);
        assert_eq!(snap.overall_alloc, 350);
        assert_eq!(snap.overall_obj, 3);
    }

    #[test]
    fn frag_records_worst_failure() {
        let t = Totals::default();
        t.on_alloc_fail(4096);
        t.on_alloc_fail(1024);
        assert_eq!(t.snapshot().highest_frag, 4096);
    }
}

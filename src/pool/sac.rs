// # Segregated Allocation Cache
//
// A pool may carry a SAC: a small set of size classes, each caching freed
// blocks of its class size for reuse without touching the pool's free
// list. The class table declares a block size, how many blocks to keep
// cached, and a relative frequency hint.
//
// Cached blocks are always whole class-sized blocks; a request is served
// from the smallest class that holds it.

use std::ptr::NonNull;

use crate::arena::RawBlock;

/// Upper bound on size classes per SAC.
pub const SAC_CLASS_LIMIT: usize = 8;

/// One row of a SAC class table.
#[derive(Debug, Clone, Copy)]
pub struct SacClass {
    pub block_size: usize,
    pub cached_count: usize,
    pub frequency: usize,
}

struct SacSlot {
    block_size: usize,
    cached_count: usize,
    cached: Vec<RawBlock>,
}

pub(crate) struct Sac {
    slots: Vec<SacSlot>,
}

impl Sac {
    /// Build a SAC from a class table. Sizes are the caller's adjusted
    /// (fencepost-inclusive) sizes, sorted ascending.
    pub fn new(classes: &[SacClass]) -> Sac {
        debug_assert!(!classes.is_empty() && classes.len() <= SAC_CLASS_LIMIT);
        let mut slots: Vec<SacSlot> = classes
            .iter()
            .map(|c| SacSlot {
                block_size: c.block_size,
                cached_count: c.cached_count,
                cached: Vec::with_capacity(c.cached_count),
            })
            .collect();
        slots.sort_by_key(|s| s.block_size);
        Sac { slots }
    }

    /// The class a request of `size` bytes belongs to.
    pub fn class_size(&self, size: usize) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.block_size >= size)
            .map(|s| s.block_size)
    }

    /// Take a cached block for `size`, if one is available.
    pub fn take(&mut self, size: usize) -> Option<NonNull<u8>> {
        let slot = self.slots.iter_mut().find(|s| s.block_size >= size)?;
        slot.cached.pop().map(RawBlock::ptr)
    }

    /// Offer a class-sized block back to the cache. Returns the block if
    /// the class is full (or the size is unclassed) and it should go back
    /// to the pool.
    pub fn put(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        match self.slots.iter_mut().find(|s| s.block_size >= size) {
            Some(slot) if slot.cached.len() < slot.cached_count => {
                slot.cached.push(RawBlock(ptr));
                None
            }
            _ => Some(ptr),
        }
    }

    /// Drain every cached block, yielding (ptr, class size) pairs for the
    /// pool to free.
    pub fn drain(&mut self) -> Vec<(NonNull<u8>, usize)> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            for block in slot.cached.drain(..) {
                out.push((block.ptr(), slot.block_size));
            }
        }
        out
    }

    pub fn cached_bytes(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.cached.len() * s.block_size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_block(addr: usize) -> NonNull<u8> {
        NonNull::new(addr as *mut u8).unwrap()
    }

    #[test]
    fn request_maps_to_smallest_class() {
        let sac = Sac::new(&[
            SacClass { block_size: 64, cached_count: 4, frequency: 1 },
            SacClass { block_size: 256, cached_count: 2, frequency: 1 },
        ]);
        assert_eq!(sac.class_size(10), Some(64));
        assert_eq!(sac.class_size(64), Some(64));
        assert_eq!(sac.class_size(65), Some(256));
        assert_eq!(sac.class_size(257), None);
    }

    #[test]
    fn put_take_roundtrip() {
        let mut sac = Sac::new(&[SacClass { block_size: 64, cached_count: 2, frequency: 1 }]);
        assert!(sac.put(fake_block(0x1000), 48).is_none());
        assert!(sac.put(fake_block(0x2000), 64).is_none());
        // Class full: the third goes back to the pool.
        assert!(sac.put(fake_block(0x3000), 64).is_some());

        assert_eq!(sac.cached_bytes(), 128);
        assert!(sac.take(30).is_some());
        assert!(sac.take(64).is_some());
        assert!(sac.take(64).is_none());
    }

    #[test]
    fn drain_returns_class_sizes() {
        let mut sac = Sac::new(&[SacClass { block_size: 128, cached_count: 4, frequency: 1 }]);
        sac.put(fake_block(0x1000), 100);
        let drained = sac.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1, 128);
        assert_eq!(sac.cached_bytes(), 0);
    }
}

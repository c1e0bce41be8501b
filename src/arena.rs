// # Arena Gateway
//
// The arena is the lowest-level address-space provider backing every pool.
// This module wraps it behind a gateway that owns the process-wide commit
// accounting: how much the arena may commit (the commit limit), how much it
// has committed, and a small spare-segment cache that smooths the churn of
// pools repeatedly growing and shrinking by one segment.
//
// The gateway also interns telemetry symbols and labels addresses with
// them, so the event log can name pools and handlers cheaply.
//
// Invariant: committed <= commit_limit <= address_space_size.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{MmError, Result};

/// Default granularity at which pools grow the arena.
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Alignment of arena segments.
pub const SEGMENT_ALIGN: usize = 4096;

/// A raw block of arena memory.
///
/// Wrapper so blocks can live inside lock-protected pool state; the
/// containing structures serialize all access to the memory itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBlock(pub NonNull<u8>);

unsafe impl Send for RawBlock {}
unsafe impl Sync for RawBlock {}

impl RawBlock {
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn ptr(self) -> NonNull<u8> {
        self.0
    }
}

/// An interned telemetry symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(u64);

/// The storage provider underneath the gateway.
///
/// The RIP skin normally supplies one backed by whatever VM interface the
/// platform has; [`HeapArena`] is the default, backed by the process heap.
/// Implementations hand out raw storage and are not expected to track
/// commit limits; the gateway does that.
pub trait ArenaVm: Send + Sync {
    /// Obtain `size` bytes aligned to `align`, or `None` if the platform
    /// is out of address space.
    fn obtain(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return a block previously obtained with the same size/align.
    ///
    /// # Safety
    /// `ptr` must come from `obtain(size, align)` on this arena and must
    /// not be used again.
    unsafe fn surrender(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// Heap-backed arena used when the skin does not supply its own.
#[derive(Debug, Default)]
pub struct HeapArena;

impl ArenaVm for HeapArena {
    fn obtain(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align).ok()?;
        // Zero-sized obtains are excluded by the gateway.
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn surrender(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align_unchecked(size, align);
        dealloc(ptr.as_ptr(), layout);
    }
}

/// A cached spare segment (always `SEGMENT_SIZE` bytes).
struct SpareSegment(RawBlock);

/// The gateway: commit accounting plus telemetry interning over an
/// [`ArenaVm`].
pub struct ArenaGateway {
    vm: Box<dyn ArenaVm>,
    address_space_size: usize,
    commit_limit: AtomicUsize,
    committed: AtomicUsize,
    spare_commit_limit: AtomicUsize,
    spare: Mutex<Vec<SpareSegment>>,
    symbols: DashMap<String, Symbol>,
    labels: DashMap<Uuid, Symbol>,
    next_symbol: AtomicUsize,
}

impl ArenaGateway {
    pub fn new(vm: Box<dyn ArenaVm>, address_space_size: usize) -> ArenaGateway {
        ArenaGateway {
            vm,
            address_space_size,
            commit_limit: AtomicUsize::new(address_space_size),
            committed: AtomicUsize::new(0),
            spare_commit_limit: AtomicUsize::new(0),
            spare: Mutex::new(Vec::new()),
            symbols: DashMap::new(),
            labels: DashMap::new(),
            next_symbol: AtomicUsize::new(1),
        }
    }

    pub fn address_space_size(&self) -> usize {
        self.address_space_size
    }

    pub fn commit_limit(&self) -> usize {
        self.commit_limit.load(Ordering::Acquire)
    }

    /// How much the arena has committed, spare segments included.
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn spare_committed(&self) -> usize {
        self.spare.lock().len() * SEGMENT_SIZE
    }

    pub fn set_spare_commit_limit(&self, limit: usize) {
        self.spare_commit_limit.store(limit, Ordering::Release);
        self.trim_spare(limit);
    }

    /// Raise or lower the commit limit. Lowering fails (leaving the limit
    /// unchanged) if committed memory, after purging spares, still exceeds
    /// the new limit.
    pub fn try_set_commit_limit(&self, new_limit: usize) -> Result<()> {
        if new_limit > self.address_space_size {
            return Err(MmError::InvalidOperation(
                "commit limit above address space".into(),
            ));
        }
        let mut spare = self.spare.lock();
        if self.committed() > new_limit {
            // Spares are the first thing to give back.
            while self.committed() > new_limit {
                match spare.pop() {
                    Some(SpareSegment(block)) => {
                        unsafe {
                            self.vm.surrender(block.ptr(), SEGMENT_SIZE, SEGMENT_ALIGN);
                        }
                        self.committed.fetch_sub(SEGMENT_SIZE, Ordering::AcqRel);
                    }
                    None => {
                        return Err(MmError::InvalidOperation(
                            "committed memory exceeds requested commit limit".into(),
                        ))
                    }
                }
            }
        }
        self.commit_limit.store(new_limit, Ordering::Release);
        Ok(())
    }

    /// Grant a block of raw storage, counted against the commit limit.
    pub fn grant(&self, size: usize, align: usize) -> Result<RawBlock> {
        debug_assert!(size > 0, "zero-sized grant");
        if size == SEGMENT_SIZE && align <= SEGMENT_ALIGN {
            if let Some(SpareSegment(block)) = self.spare.lock().pop() {
                return Ok(block);
            }
        }
        let limit = self.commit_limit();
        let mut committed = self.committed.load(Ordering::Acquire);
        loop {
            let new = committed.checked_add(size).ok_or(MmError::VmError)?;
            if new > limit {
                return Err(MmError::VmError);
            }
            match self.committed.compare_exchange_weak(
                committed,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => committed = now,
            }
        }
        match self.vm.obtain(size, align) {
            Some(ptr) => Ok(RawBlock(ptr)),
            None => {
                self.committed.fetch_sub(size, Ordering::AcqRel);
                Err(MmError::VmError)
            }
        }
    }

    /// Release a granted block. Standard-sized segments may be kept as
    /// spares up to the spare commit limit.
    pub fn release(&self, block: RawBlock, size: usize, align: usize) {
        if size == SEGMENT_SIZE && align <= SEGMENT_ALIGN {
            let mut spare = self.spare.lock();
            let spare_limit = self.spare_commit_limit.load(Ordering::Acquire);
            if (spare.len() + 1) * SEGMENT_SIZE <= spare_limit {
                spare.push(SpareSegment(block));
                return;
            }
        }
        unsafe {
            self.vm.surrender(block.ptr(), size, align);
        }
        self.committed.fetch_sub(size, Ordering::AcqRel);
    }

    fn trim_spare(&self, limit: usize) {
        let mut spare = self.spare.lock();
        while spare.len() * SEGMENT_SIZE > limit {
            if let Some(SpareSegment(block)) = spare.pop() {
                unsafe {
                    self.vm.surrender(block.ptr(), SEGMENT_SIZE, SEGMENT_ALIGN);
                }
                self.committed.fetch_sub(SEGMENT_SIZE, Ordering::AcqRel);
            }
        }
    }

    /// Intern a telemetry symbol.
    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(sym) = self.symbols.get(name) {
            return *sym;
        }
        let sym = Symbol(self.next_symbol.fetch_add(1, Ordering::Relaxed) as u64);
        *self.symbols.entry(name.to_string()).or_insert(sym)
    }

    /// Label an identity (pool, handler) with an interned symbol.
    pub fn label(&self, id: Uuid, sym: Symbol) {
        self.labels.insert(id, sym);
    }

    pub fn label_of(&self, id: Uuid) -> Option<Symbol> {
        self.labels.get(&id).map(|s| *s)
    }
}

impl Drop for ArenaGateway {
    fn drop(&mut self) {
        self.trim_spare(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(limit: usize) -> ArenaGateway {
        let gw = ArenaGateway::new(Box::new(HeapArena), 1 << 30);
        gw.try_set_commit_limit(limit).unwrap();
        gw
    }

    #[test]
    fn grant_respects_commit_limit() {
        let gw = gateway(3 * SEGMENT_SIZE);
        let a = gw.grant(SEGMENT_SIZE, SEGMENT_ALIGN).unwrap();
        let b = gw.grant(SEGMENT_SIZE, SEGMENT_ALIGN).unwrap();
        let c = gw.grant(SEGMENT_SIZE, SEGMENT_ALIGN).unwrap();
        assert_eq!(gw.committed(), 3 * SEGMENT_SIZE);
        assert!(gw.grant(SEGMENT_SIZE, SEGMENT_ALIGN).is_err());

        gw.release(a, SEGMENT_SIZE, SEGMENT_ALIGN);
        assert_eq!(gw.committed(), 2 * SEGMENT_SIZE);
        gw.release(b, SEGMENT_SIZE, SEGMENT_ALIGN);
        gw.release(c, SEGMENT_SIZE, SEGMENT_ALIGN);
        assert_eq!(gw.committed(), 0);
    }

    #[test]
    fn spare_segments_cached_and_purged() {
        let gw = gateway(4 * SEGMENT_SIZE);
        gw.set_spare_commit_limit(2 * SEGMENT_SIZE);

        let a = gw.grant(SEGMENT_SIZE, SEGMENT_ALIGN).unwrap();
        gw.release(a, SEGMENT_SIZE, SEGMENT_ALIGN);
        // Still committed: the segment went spare.
        assert_eq!(gw.committed(), SEGMENT_SIZE);
        assert_eq!(gw.spare_committed(), SEGMENT_SIZE);

        // Reused without touching the arena VM.
        let _b = gw.grant(SEGMENT_SIZE, SEGMENT_ALIGN).unwrap();
        assert_eq!(gw.spare_committed(), 0);

        gw.set_spare_commit_limit(0);
        assert_eq!(gw.spare_committed(), 0);
    }

    #[test]
    fn lowering_limit_purges_spares_first() {
        let gw = gateway(4 * SEGMENT_SIZE);
        gw.set_spare_commit_limit(4 * SEGMENT_SIZE);
        let a = gw.grant(SEGMENT_SIZE, SEGMENT_ALIGN).unwrap();
        let b = gw.grant(SEGMENT_SIZE, SEGMENT_ALIGN).unwrap();
        gw.release(a, SEGMENT_SIZE, SEGMENT_ALIGN);
        gw.release(b, SEGMENT_SIZE, SEGMENT_ALIGN);
        assert_eq!(gw.committed(), 2 * SEGMENT_SIZE);

        gw.try_set_commit_limit(SEGMENT_SIZE).unwrap();
        assert!(gw.committed() <= SEGMENT_SIZE);
    }

    #[test]
    fn symbols_intern_once() {
        let gw = gateway(SEGMENT_SIZE);
        let a = gw.intern("DL_POOL_TYPE");
        let b = gw.intern("DL_POOL_TYPE");
        let c = gw.intern("TEMP_POOL_TYPE");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let id = Uuid::new_v4();
        gw.label(id, a);
        assert_eq!(gw.label_of(id), Some(a));
    }
}

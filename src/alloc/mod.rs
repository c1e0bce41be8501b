// # Allocation Front-end
//
// The public alloc/free/truncate surface over the pools. The fast path
// goes straight to the pool (or its SAC); the slow path enters low-memory
// handling, regains reserves for the allocation's cost, and then loops
// between retrying the allocation and running the apportioner until the
// allocation succeeds or handlers run dry.
//
// Fencepost and tag bookkeeping happen here, on every path, so the
// backends never see client sizes.

pub mod deferred;
pub mod fence;
pub mod tag;

use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cost::Cost;
use crate::error::{MmError, Result};
use crate::lowmem::Requirement;
use crate::manager::MemoryManager;
use crate::pool::promise::{PromiseEnd, PROMISE_ALIGN};
use crate::pool::sac::{Sac, SacClass, SAC_CLASS_LIMIT};
use crate::pool::{backend, Pool, PoolType, PoolUsage};

/// Allocations above this are refused outright.
pub const MAX_ALLOC: usize = 2 * 1024 * 1024 * 1024;

/// Debug accounting classes. A representative subset of the full tag
/// vocabulary; `Unspecified` is the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocClass {
    Unspecified,
    Mm,
    Promise,
    Functions,
    NColor,
    ColorChain,
    ColorCache,
    ColorTable,
    DisplayList,
    BandData,
    Image,
    ImageData,
    ImageTile,
    Font,
    FontCache,
    Halftone,
    HalftoneForm,
    Pattern,
    Shading,
    Path,
    Clip,
    Gstate,
    PsObject,
    PsString,
    Dictionary,
    FileBuffer,
    Rsd,
    Pdf,
    PdfXref,
    Xml,
    Trap,
    Band,
    Rle,
    Tiff,
    Cid,
    General,
}

impl MemoryManager {
    /// Allocate at the calling thread's default cost.
    pub fn alloc(&self, pool: &Arc<Pool>, size: usize, class: AllocClass) -> Result<NonNull<u8>> {
        self.alloc_impl(pool, size, class, None)
    }

    /// Allocate at an explicit cost.
    pub fn alloc_cost(
        &self,
        pool: &Arc<Pool>,
        size: usize,
        cost: Cost,
        class: AllocClass,
    ) -> Result<NonNull<u8>> {
        debug_assert!(cost.is_valid(), "invalid cost for allocation");
        self.alloc_impl(pool, size, class, Some(cost))
    }

    fn alloc_impl(
        &self,
        pool: &Arc<Pool>,
        size: usize,
        class: AllocClass,
        cost: Option<Cost>,
    ) -> Result<NonNull<u8>> {
        debug_assert!(size != 0, "zero-sized allocation attempt");
        debug_assert!(size < MAX_ALLOC, "allocation exceeds 2 GB limit");
        let cost = cost.unwrap_or_else(|| self.allocation_cost());
        let asize = self.fence.adjust(pool, size);

        let mut p = None;
        if !self.should_regain_reserves(cost) {
            p = pool.alloc_raw(&self.arena, asize);
        }
        let base = match p {
            Some(p) => p,
            None => {
                let request = Requirement {
                    pool: Some(Arc::clone(pool)),
                    size: asize,
                    cost,
                };
                self.low_mem_alloc(&request, || pool.alloc_raw(&self.arena, asize))?
            }
        };
        pool.totals.on_alloc(asize);
        let user = self.fence.set(pool, base, asize);
        self.tags.add(user.as_ptr() as usize, size, pool.id(), class);
        tracing::trace!(
            pool = pool.pool_type().name(),
            size,
            class = ?class,
            ptr = user.as_ptr() as usize,
            "alloc"
        );
        Ok(user)
    }

    /// The slow path: synchronize, regain reserves, then loop between
    /// the allocation and the apportioner.
    pub(crate) fn low_mem_alloc(
        &self,
        request: &Requirement,
        mut alloc: impl FnMut() -> Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>> {
        if let Some(pool) = &request.pool {
            pool.totals.on_alloc_fail(pool.free_size());
        }
        tracing::trace!(
            size = request.size,
            tier = ?request.cost.tier,
            "allocation entered low-memory handling"
        );
        let nested = self.enter_low_mem_handling()?;
        let result = (|| {
            // Even if reserves were full before, another thread could
            // have taken some, so regain unconditionally.
            match self.regain_reserves_for_alloc(request.cost) {
                Ok(true) => {}
                Ok(false) => return Err(MmError::VmError), // deny, reserves intact
                Err(MmError::Interrupt) => return Err(MmError::Interrupt),
                Err(_) => return Err(MmError::VmError),
            }
            loop {
                if let Some(p) = alloc() {
                    return Ok(p);
                }
                match self.low_mem_handle_guts(std::slice::from_ref(request)) {
                    Ok(true) => continue,
                    Ok(false) => return Err(MmError::VmError),
                    Err(MmError::Interrupt) => return Err(MmError::Interrupt),
                    // A handler error surfaces as the caller's VM error.
                    Err(_) => return Err(MmError::VmError),
                }
            }
        })();
        self.exit_low_mem_handling(nested);
        result
    }

    /// Free an allocation made by [`alloc`](Self::alloc).
    pub fn free(&self, pool: &Arc<Pool>, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size != 0, "zero-sized free");
        if let Err(e) = self.fence.check(pool, ptr, size) {
            tracing::error!(error = %e, "fencepost check failed on free");
            debug_assert!(false, "fencepost corrupted on free");
        }
        let asize = self.fence.adjust(pool, size);
        let base = self.fence.below(pool, ptr);
        pool.free_raw(&self.arena, base, asize);
        self.tags.remove(ptr.as_ptr() as usize);
        pool.totals.on_free(asize);
        tracing::trace!(
            pool = pool.pool_type().name(),
            size,
            ptr = ptr.as_ptr() as usize,
            "free"
        );
        self.recheck_reserves();
    }

    /// Shrink an allocation in place, freeing the surplus.
    pub fn truncate(&self, pool: &Arc<Pool>, ptr: NonNull<u8>, old_size: usize, new_size: usize) {
        debug_assert!(old_size != 0 && new_size != 0, "zero-sized truncate");
        debug_assert!(new_size < old_size, "truncate must shrink");
        if let Err(e) = self.fence.check(pool, ptr, old_size) {
            tracing::error!(error = %e, "fencepost check failed on truncate");
            debug_assert!(false, "fencepost corrupted on truncate");
        }
        let aold = self.fence.adjust(pool, old_size);
        let anew = self.fence.adjust(pool, new_size);
        let base = self.fence.below(pool, ptr);
        if aold == anew {
            return;
        }
        // The backend works in alignment-rounded units; only whole
        // aligned tail chunks can be returned.
        let align = pool.alignment();
        let keep = backend::round_up(anew, align);
        let end = backend::round_up(aold, align);
        self.fence.truncate(pool, base, anew);
        if end > keep {
            let surplus = unsafe { NonNull::new_unchecked(base.as_ptr().add(keep)) };
            pool.free_raw(&self.arena, surplus, end - keep);
        }
        self.tags.truncate(ptr.as_ptr() as usize, new_size);
        pool.totals.on_truncate(aold - anew);
        tracing::trace!(
            pool = pool.pool_type().name(),
            old_size,
            new_size,
            "truncate"
        );
        self.recheck_reserves();
    }

    /// Drop every allocation in the pool at once.
    pub fn pool_clear(&self, pool: &Arc<Pool>) {
        if let Some(sac) = pool.sac.lock().as_mut() {
            sac.drain(); // blocks die with the rest of the pool
        }
        pool.clear_backend(&self.arena);
        self.tags.remove_pool(pool.id());
        pool.totals.clear_current();
        tracing::debug!(pool = pool.pool_type().name(), "pool cleared");
        self.recheck_reserves();
    }

    // == Pool lifecycle ==

    pub fn pool_create(&self, ty: PoolType) -> Result<Arc<Pool>> {
        self.registry.create(&self.arena, ty)
    }

    /// Destroy a pool: flush bookkeeping, unlink it, release its
    /// segments. The fixed pool must be destroyed last; `finish` takes
    /// care of the ordering.
    pub fn pool_destroy(&self, pool: &Arc<Pool>) {
        if let Err(e) = self.check_fenceposts() {
            tracing::error!(error = %e, "fencepost sweep failed in pool destroy");
            debug_assert!(false, "fencepost corrupted at pool destroy");
        }
        self.tags.remove_pool(pool.id());
        self.registry.unlink(pool);
        pool.clear_backend(&self.arena);
        tracing::debug!(pool = pool.pool_type().name(), id = %pool.id(), "pool destroyed");
        self.recheck_reserves();
    }

    /// Iterate over every active pool. `f` must not create or destroy
    /// pools.
    pub fn pool_walk(&self, f: impl FnMut(&Arc<Pool>) -> bool) -> bool {
        self.registry.walk(f)
    }

    /// Does the address lie within the pool?
    pub fn pool_check(&self, pool: &Arc<Pool>, addr: usize) -> bool {
        pool.has_addr(addr)
    }

    /// Aggregated pool usage, logged and returned.
    pub fn print_pool_usage(&self, title: &str) -> Vec<PoolUsage> {
        let usage = self.registry.usage();
        let total: usize = usage.iter().map(|u| u.size).sum();
        let free: usize = usage.iter().map(|u| u.free).sum();
        tracing::info!(
            title,
            total_bytes = total,
            free_bytes = free,
            available = self.no_pool_size(false),
            available_with_reserve = self.no_pool_size(true),
            "pool states"
        );
        for u in &usage {
            if u.size > 65536 {
                tracing::info!(pool = u.name, size = u.size, free = u.free, pools = u.pools);
            }
        }
        usage
    }

    // == SAC ==

    /// Attach a segregated allocation cache to a pool.
    pub fn sac_create(&self, pool: &Arc<Pool>, classes: &[SacClass]) -> Result<()> {
        debug_assert!(
            !classes.is_empty() && classes.len() <= SAC_CLASS_LIMIT,
            "SAC class count out of range"
        );
        debug_assert!(!pool.is_debug(), "SACs do not support debug pools");
        let mut guard = pool.sac.lock();
        if guard.is_some() {
            return Err(MmError::InvalidOperation("SAC already created".into()));
        }
        let adjusted: Vec<SacClass> = classes
            .iter()
            .map(|c| SacClass {
                block_size: self.fence.adjust(pool, c.block_size),
                cached_count: c.cached_count,
                frequency: c.frequency,
            })
            .collect();
        *guard = Some(Sac::new(&adjusted));
        Ok(())
    }

    /// Allocate through the pool's SAC.
    pub fn sac_alloc(&self, pool: &Arc<Pool>, size: usize, class: AllocClass) -> Result<NonNull<u8>> {
        debug_assert!(size != 0, "zero-sized allocation attempt");
        debug_assert!(size < MAX_ALLOC, "allocation exceeds 2 GB limit");
        debug_assert!(pool.sac.lock().is_some(), "sac missing");
        let asize = self.fence.adjust(pool, size);
        let try_alloc = || {
            let mut guard = pool.sac.lock();
            let sac = guard.as_mut()?;
            if let Some(p) = sac.take(asize) {
                return Some(p);
            }
            let bsize = sac.class_size(asize).unwrap_or(asize);
            drop(guard);
            pool.alloc_raw(&self.arena, bsize)
        };

        let cost = self.allocation_cost();
        let mut p = None;
        if !self.should_regain_reserves(cost) {
            p = try_alloc();
        }
        let base = match p {
            Some(p) => p,
            None => {
                let request = Requirement {
                    pool: Some(Arc::clone(pool)),
                    size: asize,
                    cost,
                };
                self.low_mem_alloc(&request, try_alloc)?
            }
        };
        pool.totals.on_sac_alloc(asize);
        let user = self.fence.set(pool, base, asize);
        self.tags.add(user.as_ptr() as usize, size, pool.id(), class);
        Ok(user)
    }

    /// Return a SAC allocation to the cache (or the pool if the class is
    /// full).
    pub fn sac_free(&self, pool: &Arc<Pool>, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size != 0, "zero-sized free");
        if let Err(e) = self.fence.check(pool, ptr, size) {
            tracing::error!(error = %e, "fencepost check failed on sac free");
            debug_assert!(false, "fencepost corrupted on sac free");
        }
        let asize = self.fence.adjust(pool, size);
        let base = self.fence.below(pool, ptr);
        {
            let mut guard = pool.sac.lock();
            let sac = guard.as_mut().expect("sac missing");
            let bsize = sac.class_size(asize).unwrap_or(asize);
            if let Some(overflow) = sac.put(base, asize) {
                pool.free_raw(&self.arena, overflow, bsize);
            }
        }
        self.tags.remove(ptr.as_ptr() as usize);
        pool.totals.on_sac_free(asize);
        self.recheck_reserves();
    }

    /// Return every cached block to the pool.
    pub fn sac_flush(&self, pool: &Arc<Pool>) {
        let drained = {
            let mut guard = pool.sac.lock();
            match guard.as_mut() {
                Some(sac) => sac.drain(),
                None => return,
            }
        };
        for (ptr, bsize) in drained {
            pool.free_raw(&self.arena, ptr, bsize);
        }
        self.recheck_reserves();
    }

    pub fn sac_destroy(&self, pool: &Arc<Pool>) {
        self.sac_flush(pool);
        *pool.sac.lock() = None;
    }

    pub fn sac_present(&self, pool: &Arc<Pool>) -> bool {
        pool.sac.lock().is_some()
    }

    // == Multiple allocation ==

    /// Allocate `out.len()` blocks of `size` bytes, all or nothing.
    pub fn alloc_multi_homo(
        &self,
        pool: &Arc<Pool>,
        size: usize,
        class: AllocClass,
        out: &mut [Option<NonNull<u8>>],
    ) -> Result<()> {
        for i in 0..out.len() {
            match self.alloc(pool, size, class) {
                Ok(p) => out[i] = Some(p),
                Err(e) => {
                    for block in out[..i].iter_mut() {
                        if let Some(p) = block.take() {
                            self.free(pool, p, size);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Allocate blocks of assorted sizes, all or nothing.
    pub fn alloc_multi_hetero(
        &self,
        pool: &Arc<Pool>,
        sizes: &[usize],
        classes: &[AllocClass],
        out: &mut [Option<NonNull<u8>>],
    ) -> Result<()> {
        debug_assert!(sizes.len() == out.len() && classes.len() == out.len());
        for i in 0..out.len() {
            match self.alloc(pool, sizes[i], classes[i]) {
                Ok(p) => out[i] = Some(p),
                Err(e) => {
                    for j in 0..i {
                        if let Some(p) = out[j].take() {
                            self.free(pool, p, sizes[j]);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    // == DL promises ==

    /// Reserve a promise: `size` bytes from which sequential
    /// sub-allocations will all succeed. One promise per pool.
    pub fn dl_promise(&self, pool: &Arc<Pool>, size: usize) -> Result<()> {
        debug_assert!(pool.pool_type() == PoolType::Dl, "promise on non-DL pool");
        debug_assert!(size != 0, "zero-sized promise");
        debug_assert!(!pool.promise.lock().is_active(), "promise already made");
        let size = backend::round_up(size, PROMISE_ALIGN);
        let ptr = self.alloc(pool, size, AllocClass::Promise)?;
        pool.promise.lock().begin(ptr.as_ptr() as usize, size);
        Ok(())
    }

    /// The next sub-allocation out of the promise, or `None` when it is
    /// exhausted.
    pub fn dl_promise_next(&self, pool: &Arc<Pool>, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size != 0, "zero-sized promise request");
        let addr = pool.promise.lock().next_block(size)?;
        NonNull::new(addr as *mut u8)
    }

    /// Give back the tail of what has been handed out.
    pub fn dl_promise_shrink(&self, pool: &Arc<Pool>, bytes: usize) {
        debug_assert!(bytes != 0, "zero-sized promise shrink");
        pool.promise.lock().shrink(bytes);
    }

    /// End the promise, freeing the unused remainder. Returns the final
    /// size of the promise.
    pub fn dl_promise_end(&self, pool: &Arc<Pool>) -> usize {
        let (action, new_size) = pool.promise.lock().end();
        match action {
            PromiseEnd::FreeWhole { base, size } => {
                let ptr = NonNull::new(base as *mut u8).expect("null promise base");
                self.free(pool, ptr, size);
            }
            PromiseEnd::Truncate { base, old_size, new_size } => {
                if old_size != new_size {
                    let ptr = NonNull::new(base as *mut u8).expect("null promise base");
                    self.truncate(pool, ptr, old_size, new_size);
                }
            }
        }
        new_size
    }

    /// Abandon whatever part of the promise is still owned. May also be
    /// called after a promise was ended, freeing the used part.
    pub fn dl_promise_free(&self, pool: &Arc<Pool>) {
        let freed = pool.promise.lock().free();
        if let Some((addr, len)) = freed {
            if len > 0 {
                let ptr = NonNull::new(addr as *mut u8).expect("null promise base");
                self.free(pool, ptr, len);
            }
        }
    }

    // == Debug sweeps ==

    /// Verify every live allocation's fenceposts.
    pub fn check_fenceposts(&self) -> Result<()> {
        if !self.tags.enabled() {
            return Ok(());
        }
        let pools = self.registry.pools();
        let mut failure = None;
        self.tags.apply(|t| {
            if failure.is_some() {
                return;
            }
            if let Some(pool) = pools.iter().find(|p| p.id() == t.pool) {
                if let Some(ptr) = NonNull::new(t.ptr as *mut u8) {
                    if let Err(e) = self.fence.check(pool, ptr, t.size) {
                        failure = Some(e);
                    }
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Everything still tagged as live, largest first.
    pub fn report_leaks(&self) -> tag::LeakReport {
        self.tags.report_leaks()
    }
}

// # Reserves and Commit Extensions
//
// The manager holds a small graduated reserve carved out of the arena:
// a table of blocks, each with a cost. While the reserve is full the
// system is healthy; spending a reserve block frees its memory back to
// the arena for allocations that are allowed to pay that block's cost.
// The last entry is the final reserve, priced at or above normal
// allocation cost, so ordinary allocations never consume it.
//
// Above the reserve sit two commit-limit extensions: the arena extension
// (partial-paint tier) and the use-all extension (trash-VM tier). Raising
// the commit limit is a low-memory action like any other, delivered
// through handlers; the limit moves up in at-least-`delta` steps so that
// cheaper handlers get retried between extensions. Shrinking walks back
// down, use-all strictly before the arena extension.
//
// `memory_is_low` is an opportunistic hint read without synchronization;
// all other state here lives under one lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{RawBlock, SEGMENT_ALIGN};
use crate::cost::{Cost, Tier, COST_BELOW_RESERVES, COST_NONE, COST_NORMAL};
use crate::error::Result;
use crate::lowmem::{with_context, LowMemHandler, OfferPart, Requirement};
use crate::manager::MemoryManager;

/// Block granularity of the reserve, matching other pools.
pub const RESERVE_BLOCK: usize = 64 * 1024;

pub const MAX_RESERVE_LEVELS: usize = 3;

/// Spare commit kept to smooth segment churn.
pub(crate) const SPARE_COMMIT: usize = 4 * 64 * 1024;

#[derive(Debug)]
pub(crate) struct ReserveEntry {
    pub size: usize,
    pub cost: Cost,
    pub block: Option<RawBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtensionKind {
    Arena,
    UseAll,
}

#[derive(Debug)]
pub(crate) struct CommitExtension {
    pub base: usize,
    pub limit: usize,
    /// Minimum size of each extension step, so other low-mem actions are
    /// tried before the next step.
    pub delta: usize,
    pub cost: Cost,
    pub reported: bool,
}

impl CommitExtension {
    fn inactive() -> CommitExtension {
        CommitExtension { base: 0, limit: 0, delta: 0, cost: COST_NONE, reported: false }
    }
}

pub(crate) struct ReserveInner {
    pub levels: [ReserveEntry; MAX_RESERVE_LEVELS],
    pub numlevels: usize,
    /// Number of spent slots; held blocks are `[level, numlevels)`.
    /// 0 means the reserve is full.
    pub level: usize,
    pub commit_base: usize,
    pub arena_ext: CommitExtension,
    pub use_all: CommitExtension,
}

pub(crate) struct ReserveState {
    pub inner: Mutex<ReserveInner>,
    pub memory_is_low: AtomicBool,
}

impl ReserveState {
    pub fn new() -> ReserveState {
        ReserveState {
            inner: Mutex::new(ReserveInner {
                levels: [
                    ReserveEntry {
                        size: 8 * RESERVE_BLOCK,
                        cost: Cost::new(Tier::ReservePool, 1.0),
                        block: None,
                    },
                    ReserveEntry {
                        size: 4 * RESERVE_BLOCK,
                        cost: Cost::new(Tier::ReservePool, 1.0),
                        block: None,
                    },
                    ReserveEntry {
                        size: 8 * RESERVE_BLOCK,
                        cost: Cost::new(Tier::ReservePool, 1e3),
                        block: None,
                    },
                ],
                numlevels: MAX_RESERVE_LEVELS,
                level: MAX_RESERVE_LEVELS, // no reserve held yet
                commit_base: 0,
                arena_ext: CommitExtension::inactive(),
                use_all: CommitExtension::inactive(),
            }),
            memory_is_low: AtomicBool::new(false),
        }
    }
}

impl ReserveInner {
    /// Size of the held reserve, not counting the final reserve.
    fn held_size(&self) -> usize {
        let top = self.numlevels.saturating_sub(1);
        self.levels[self.level.min(top)..top].iter().map(|l| l.size).sum()
    }
}

impl MemoryManager {
    /// Is the RIP in a low-memory state? Effectively unsynchronized, but
    /// that's often good enough.
    pub fn memory_is_low(&self) -> bool {
        self.reserves.memory_is_low.load(Ordering::Relaxed)
    }

    pub(crate) fn set_memory_is_low(&self, low: bool) {
        self.reserves.memory_is_low.store(low, Ordering::Relaxed);
    }

    /// Current reserve level: the number of spent slots (0 = full).
    pub fn reserve_level(&self) -> usize {
        self.reserves.inner.lock().level
    }

    /// Spend reserve blocks cheaper than `limit`, dropping each into the
    /// arena. Idempotent: a second call with the same limit frees
    /// nothing further. Returns the number of bytes released.
    pub fn reserve_get(&self, limit: Cost) -> usize {
        let mut inner = self.reserves.inner.lock();
        let mut released = 0;
        while inner.level < inner.numlevels && inner.levels[inner.level].cost.less_than(limit) {
            let level = inner.level;
            let size = inner.levels[level].size;
            if let Some(block) = inner.levels[level].block.take() {
                self.arena.release(block, size, SEGMENT_ALIGN);
                released += size;
                tracing::debug!(level, size, "reserve block released");
            }
            inner.level += 1;
            self.set_memory_is_low(true);
        }
        if inner.level == 0 && self.arena.commit_limit() == inner.commit_base {
            self.set_memory_is_low(false);
        }
        released
    }

    /// Refill the reserve while `fill_limit` is below the cost of the
    /// next empty slot. True if the target fill line was reached.
    pub(crate) fn reserve_refill(&self, fill_limit: Cost) -> bool {
        let mut inner = self.reserves.inner.lock();
        while inner.level > 0 && fill_limit.less_than(inner.levels[inner.level - 1].cost) {
            let level = inner.level - 1;
            let size = inner.levels[level].size;
            match self.arena.grant(size, SEGMENT_ALIGN) {
                Ok(block) => {
                    inner.levels[level].block = Some(block);
                    inner.level = level;
                    tracing::debug!(level, size, "reserve block regained");
                }
                Err(_) => return false,
            }
        }
        if inner.level == 0 && self.arena.commit_limit() == inner.commit_base {
            self.set_memory_is_low(false);
        }
        true
    }

    /// Reduce the commit limit within one extension, down to its base,
    /// but only if the cost limit permits touching this extension at
    /// all. Returns false if committed memory blocks the shrink.
    fn shrink_extension(&self, inner: &mut ReserveInner, kind: ExtensionKind, cost_limit: Cost) -> bool {
        let (base, limit, delta, cost) = {
            let ext = match kind {
                ExtensionKind::Arena => &inner.arena_ext,
                ExtensionKind::UseAll => &inner.use_all,
            };
            (ext.base, ext.limit, ext.delta, ext.cost)
        };
        if !cost_limit.less_than(cost) {
            return true;
        }
        let mut curr = self.arena.commit_limit();
        debug_assert!(curr <= limit, "shrinking using the wrong extension");
        let start = curr;
        let mut enough = true;
        while curr > base {
            let trylimit = curr.saturating_sub(delta).max(base);
            if self.arena.try_set_commit_limit(trylimit).is_err() {
                enough = false; // still holding too much memory
                break;
            }
            curr = trylimit;
        }
        if curr != start {
            tracing::debug!(commit_limit = curr, "commit limit shrunk");
            if curr == inner.commit_base && inner.level == 0 {
                self.set_memory_is_low(false);
            }
        }
        enough
    }

    /// Refill the reserve pool down to `fill_limit`, using only
    /// low-memory actions below `cost`. Must be called inside low-memory
    /// synchronization. Ok(false) means the fill line was not reached.
    fn regain_reserve_pool(&self, fill_limit: Cost, cost: Cost) -> Result<bool> {
        loop {
            if self.reserve_refill(fill_limit) {
                return Ok(true);
            }
            let request = {
                let inner = self.reserves.inner.lock();
                let entry = &inner.levels[inner.level - 1];
                Requirement {
                    pool: None,
                    size: entry.size,
                    cost: entry.cost.min(cost),
                }
            };
            if !self.low_mem_handle_guts(std::slice::from_ref(&request))? {
                return Ok(false); // didn't get it
            }
        }
    }

    /// Shrink the commit extensions down to `fill_limit`, using only
    /// low-memory actions below `cost`. Must be called inside low-memory
    /// synchronization.
    fn regain_extensions(&self, fill_limit: Cost, cost: Cost) -> Result<bool> {
        loop {
            let request = {
                let mut inner = self.reserves.inner.lock();
                if inner.arena_ext.base >= self.arena.commit_limit() {
                    return Ok(true); // common case: no extension in use
                }
                // The ladder: use-all must give way before the arena
                // extension becomes eligible.
                let failing = if self.shrink_extension(&mut inner, ExtensionKind::UseAll, fill_limit) {
                    if self.shrink_extension(&mut inner, ExtensionKind::Arena, fill_limit) {
                        return Ok(true);
                    }
                    ExtensionKind::Arena
                } else {
                    ExtensionKind::UseAll
                };
                let ext = match failing {
                    ExtensionKind::Arena => &inner.arena_ext,
                    ExtensionKind::UseAll => &inner.use_all,
                };
                Requirement {
                    pool: None,
                    size: self.arena.commit_limit() - ext.base,
                    cost: ext.cost.min(cost),
                }
            };
            if !self.low_mem_handle_guts(std::slice::from_ref(&request))? {
                return Ok(false);
            }
        }
    }

    pub(crate) fn regain_reserves_guts(&self, fill_limit: Cost, cost: Cost) -> Result<bool> {
        if !self.regain_reserve_pool(fill_limit, cost)? {
            return Ok(false);
        }
        self.regain_extensions(fill_limit, cost)
    }

    /// Regain reserves before an allocation at `cost`. The cost doubles
    /// as the fill line: tiers the allocation is entitled to invade are
    /// not refilled first. Must be inside low-memory synchronization.
    pub(crate) fn regain_reserves_for_alloc(&self, cost: Cost) -> Result<bool> {
        self.regain_reserves_guts(cost, cost)
    }

    /// Regain reserves to the fill level set in the thread context, at
    /// the given cost. Returns whether enough was regained.
    pub fn regain_reserves(&self, cost: Cost) -> Result<bool> {
        let nested = self.enter_low_mem_handling()?;
        let fill = with_context(|ctx| ctx.reserve_fill);
        let res = self.regain_reserves_guts(fill, cost);
        self.exit_low_mem_handling(nested);
        res
    }

    /// Adjust the calling thread's reserve fill target: keep them full,
    /// or use everything but the final reserve.
    pub fn set_reserves(&self, full: bool) {
        with_context(|ctx| {
            ctx.reserve_fill = if full { COST_BELOW_RESERVES } else { COST_NORMAL }
        });
    }

    /// Are the reserves (pool and commit ladder) in use above the cost
    /// given? The fast pre-allocation gate.
    pub fn should_regain_reserves(&self, limit: Cost) -> bool {
        // Not synchronized: regain doesn't have to be timely.
        if !self.memory_is_low() {
            return false;
        }
        let inner = self.reserves.inner.lock();
        let commit_limit = self.arena.commit_limit();
        if commit_limit > inner.arena_ext.base {
            let cost = if commit_limit <= inner.arena_ext.limit {
                inner.arena_ext.cost
            } else {
                inner.use_all.cost
            };
            if limit.less_than(cost) {
                return true;
            }
        }
        inner.level > 0 && limit.less_than(inner.levels[inner.level - 1].cost)
    }

    /// Opportunistic refill after memory has been returned: no handler
    /// invocations, no synchronization beyond the reserve lock.
    pub fn recheck_reserves(&self) {
        {
            // Quick unsynchronized test; avoiding work is the point.
            let inner = self.reserves.inner.lock();
            if inner.level == 0 && self.arena.commit_limit() <= inner.arena_ext.base {
                return;
            }
        }
        if self.reserve_refill(COST_BELOW_RESERVES) {
            let mut inner = self.reserves.inner.lock();
            if self.arena.commit_limit() > inner.arena_ext.base {
                let _ = self.shrink_extension(&mut inner, ExtensionKind::UseAll, COST_BELOW_RESERVES)
                    && self.shrink_extension(&mut inner, ExtensionKind::Arena, COST_BELOW_RESERVES);
            }
        }
    }

    // == Initialisation ==

    /// Create the reserve: fill it and register its handler.
    pub(crate) fn reserve_create(&self) -> Result<()> {
        debug_assert!(
            {
                let inner = self.reserves.inner.lock();
                let held = &inner.levels[..inner.numlevels - 1];
                held.iter().all(|l| l.cost.less_than(COST_NORMAL))
                    && !inner.levels[inner.numlevels - 1].cost.less_than(COST_NORMAL)
            },
            "normal cost must cover all but the final reserve"
        );
        if !self.reserve_refill(COST_BELOW_RESERVES) {
            return Err(crate::error::MmError::InitFailed(
                "could not fill initial reserve".into(),
            ));
        }
        let id = self.register_low_mem_handler(Arc::new(ReservePoolHandler));
        self.builtin_handlers.lock().push(id);
        Ok(())
    }

    /// Release the reserve and deregister its handler (shutdown path;
    /// the handler itself is deregistered with the rest of the builtins).
    pub(crate) fn reserve_destroy(&self) {
        let mut inner = self.reserves.inner.lock();
        for level in inner.level..inner.numlevels {
            let size = inner.levels[level].size;
            if let Some(block) = inner.levels[level].block.take() {
                self.arena.release(block, size, SEGMENT_ALIGN);
            }
        }
        inner.level = 0; // don't try to regain
        inner.numlevels = 0;
    }

    /// Configure the commit ladder and set the working commit limit.
    pub(crate) fn extension_init(
        &self,
        addr_space_size: usize,
        working_size: usize,
        extension_size: usize,
        use_all_mem: bool,
    ) -> Result<()> {
        let extended_commit_limit = working_size.saturating_add(extension_size);
        if addr_space_size < extended_commit_limit {
            return Err(crate::error::MmError::InitFailed(
                "address space smaller than working size plus extension".into(),
            ));
        }
        {
            let mut inner = self.reserves.inner.lock();
            inner.commit_base = working_size;

            // Always init, so it all works when the extension is
            // configured off.
            inner.arena_ext = CommitExtension {
                base: working_size,
                limit: working_size,
                delta: 0,
                cost: COST_NONE,
                reported: false,
            };
            if extension_size > 0 {
                inner.arena_ext.limit = extended_commit_limit;
                inner.arena_ext.delta = 256 * 1024;
                inner.arena_ext.cost = Cost::new(Tier::PartialPaint, 0.1);
                debug_assert!(inner.arena_ext.cost.less_than(COST_NORMAL));
                debug_assert!(COST_BELOW_RESERVES.less_than(inner.arena_ext.cost));
            }

            inner.use_all = CommitExtension {
                base: inner.arena_ext.limit,
                limit: inner.arena_ext.limit,
                delta: 0,
                cost: COST_NONE,
                reported: false,
            };
            if use_all_mem && addr_space_size > inner.arena_ext.limit {
                inner.use_all.limit = addr_space_size;
                inner.use_all.delta = 256 * 1024;
                // Trash-VM tier: only allocations whose cost reaches that
                // tier may extend this far.
                inner.use_all.cost = Cost::new(Tier::TrashVm, 1.0);
                debug_assert!(COST_BELOW_RESERVES.less_than(inner.use_all.cost));
            }
        }

        {
            let inner = self.reserves.inner.lock();
            if inner.arena_ext.base != inner.arena_ext.limit {
                let id = self.register_low_mem_handler(Arc::new(CommitExtensionHandler {
                    kind: ExtensionKind::Arena,
                }));
                self.builtin_handlers.lock().push(id);
            }
            if inner.use_all.base != inner.use_all.limit {
                let id = self.register_low_mem_handler(Arc::new(CommitExtensionHandler {
                    kind: ExtensionKind::UseAll,
                }));
                self.builtin_handlers.lock().push(id);
            }
        }

        self.arena
            .try_set_commit_limit(working_size)
            .map_err(|_| crate::error::MmError::InitFailed("cannot set working commit limit".into()))?;
        // Hang onto a few spare segments; some pools alloc and free
        // segments repeatedly.
        self.arena.set_spare_commit_limit(SPARE_COMMIT);
        Ok(())
    }

    /// Stop regaining the commit ladder (shutdown path).
    pub(crate) fn extension_finish(&self) {
        let mut inner = self.reserves.inner.lock();
        inner.use_all.limit = inner.use_all.base;
        inner.arena_ext.limit = inner.arena_ext.base;
    }

    // == Memory queries ==

    /// How many bytes are managed by the memory manager?
    pub fn total_size(&self) -> usize {
        self.reserves.inner.lock().use_all.limit
    }

    /// The working size: what the RIP can grow to without paging.
    pub fn working_size(&self) -> usize {
        self.reserves.inner.lock().arena_ext.base
    }

    /// How many bytes are not assigned to any pool? The reserve may be
    /// reused when memory runs low, so it counts as unassigned when
    /// `include_reserve` is set.
    pub fn no_pool_size(&self, include_reserve: bool) -> usize {
        // Not synchronized because accuracy is not required.
        let mut size = self.total_size().saturating_sub(self.arena.committed());
        if include_reserve {
            size += self.reserves.inner.lock().held_size();
        }
        size + self.arena.spare_committed()
    }
}

/// The reserve pool low-memory handler.
pub(crate) struct ReservePoolHandler;

impl LowMemHandler for ReservePoolHandler {
    fn name(&self) -> &'static str {
        "Reserve pool use"
    }

    fn tier(&self) -> Tier {
        Tier::ReservePool
    }

    fn multi_thread_safe(&self) -> bool {
        true
    }

    fn solicit(&self, mm: &MemoryManager, _requests: &[Requirement]) -> Option<Vec<OfferPart>> {
        let inner = mm.reserves.inner.lock();
        if inner.level == inner.numlevels {
            return None;
        }
        let entry = &inner.levels[inner.level];
        Some(vec![OfferPart::new(None, entry.size, entry.cost.value)])
    }

    fn release(&self, mm: &MemoryManager, _offer: &mut [OfferPart]) -> Result<()> {
        // The level is re-read under the lock: another thread may have
        // surrendered this level since the offer, in which case this
        // thread surrenders the next one.
        let mut inner = mm.reserves.inner.lock();
        if inner.level == inner.numlevels {
            return Ok(());
        }
        let level = inner.level;
        let size = inner.levels[level].size;
        if let Some(block) = inner.levels[level].block.take() {
            mm.arena.release(block, size, SEGMENT_ALIGN);
            tracing::debug!(level, size, "reserve block released to arena");
        }
        inner.level += 1;
        mm.set_memory_is_low(true);
        Ok(())
    }
}

/// The commit-limit extension low-memory handlers (one per extension).
pub(crate) struct CommitExtensionHandler {
    pub kind: ExtensionKind,
}

impl LowMemHandler for CommitExtensionHandler {
    fn name(&self) -> &'static str {
        match self.kind {
            ExtensionKind::Arena => "Extension to arena reserve",
            ExtensionKind::UseAll => "Extension to use all VM",
        }
    }

    fn tier(&self) -> Tier {
        match self.kind {
            ExtensionKind::Arena => Tier::PartialPaint,
            ExtensionKind::UseAll => Tier::TrashVm,
        }
    }

    fn multi_thread_safe(&self) -> bool {
        true
    }

    fn solicit(&self, mm: &MemoryManager, _requests: &[Requirement]) -> Option<Vec<OfferPart>> {
        let inner = mm.reserves.inner.lock();
        let ext = match self.kind {
            ExtensionKind::Arena => &inner.arena_ext,
            ExtensionKind::UseAll => &inner.use_all,
        };
        let commit_limit = mm.arena.commit_limit();
        if commit_limit >= ext.limit {
            return None;
        }
        Some(vec![OfferPart::new(None, ext.limit - commit_limit, ext.cost.value)])
    }

    fn release(&self, mm: &MemoryManager, offer: &mut [OfferPart]) -> Result<()> {
        let mut inner = mm.reserves.inner.lock();
        let commit_limit = mm.arena.commit_limit();
        let (limit, report_use_all) = {
            let ext = match self.kind {
                ExtensionKind::Arena => &inner.arena_ext,
                ExtensionKind::UseAll => &inner.use_all,
            };
            debug_assert!(commit_limit < ext.limit, "commit limit raised unexpectedly");
            let taken = offer.first().map_or(0, |part| part.taken_size);
            let limit = (commit_limit + taken.max(ext.delta)).min(ext.limit);
            (limit, limit > inner.arena_ext.limit)
        };
        mm.arena
            .try_set_commit_limit(limit)
            .map_err(|e| crate::error::MmError::HandlerError(e.to_string()))?;
        mm.set_memory_is_low(true);
        tracing::debug!(commit_limit = limit, "commit limit extended");
        let reported = if report_use_all {
            &mut inner.use_all.reported
        } else {
            &mut inner.arena_ext.reported
        };
        if !*reported {
            if report_use_all {
                tracing::warn!("using all available memory");
            }
            *reported = true;
        }
        Ok(())
    }
}

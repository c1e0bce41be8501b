// # Deferred Allocation
//
// A deferred allocation gathers memory requests from several callers and
// realizes them in one transaction: either every minimum block in every
// request is allocated, or none are. Realization merges the requests
// into a requirements array by (pool, cost), tries to allocate
// everything, and runs the apportioner over whatever is still
// unsatisfied until it all fits or handlers run dry.
//
// Invariant: a realize that returns failure leaves every block pointer
// in every request `None`.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::alloc::AllocClass;
use crate::cost::Cost;
use crate::error::{MmError, Result};
use crate::lowmem::Requirement;
use crate::manager::MemoryManager;
use crate::pool::Pool;

/// One memory request inside a deferred allocation.
pub struct MemoryRequest {
    pub pool: Arc<Pool>,
    /// Size of each block, in bytes.
    pub size: usize,
    /// Blocks that must be allocated for realize to succeed.
    pub min_count: usize,
    /// Blocks to allocate if memory allows. Flexible requests are not
    /// implemented yet: must equal `min_count`.
    pub max_count: usize,
    pub cost: Cost,
    pub class: AllocClass,
    /// Filled in by realize; `blocks.len() == max_count`.
    pub blocks: Vec<Option<NonNull<u8>>>,
}

impl MemoryRequest {
    pub fn new(pool: &Arc<Pool>, size: usize, count: usize, cost: Cost, class: AllocClass) -> Self {
        MemoryRequest {
            pool: Arc::clone(pool),
            size,
            min_count: count,
            max_count: count,
            cost,
            class,
            blocks: vec![None; count],
        }
    }

    fn check(&self) {
        debug_assert!(self.size > 0, "zero-sized request");
        debug_assert!(self.max_count > 0, "vacuous request for no blocks");
        debug_assert!(self.min_count <= self.max_count, "inconsistent min and max counts");
        debug_assert!(self.blocks.len() == self.max_count, "block slots out of step");
    }
}

/// A transaction of memory requests.
pub struct DeferredAlloc {
    requests: Vec<MemoryRequest>,
    requirements: Vec<Requirement>,
}

impl DeferredAlloc {
    pub fn new() -> DeferredAlloc {
        DeferredAlloc {
            requests: Vec::new(),
            requirements: Vec::new(),
        }
    }

    /// Add a request to the transaction.
    pub fn add(&mut self, request: MemoryRequest) {
        request.check();
        debug_assert!(
            request.min_count == request.max_count,
            "flexible requests not implemented yet"
        );
        debug_assert!(
            request.blocks.iter().all(|b| b.is_none()),
            "block pointer not cleared"
        );
        self.requests.push(request);
    }

    pub fn requests(&self) -> &[MemoryRequest] {
        &self.requests
    }

    pub fn requests_mut(&mut self) -> &mut [MemoryRequest] {
        &mut self.requests
    }

    /// Merge the requests into requirements, one per (pool, cost).
    fn collect_requirements(&mut self, mm: &MemoryManager, cost_for_min: Cost) {
        self.requirements.clear();
        for request in &self.requests {
            let adjusted = mm.fence.adjust(&request.pool, request.size);
            let total = adjusted * request.min_count;
            match self.requirements.iter_mut().find(|r| {
                r.pool
                    .as_ref()
                    .map_or(false, |p| Arc::ptr_eq(p, &request.pool))
                    && r.cost == cost_for_min
            }) {
                Some(r) => r.size += total,
                None => self.requirements.push(Requirement {
                    pool: Some(Arc::clone(&request.pool)),
                    size: total,
                    cost: cost_for_min,
                }),
            }
        }
    }

    /// The requirement slot for a request, among the still-unsatisfied
    /// prefix.
    fn requirement_slot(&self, pool: &Arc<Pool>, cost: Cost, used: usize) -> usize {
        let slot = self.requirements[..used].iter().position(|r| {
            r.pool.as_ref().map_or(false, |p| Arc::ptr_eq(p, pool)) && r.cost == cost
        });
        debug_assert!(slot.is_some(), "didn't find the requirements");
        slot.unwrap_or(0)
    }
}

impl Default for DeferredAlloc {
    fn default() -> Self {
        DeferredAlloc::new()
    }
}

impl MemoryManager {
    /// Attempt one pass over every unallocated block. Returns success;
    /// `unsatisfied` tracks requirements still outstanding.
    fn deferred_try(
        &self,
        dalloc: &mut DeferredAlloc,
        max_cost: Cost,
        unsatisfied: &mut usize,
    ) -> bool {
        let mut success = true;
        for ri in 0..dalloc.requests.len() {
            let (pool, size, max_count, class) = {
                let r = &dalloc.requests[ri];
                (Arc::clone(&r.pool), r.size, r.max_count, r.class)
            };
            let adjusted = self.fence.adjust(&pool, size);
            let mut slot = None;
            for bi in 0..max_count {
                if dalloc.requests[ri].blocks[bi].is_some() {
                    continue;
                }
                let slot =
                    *slot.get_or_insert_with(|| dalloc.requirement_slot(&pool, max_cost, *unsatisfied));
                match pool.alloc_raw(&self.arena, adjusted) {
                    Some(base) => {
                        dalloc.requirements[slot].size =
                            dalloc.requirements[slot].size.saturating_sub(adjusted);
                        if dalloc.requirements[slot].size == 0 && *unsatisfied > 0 {
                            // Satisfied: swap the last live one into its place.
                            *unsatisfied -= 1;
                            dalloc.requirements.swap(slot, *unsatisfied);
                        }
                        pool.totals.on_alloc(adjusted);
                        let user = self.fence.set(&pool, base, adjusted);
                        self.tags.add(user.as_ptr() as usize, size, pool.id(), class);
                        dalloc.requests[ri].blocks[bi] = Some(user);
                    }
                    None => success = false,
                }
            }
        }
        debug_assert!(!success || *unsatisfied == 0, "miscounted requirements");
        success
    }

    /// Undo an aborted transaction, deallocating everything it got.
    fn deferred_untry(&self, dalloc: &mut DeferredAlloc) {
        for request in &mut dalloc.requests {
            let pool = Arc::clone(&request.pool);
            let size = request.size;
            for block in request.blocks.iter_mut() {
                if let Some(ptr) = block.take() {
                    self.free(&pool, ptr, size);
                }
            }
        }
    }

    /// Realize a deferred allocation: satisfy every minimum block in
    /// every request, or roll everything back.
    pub fn deferred_alloc_realize(
        &self,
        dalloc: &mut DeferredAlloc,
        cost_for_min: Cost,
    ) -> Result<()> {
        debug_assert!(cost_for_min.is_valid(), "invalid cost");
        for request in &dalloc.requests {
            request.check();
        }
        dalloc.collect_requirements(self, cost_for_min);
        let mut unsatisfied = dalloc.requirements.len();

        let mut success = false;
        if !self.should_regain_reserves(cost_for_min) {
            success = self.deferred_try(dalloc, cost_for_min, &mut unsatisfied);
        }
        if !success {
            // Like the single-allocation slow path, but with multiple
            // requirements.
            let nested = match self.enter_low_mem_handling() {
                Ok(nested) => nested,
                Err(e) => {
                    // Interrupted while waiting: roll back whatever the
                    // first pass managed.
                    self.deferred_untry(dalloc);
                    return Err(e);
                }
            };
            let result: Result<bool> = (|| {
                if !self.regain_reserves_for_alloc(cost_for_min)? {
                    return Ok(false); // deny alloc
                }
                loop {
                    if self.deferred_try(dalloc, cost_for_min, &mut unsatisfied) {
                        return Ok(true);
                    }
                    let reqs: Vec<Requirement> = dalloc.requirements[..unsatisfied].to_vec();
                    if !self.low_mem_handle_guts(&reqs)? {
                        return Ok(false);
                    }
                }
            })();
            self.exit_low_mem_handling(nested);
            match result {
                Ok(ok) => success = ok,
                Err(e) => {
                    self.deferred_untry(dalloc);
                    return Err(if e == MmError::Interrupt { e } else { MmError::VmError });
                }
            }
        }
        if !success {
            self.deferred_untry(dalloc);
            return Err(MmError::VmError);
        }
        Ok(())
    }
}

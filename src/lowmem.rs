// # Low-memory Apportioner
//
// When an allocation cannot be satisfied, the apportioner solicits every
// registered low-memory handler for offers of memory it could give up,
// picks the offer with the lowest average cost per byte, invokes its
// release method, and tells the caller whether a retry is worthwhile.
//
// Only one thread at a time handles low memory. Nested entry by the same
// thread is permitted and is a no-op. Handlers are never re-entered while
// running, so they need no internal synchronization against themselves.
//
// Solicit methods must be quick, must not allocate, and must not call back
// into this interface. Release methods may allocate, but only at a cost
// strictly below their own tier, and must never recurse into low-memory
// handling.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::arena::SEGMENT_SIZE;
use crate::cost::{Cost, Tier, COST_BELOW_RESERVES, COST_NORMAL, TIER_COUNT};
use crate::error::{MmError, Result};
use crate::manager::MemoryManager;
use crate::pool::Pool;

/// Upper bound on the per-tier handler cache.
pub const MAX_CACHED_HANDLERS: usize = 60;

/// Limit at which repeated handler invocations start being reported.
const TOO_MANY_INVOKES: u32 = 1000;

/// A memory requirement handed to the apportioner.
#[derive(Clone)]
pub struct Requirement {
    /// The pool the memory is needed in, or `None` for unknown.
    pub pool: Option<Arc<Pool>>,
    /// The amount of memory required, in bytes.
    pub size: usize,
    /// Cost of not acquiring the memory, per byte.
    pub cost: Cost,
}

/// One part of a handler's offer to release memory.
///
/// `offer_size` may be an estimate; the apportioner fills in `taken_size`
/// before invoking the release method. The cost covers the effort to free
/// the memory and to restore the purged data should that become necessary.
#[derive(Clone)]
pub struct OfferPart {
    /// The pool the memory would be released from, if known.
    pub pool: Option<Arc<Pool>>,
    pub offer_size: usize,
    pub offer_cost: f32,
    pub taken_size: usize,
}

impl OfferPart {
    pub fn new(pool: Option<Arc<Pool>>, offer_size: usize, offer_cost: f32) -> OfferPart {
        OfferPart { pool, offer_size, offer_cost, taken_size: 0 }
    }
}

/// A registered low-memory handler.
pub trait LowMemHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn tier(&self) -> Tier;

    /// May the handler run while other worker threads are active?
    fn multi_thread_safe(&self) -> bool {
        false
    }

    /// Offer memory for the given requirements, or `None`.
    fn solicit(&self, mm: &MemoryManager, requests: &[Requirement]) -> Option<Vec<OfferPart>>;

    /// Release the taken parts of an offer. Failing to free anything is
    /// permitted (the apportioner retries the allocation to find out),
    /// but an error aborts the whole handling loop. Release methods must
    /// not report `VmError`.
    fn release(&self, mm: &MemoryManager, offer: &mut [OfferPart]) -> Result<()>;
}

/// Identifies a registration for deregistering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

pub(crate) struct Registration {
    pub handler: Arc<dyn LowMemHandler>,
    pub id: HandlerId,
    pub running: AtomicBool,
}

/// Hook used to constrain all other worker threads to a single-thread
/// section while a non-thread-safe handler runs. Owned by the RIP
/// runtime; without a hook installed the runtime is taken to be
/// effectively single-threaded and the constraint is always granted.
pub trait ThreadConstraint: Send + Sync {
    /// Try to constrain to a single thread; true on success.
    fn constrain(&self) -> bool;
    fn unconstrain(&self);
}

/// Per-thread allocation state.
#[derive(Clone, Copy)]
pub(crate) struct MmContext {
    pub default_cost: Cost,
    pub reserve_fill: Cost,
    pub handling_low_memory: bool,
    pub low_mem_unsafe: bool,
}

impl Default for MmContext {
    fn default() -> Self {
        MmContext {
            default_cost: COST_NORMAL,
            reserve_fill: COST_BELOW_RESERVES,
            handling_low_memory: false,
            low_mem_unsafe: false,
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<MmContext> = RefCell::new(MmContext::default());
}

pub(crate) fn with_context<R>(f: impl FnOnce(&mut MmContext) -> R) -> R {
    CONTEXT.with(|c| f(&mut c.borrow_mut()))
}

/// Apportioner synchronization and the handler registry.
pub(crate) struct LowMemState {
    handling: Mutex<bool>,
    condvar: Condvar,
    tiers: RwLock<[Vec<Arc<Registration>>; TIER_COUNT]>,
    next_id: AtomicU64,
    cache_warned: AtomicBool,
    trace_forced: AtomicBool,
}

impl LowMemState {
    pub fn new() -> LowMemState {
        LowMemState {
            handling: Mutex::new(false),
            condvar: Condvar::new(),
            tiers: RwLock::new(std::array::from_fn(|_| Vec::new())),
            next_id: AtomicU64::new(1),
            cache_warned: AtomicBool::new(false),
            trace_forced: AtomicBool::new(false),
        }
    }

    pub fn register(&self, handler: Arc<dyn LowMemHandler>) -> HandlerId {
        let tier = handler.tier();
        debug_assert!(tier < Tier::Limit, "invalid handler tier");
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let reg = Arc::new(Registration {
            handler,
            id,
            running: AtomicBool::new(false),
        });
        self.tiers.write()[tier as usize].push(reg);
        id
    }

    pub fn remove(&self, id: HandlerId) {
        let mut tiers = self.tiers.write();
        for tier in tiers.iter_mut() {
            tier.retain(|r| r.id != id);
        }
    }

    /// Snapshot of the handlers at a tier, in registration order.
    fn snapshot(&self, tier: Tier) -> Vec<Arc<Registration>> {
        let tiers = self.tiers.read();
        let entries = &tiers[tier as usize];
        if entries.len() > MAX_CACHED_HANDLERS && !self.cache_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("low-mem handler cache size exceeded");
        }
        entries.clone()
    }
}

pub(crate) fn at_least_a_segment(pool: Option<&Arc<Pool>>, size: usize) -> usize {
    size.max(pool.map_or(SEGMENT_SIZE, |p| p.segment_size()))
}

/// Take parts of an offer to satisfy one requirement. Returns what is
/// still needed.
fn satisfy_from_offer(
    request: &Requirement,
    requested: usize,
    only_same_pool: bool,
    offer: &mut [OfferPart],
    offer_tier: Tier,
) -> usize {
    debug_assert!(offer_tier <= request.cost.tier, "offer tier too high");
    let mut needed = requested;
    for part in offer.iter_mut() {
        // Offers that match the request's cost must be rejected, lest the
        // system try to move memory from a resource to itself.
        if offer_tier < request.cost.tier
            || (offer_tier == request.cost.tier && part.offer_cost < request.cost.value)
        {
            let avail = part.offer_size.saturating_sub(part.taken_size);
            let same_pool = match (&part.pool, &request.pool) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            };
            if avail > 0 && (!only_same_pool || same_pool) {
                let taken = if only_same_pool {
                    avail.min(needed)
                } else {
                    at_least_a_segment(part.pool.as_ref(), avail.min(needed)).min(avail)
                };
                part.taken_size += taken;
                if needed <= taken {
                    return 0;
                }
                needed -= taken;
            }
        }
    }
    needed
}

/// Decide what to take from an offer; returns (total cost, total size).
fn evaluate_offer(
    requests: &[Requirement],
    offer: &mut [OfferPart],
    offer_tier: Tier,
) -> (f32, usize) {
    for part in offer.iter_mut() {
        debug_assert!(part.offer_cost > 0.0, "negative offer");
        part.taken_size = 0;
    }
    for request in requests {
        // Try to get from the same pool, the rest from any pool.
        let needed = satisfy_from_offer(request, request.size, true, offer, offer_tier);
        if needed > 0 {
            let _ = satisfy_from_offer(
                request,
                at_least_a_segment(request.pool.as_ref(), needed),
                false,
                offer,
                offer_tier,
            );
        }
    }
    let mut total_cost = 0.0f32;
    let mut total_size = 0usize;
    for part in offer.iter() {
        debug_assert!(part.offer_size > 0, "zero offer");
        if part.taken_size > 0 {
            total_cost += part.offer_cost * part.taken_size as f32;
            total_size += part.taken_size;
        }
    }
    (total_cost, total_size)
}

impl MemoryManager {
    /// Set the calling thread's default allocation cost.
    pub fn set_allocation_cost(&self, cost: Cost) {
        debug_assert!(cost.is_valid(), "invalid cost");
        with_context(|ctx| ctx.default_cost = cost);
    }

    pub fn allocation_cost(&self) -> Cost {
        with_context(|ctx| ctx.default_cost)
    }

    /// Is the calling thread inside low-memory handling?
    pub fn handling_low_memory(&self) -> bool {
        with_context(|ctx| ctx.handling_low_memory)
    }

    /// Raise the cooperative interrupt observed by threads waiting to
    /// handle low memory.
    pub fn set_interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Release);
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Install the runtime hook for single-thread sections.
    pub fn set_thread_constraint(&self, constraint: Box<dyn ThreadConstraint>) {
        *self.constraint.write() = Some(constraint);
    }

    fn constrain_to_single(&self) -> bool {
        self.constraint.read().as_ref().map_or(true, |c| c.constrain())
    }

    fn unconstrain_to_single(&self) {
        if let Some(c) = self.constraint.read().as_ref() {
            c.unconstrain();
        }
    }

    /// Serialize for low-memory handling. Returns whether this was a
    /// nested entry by the same thread.
    pub(crate) fn enter_low_mem_handling(&self) -> Result<bool> {
        if with_context(|ctx| ctx.handling_low_memory) {
            return Ok(true);
        }
        let mut handling = self.lowmem.handling.lock();
        while *handling {
            self.lowmem
                .condvar
                .wait_for(&mut handling, Duration::from_millis(10));
            if self.interrupted() {
                return Err(MmError::Interrupt);
            }
        }
        // Only one thread at a time gets past this point.
        *handling = true;
        with_context(|ctx| ctx.handling_low_memory = true);
        Ok(false)
    }

    pub(crate) fn exit_low_mem_handling(&self, nested: bool) {
        if nested {
            return;
        }
        let mut handling = self.lowmem.handling.lock();
        debug_assert!(*handling, "exiting low-memory handling while not handling");
        *handling = false;
        with_context(|ctx| ctx.handling_low_memory = false);
        self.lowmem.condvar.notify_one();
    }

    /// Register a low-memory handler.
    pub fn register_low_mem_handler(&self, handler: Arc<dyn LowMemHandler>) -> HandlerId {
        self.lowmem.register(handler)
    }

    /// Deregister a handler. Waits for the handler if it is in use by
    /// another thread.
    pub fn deregister_low_mem_handler(&self, id: HandlerId) {
        debug_assert!(
            !with_context(|ctx| ctx.low_mem_unsafe),
            "solicit method attempting deregistration"
        );
        // If interrupted, retry; the contract cannot be broken.
        let nested = loop {
            match self.enter_low_mem_handling() {
                Ok(nested) => break nested,
                Err(_) => continue,
            }
        };
        self.lowmem.remove(id);
        self.exit_low_mem_handling(nested);
    }

    /// Try to release enough free memory for the given requirements.
    ///
    /// Returns whether the caller should retry its allocation. An error
    /// from a handler (or an interrupt while waiting) propagates.
    pub fn low_mem_handle(&self, requests: &[Requirement]) -> Result<bool> {
        debug_assert!(!requests.is_empty(), "no requests");
        let nested = self.enter_low_mem_handling()?;
        let res = self.low_mem_handle_guts(requests);
        self.exit_low_mem_handling(nested);
        res
    }

    /// The handling loop proper. Must be called inside low-memory
    /// synchronization.
    pub(crate) fn low_mem_handle_guts(&self, requests: &[Requirement]) -> Result<bool> {
        debug_assert!(!requests.is_empty(), "no requests");
        debug_assert!(
            !with_context(|ctx| ctx.low_mem_unsafe),
            "improper low-mem recursion"
        );

        let mut max_cost = Cost::new(Tier::Min, f32::MIN_POSITIVE);
        for r in requests {
            max_cost = max_cost.max(r.cost);
        }

        let mut tier = Tier::Min;
        let mut invoked_some_handler = false;
        let mut single_thread_locked = false;
        let mut retry = false;
        let mut invokes: u32 = 0;
        let result = loop {
            invokes += 1;
            if invokes == TOO_MANY_INVOKES {
                // Diagnostic only; handling continues.
                tracing::error!("too many low-memory handlers invoked");
                self.lowmem.trace_forced.store(true, Ordering::Relaxed);
            }

            let mut best: Option<(Arc<Registration>, Vec<OfferPart>)> = None;
            let mut lowest_average = f32::MAX;

            with_context(|ctx| ctx.low_mem_unsafe = true);
            for reg in self.lowmem.snapshot(tier) {
                if reg.running.load(Ordering::Acquire) {
                    continue;
                }
                if !single_thread_locked && !reg.handler.multi_thread_safe() {
                    single_thread_locked = self.constrain_to_single();
                }
                if !single_thread_locked && !reg.handler.multi_thread_safe() {
                    continue; // could not ensure thread safety
                }
                if let Some(mut offer) = reg.handler.solicit(self, requests) {
                    let (total_cost, total_size) = evaluate_offer(requests, &mut offer, tier);
                    if total_size > 0 && total_cost / (total_size as f32) < lowest_average {
                        lowest_average = total_cost / total_size as f32;
                        best = Some((reg, offer));
                    }
                }
            }
            with_context(|ctx| ctx.low_mem_unsafe = false);

            match best {
                Some((reg, mut offer)) => {
                    if single_thread_locked && reg.handler.multi_thread_safe() {
                        // This handler doesn't need the constraint.
                        self.unconstrain_to_single();
                        single_thread_locked = false;
                    }
                    invoked_some_handler = true;
                    let release_result =
                        self.invoke_release(&reg, &mut offer, max_cost, lowest_average);
                    match release_result {
                        Ok(()) => {
                            if self.estimate_enough(requests) {
                                retry = true;
                                break Ok(());
                            }
                            // Not enough yet: solicit again at this tier.
                        }
                        Err(e) => {
                            tracing::warn!(
                                handler = reg.handler.name(),
                                error = %e,
                                "error in low-memory handler"
                            );
                            debug_assert!(
                                e != MmError::VmError,
                                "a low-memory handler returned a VM error"
                            );
                            break Err(e);
                        }
                    }
                }
                None => {
                    // No decent offers at this tier.
                    tier = tier.next();
                }
            }
            if self.interrupted() {
                break Err(MmError::Interrupt);
            }
            if tier > max_cost.tier {
                break Ok(());
            }
        };
        if single_thread_locked {
            self.unconstrain_to_single();
        }
        if tier > max_cost.tier && invoked_some_handler {
            // Failed to release enough, but one last try may still work.
            tracing::trace!("lowmem.final_retry");
            retry = true;
        }
        result.map(|()| retry)
    }

    fn invoke_release(
        &self,
        reg: &Registration,
        offer: &mut [OfferPart],
        max_cost: Cost,
        average_cost: f32,
    ) -> Result<()> {
        if self.lowmem.trace_forced.load(Ordering::Relaxed) {
            tracing::info!(
                handler = reg.handler.name(),
                tier = ?reg.handler.tier(),
                average_cost,
                "invoking low-memory handler"
            );
        } else {
            tracing::debug!(
                handler = reg.handler.name(),
                tier = ?reg.handler.tier(),
                average_cost,
                "invoking low-memory handler"
            );
        }
        let saved_cost = with_context(|ctx| {
            let saved = ctx.default_cost;
            ctx.default_cost = max_cost;
            saved
        });
        reg.running.store(true, Ordering::Release);
        let res = reg.handler.release(self, offer);
        reg.running.store(false, Ordering::Release);
        with_context(|ctx| ctx.default_cost = saved_cost);
        tracing::debug!(
            handler = reg.handler.name(),
            ok = res.is_ok(),
            "low-memory handler done"
        );
        res
    }

    /// Estimate whether free memory now suffices for all requirements,
    /// crediting per-pool free space first, then the arena.
    fn estimate_enough(&self, requests: &[Requirement]) -> bool {
        let mut free_in_arena = self
            .arena
            .commit_limit()
            .saturating_sub(self.arena.committed());
        for r in requests {
            let need_from_arena = match &r.pool {
                Some(pool) => {
                    let free_in_pool = pool.free_size();
                    if free_in_pool < r.size {
                        (r.size - free_in_pool).max(pool.segment_size())
                    } else {
                        0
                    }
                }
                None => r.size.max(SEGMENT_SIZE),
            };
            if need_from_arena > free_in_arena {
                return false;
            }
            free_in_arena -= need_from_arena;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(size: usize, cost: Cost) -> Requirement {
        Requirement { pool: None, size, cost }
    }

    #[test]
    fn evaluate_offer_takes_cheapest_first_fit() {
        let requests = [req(1000, Cost::new(Tier::Disk, 10.0))];
        let mut offer = vec![
            OfferPart::new(None, 500, 1.0),
            OfferPart::new(None, 100_000, 2.0),
        ];
        let (cost, size) = evaluate_offer(&requests, &mut offer, Tier::Ram);
        // Pool-less requests are rounded up to a segment.
        assert!(size >= 1000);
        assert!(cost > 0.0);
        assert_eq!(offer[0].taken_size, 500);
        assert!(offer[1].taken_size > 0);
    }

    #[test]
    fn same_tier_offer_must_be_cheaper_than_request() {
        let requests = [req(100, Cost::new(Tier::Disk, 1.0))];
        let mut offer = vec![OfferPart::new(None, 1000, 5.0)];
        let (_, size) = evaluate_offer(&requests, &mut offer, Tier::Disk);
        assert_eq!(size, 0, "offer at same tier but higher value must be rejected");

        let mut offer = vec![OfferPart::new(None, 1000, 0.5)];
        let (_, size) = evaluate_offer(&requests, &mut offer, Tier::Disk);
        assert!(size > 0);
    }

    #[test]
    fn context_defaults() {
        with_context(|ctx| {
            *ctx = MmContext::default();
        });
        with_context(|ctx| {
            assert_eq!(ctx.default_cost, COST_NORMAL);
            assert_eq!(ctx.reserve_fill, COST_BELOW_RESERVES);
            assert!(!ctx.handling_low_memory);
        });
    }
}

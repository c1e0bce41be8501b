// # PostScript VM
//
// Four pools hold PostScript virtual memory: object/string pools for
// local and global VM, and typed pools (exact and weak allocation
// points) for each. Every allocation lands at the pool's current save
// level; restore frees everything above the target level at once.
//
// Collection is mark-and-sweep over root sets registered by the
// interpreter. Finalization is delivered as a post-GC queue drained
// inside `garbage_collect`, so GC's low-memory release method never
// recurses into the low-memory system.
//
// GC is also exposed as three low-memory handlers (RAM, disk and
// trash-VM tiers) whose offer cost falls as un-collected allocation
// piles up.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use crate::cost::Tier;
use crate::error::{MmError, Result};
use crate::lowmem::{HandlerId, LowMemHandler, OfferPart, Requirement};
use crate::manager::MemoryManager;
use crate::pool::backend::ApKind;
use crate::pool::{Pool, PoolClass, PoolType};

pub const MIN_SAVE_LEVEL: usize = 0;
pub const MAX_SAVE_LEVELS: usize = 31;
pub const SAVE_LEVEL_INC: usize = 2;
/// Global VM supports save levels `0..=MAX_GLOBAL_SAVE_LEVEL + 1`.
pub const MAX_GLOBAL_SAVE_LEVEL: usize = 1;

/// Alignment (and size) of a PS object slot.
pub const PS_ALIGNMENT: usize = 16;
pub const PS_TYPED_ALIGNMENT: usize = 8;

// Slot flag bits in a PS object's mark byte.
pub const SLOT_PSVM: u8 = 0x20;
pub const SLOT_LOCAL: u8 = 0x10;
pub const SLOT_GLOBAL_MODE: u8 = 0x04;

// Object tag bits: a literal null object.
pub const TAG_NULL: u8 = 0x01;
pub const TAG_LITERAL: u8 = 0x80;

/// Not enough has changed in VM since the last GC to be worth another.
const GC_HYSTERESIS_THRESHOLD: usize = 100_000;

/// Disk tier to RAM tier conversion: speed ratio is about 1e6, but RAM
/// 1.0 means about 100 memory accesses to rebuild the data.
const DISK_TO_RAM: f64 = 1e6 / 100.0;

/// Disk tier 1.0 is one write plus one read; VM extension will trash
/// several times over.
const EXTENSION_TO_DISK: f64 = 10.0;

/// A root set the interpreter exposes to the collector.
pub trait RootSet: Send + Sync {
    /// Report every reference the root set holds.
    fn scan(&self, mark: &mut dyn FnMut(usize));
}

type Finalizer = Box<dyn Fn(NonNull<u8>) + Send + Sync>;

/// The PS VM state: the four pools and the GC machinery.
pub struct PsVm {
    pool_local: Arc<Pool>,
    pool_global: Arc<Pool>,
    pool_typed_local: Arc<Pool>,
    pool_typed_global: Arc<Pool>,

    save_level: AtomicUsize,
    lowest_save_level_since_gc: AtomicUsize,
    alloc_since_gc: AtomicU64,
    allocs_since_gc: Mutex<[usize; MAX_SAVE_LEVELS + 1]>,

    gc_threshold: Mutex<f64>,
    gc_alert: Mutex<Option<Arc<AtomicBool>>>,
    /// Automatic GC control: -2 none, -1 global only, 0 local and global.
    gc_mode: AtomicI32,
    /// Counter: > 0 means GC is unsafe right now.
    gc_safety_level: AtomicI32,
    between_operators: AtomicBool,
    gc_count: AtomicU64,

    roots: RwLock<Vec<Arc<dyn RootSet>>>,
    finalizer: RwLock<Option<Finalizer>>,
    finalization: SegQueue<usize>,
    /// A collection is a suspension point for its invoker but is
    /// internally single-threaded.
    gc_lock: Mutex<()>,

    handler_ids: Vec<HandlerId>,
}

impl PsVm {
    pub(crate) fn start(mm: &MemoryManager) -> Result<PsVm> {
        let pool_global =
            mm.registry
                .create_vm(&mm.arena, PoolType::PsVm, MAX_GLOBAL_SAVE_LEVEL + 1)?;
        let pool_local = mm
            .registry
            .create_vm(&mm.arena, PoolType::PsVm, MAX_SAVE_LEVELS)?;
        let pool_typed_global =
            mm.registry
                .create_vm(&mm.arena, PoolType::PsVmFn, MAX_GLOBAL_SAVE_LEVEL + 1)?;
        let pool_typed_local =
            mm.registry
                .create_vm(&mm.arena, PoolType::PsVmFn, MAX_SAVE_LEVELS)?;

        let mut handler_ids = Vec::new();
        for tier in [Tier::Ram, Tier::Disk, Tier::TrashVm] {
            handler_ids.push(mm.register_low_mem_handler(Arc::new(GcHandler { tier })));
        }

        Ok(PsVm {
            pool_local,
            pool_global,
            pool_typed_local,
            pool_typed_global,
            save_level: AtomicUsize::new(MIN_SAVE_LEVEL),
            lowest_save_level_since_gc: AtomicUsize::new(MIN_SAVE_LEVEL),
            alloc_since_gc: AtomicU64::new(0),
            allocs_since_gc: Mutex::new([0; MAX_SAVE_LEVELS + 1]),
            gc_threshold: Mutex::new(f64::MAX),
            gc_alert: Mutex::new(None),
            gc_mode: AtomicI32::new(-2),
            gc_safety_level: AtomicI32::new(0),
            between_operators: AtomicBool::new(true),
            gc_count: AtomicU64::new(0),
            roots: RwLock::new(Vec::new()),
            finalizer: RwLock::new(None),
            finalization: SegQueue::new(),
            gc_lock: Mutex::new(()),
            handler_ids,
        })
    }

    pub(crate) fn finish(self, mm: &MemoryManager) {
        for id in &self.handler_ids {
            mm.lowmem.remove(*id);
        }
        mm.pool_destroy(&self.pool_typed_local);
        mm.pool_destroy(&self.pool_typed_global);
        mm.pool_destroy(&self.pool_local);
        mm.pool_destroy(&self.pool_global);
    }

    fn pools(&self) -> [&Arc<Pool>; 4] {
        [
            &self.pool_global,
            &self.pool_typed_global,
            &self.pool_local,
            &self.pool_typed_local,
        ]
    }

    fn total_vm_size(&self) -> usize {
        self.pools().iter().map(|p| p.alloced_size()).sum()
    }

    fn new_alloc_since_gc(&self) -> usize {
        let level = self.save_level.load(Ordering::Relaxed);
        self.allocs_since_gc.lock()[..=level].iter().sum()
    }

    fn note_alloc(&self, pool: &Arc<Pool>, size: usize) {
        self.alloc_since_gc.fetch_add(size as u64, Ordering::Relaxed);
        let level = pool.save_level();
        self.allocs_since_gc.lock()[level] += size;
        let threshold = *self.gc_threshold.lock();
        if self.alloc_since_gc.load(Ordering::Relaxed) as f64 > threshold {
            if let Some(alert) = self.gc_alert.lock().as_ref() {
                alert.store(true, Ordering::Release);
            }
        }
    }
}

/// The layout of one PS object slot as the MM sees it.
#[repr(C)]
struct ObjectSlot {
    mark: u8,
    tags: u8,
    len: u16,
    pad: u32,
    value: u64,
}

/// Initialise every object slot as a literal null PS object, flagged
/// local or global per the pool.
fn init_object_slots(ptr: NonNull<u8>, size: usize, global: bool) {
    debug_assert!(size % PS_ALIGNMENT == 0, "odd-sized object allocation");
    let mark = SLOT_PSVM | SLOT_LOCAL | if global { SLOT_GLOBAL_MODE } else { 0 };
    let mut slot = ptr.as_ptr() as *mut ObjectSlot;
    let end = unsafe { ptr.as_ptr().add(size) } as *mut ObjectSlot;
    while slot < end {
        unsafe {
            (*slot).mark = mark;
            (*slot).tags = TAG_NULL | TAG_LITERAL;
            (*slot).len = 0;
            (*slot).pad = 0;
            (*slot).value = 0;
            slot = slot.add(1);
        }
    }
}

impl MemoryManager {
    pub fn pool_ps_local(&self) -> &Arc<Pool> {
        &self.ps().pool_local
    }

    pub fn pool_ps_global(&self) -> &Arc<Pool> {
        &self.ps().pool_global
    }

    pub fn pool_ps_typed_local(&self) -> &Arc<Pool> {
        &self.ps().pool_typed_local
    }

    pub fn pool_ps_typed_global(&self) -> &Arc<Pool> {
        &self.ps().pool_typed_global
    }

    fn ps_alloc(
        &self,
        pool: &Arc<Pool>,
        size: usize,
        ap: ApKind,
        align: usize,
    ) -> Result<NonNull<u8>> {
        debug_assert!(size != 0, "zero-sized PS allocation");
        let size = crate::pool::backend::round_up(size, align);
        let cost = self.allocation_cost();

        let mut p = None;
        if !self.memory_is_low() || !self.should_regain_reserves(cost) {
            p = pool.with_vm(|vm| vm.alloc(&self.arena, size, ap, false));
        }
        let p = match p {
            Some(p) => p,
            None => {
                let request = Requirement {
                    pool: Some(Arc::clone(pool)),
                    size,
                    cost,
                };
                self.low_mem_alloc(&request, || {
                    pool.with_vm(|vm| vm.alloc(&self.arena, size, ap, false))
                })?
            }
        };
        self.ps().note_alloc(pool, size);
        pool.totals.on_alloc(size);
        tracing::trace!(
            pool = pool.pool_type().name(),
            size,
            ap = ?ap,
            "PS alloc"
        );
        Ok(p)
    }

    /// Allocate PS object slots. Every slot is initialised as a literal
    /// null at the current save level.
    pub fn ps_alloc_obj(&self, pool: &Arc<Pool>, size: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            matches!(pool.class(), PoolClass::Epvm | PoolClass::EpvmDebug),
            "wrong class of pool"
        );
        debug_assert!(size % PS_ALIGNMENT == 0, "odd-sized object allocation");
        let p = self.ps_alloc(pool, size, ApKind::Obj, PS_ALIGNMENT)?;
        init_object_slots(p, size, Arc::ptr_eq(pool, &self.ps().pool_global));
        Ok(p)
    }

    /// Allocate PS string storage.
    pub fn ps_alloc_string(&self, pool: &Arc<Pool>, size: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            matches!(pool.class(), PoolClass::Epvm | PoolClass::EpvmDebug),
            "wrong class of pool"
        );
        self.ps_alloc(pool, size, ApKind::Str, PS_ALIGNMENT)
    }

    /// Allocate an exactly-scanned typed structure.
    pub fn ps_alloc_typed(&self, pool: &Arc<Pool>, size: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            matches!(pool.class(), PoolClass::Epfn | PoolClass::EpfnDebug),
            "wrong class of pool"
        );
        self.ps_alloc(pool, size, ApKind::Exact, PS_TYPED_ALIGNMENT)
    }

    /// Allocate a weakly-referenced typed structure.
    pub fn ps_alloc_weak(&self, pool: &Arc<Pool>, size: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            matches!(pool.class(), PoolClass::Epfn | PoolClass::EpfnDebug),
            "wrong class of pool"
        );
        self.ps_alloc(pool, size, ApKind::Weak, PS_TYPED_ALIGNMENT)
    }

    /// Request finalization of a typed PS VM allocation: when it dies in
    /// a collection, it is passed to the object finalizer before its
    /// storage is reclaimed.
    pub fn ps_finalize(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        self.ps()
            .pools()
            .iter()
            .any(|pool| pool.with_vm(|vm| vm.set_finalizable(addr)))
    }

    /// Perform a PS save. `new_level` is the save level after the save.
    pub fn ps_save(&self, new_level: usize) {
        let ps = self.ps();
        debug_assert!(
            new_level > MIN_SAVE_LEVEL && new_level <= MAX_SAVE_LEVELS,
            "bad save level"
        );
        debug_assert!(
            new_level == ps.save_level.load(Ordering::Relaxed) + 1,
            "save level out of step"
        );
        ps.pool_local.with_vm(|vm| vm.save());
        ps.pool_typed_local.with_vm(|vm| vm.save());
        if new_level <= MAX_GLOBAL_SAVE_LEVEL + 1 {
            ps.pool_global.with_vm(|vm| vm.save());
            ps.pool_typed_global.with_vm(|vm| vm.save());
        }
        ps.save_level.store(new_level, Ordering::Relaxed);
        tracing::trace!(level = new_level, "PS save");
    }

    /// Restore to `level`, freeing all PS VM allocated above it.
    pub fn ps_restore(&self, level: usize) {
        let ps = self.ps();
        let old_level = ps.save_level.load(Ordering::Relaxed);
        debug_assert!(level < MAX_SAVE_LEVELS, "bad save level");
        debug_assert!(level < old_level, "restore to current or higher level");

        ps.pool_local.with_vm(|vm| vm.restore(&self.arena, level));
        ps.pool_local.totals.update_current(ps.pool_local.size());
        ps.pool_typed_local.with_vm(|vm| vm.restore(&self.arena, level));
        ps.pool_typed_local
            .totals
            .update_current(ps.pool_typed_local.size());
        if level <= MAX_GLOBAL_SAVE_LEVEL {
            ps.pool_global.with_vm(|vm| vm.restore(&self.arena, level));
            ps.pool_global.totals.update_current(ps.pool_global.size());
            ps.pool_typed_global.with_vm(|vm| vm.restore(&self.arena, level));
            ps.pool_typed_global
                .totals
                .update_current(ps.pool_typed_global.size());
        }

        {
            let mut counters = ps.allocs_since_gc.lock();
            for counter in &mut counters[level + 1..=old_level] {
                *counter = 0;
            }
        }
        ps.save_level.store(level, Ordering::Relaxed);
        ps.lowest_save_level_since_gc
            .fetch_min(level, Ordering::Relaxed);
        tracing::trace!(level, "PS restore");
        self.recheck_reserves();
    }

    /// Check that `ptr` does not point into PS VM allocated at a save
    /// level higher than `level`. Pointers outside PS VM pass.
    pub fn ps_check(&self, level: usize, ptr: Option<NonNull<u8>>) -> Result<()> {
        debug_assert!(level <= MAX_SAVE_LEVELS, "bad save level");
        let addr = match ptr {
            Some(p) => p.as_ptr() as usize,
            None => return Ok(()),
        };
        for pool in self.ps().pools() {
            if let Some(found) = pool.with_vm(|vm| vm.level_of(addr)) {
                if found > level {
                    return Err(MmError::SaveLevelViolation { level });
                }
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn ps_save_level(&self) -> usize {
        self.ps().save_level.load(Ordering::Relaxed)
    }

    /// The lowest save level seen since the last collection; restores
    /// below it make older generations collectable.
    pub fn lowest_save_level_since_gc(&self) -> usize {
        self.ps().lowest_save_level_since_gc.load(Ordering::Relaxed)
    }

    /// Total PS VM allocation since the last collection, in bytes.
    pub fn alloc_since_gc(&self) -> u64 {
        self.ps().alloc_since_gc.load(Ordering::Relaxed)
    }

    // == GC controls ==

    /// Set the GC threshold (or nearest reasonable value) and the alert
    /// flag to raise when it is exceeded. -1.0 means no threshold. If
    /// the threshold has already been reached, the flag is set
    /// immediately. Returns the threshold in effect.
    pub fn set_gc_threshold(&self, threshold: f64, alert: Arc<AtomicBool>) -> f64 {
        let ps = self.ps();
        let lower_limit = self.arena.commit_limit() as f64 / 4.0;
        let effective = if threshold == -1.0 {
            f64::MAX
        } else {
            threshold.max(lower_limit)
        };
        *ps.gc_threshold.lock() = effective;
        if ps.alloc_since_gc.load(Ordering::Relaxed) as f64 > effective {
            alert.store(true, Ordering::Release);
        }
        *ps.gc_alert.lock() = Some(alert);
        effective
    }

    pub fn gc_threshold_exceeded(&self) -> bool {
        let ps = self.ps();
        ps.alloc_since_gc.load(Ordering::Relaxed) as f64 > *ps.gc_threshold.lock()
    }

    /// Automatic GC control: -2 none, -1 global only, 0 local and global.
    pub fn set_gc_mode(&self, mode: i32) {
        self.ps().gc_mode.store(mode, Ordering::Relaxed);
    }

    pub fn gc_mode(&self) -> i32 {
        self.ps().gc_mode.load(Ordering::Relaxed)
    }

    /// Notify that the current operator has been checked safe for GC.
    pub fn gc_safe_in_this_operator(&self) {
        self.ps().gc_safety_level.fetch_sub(1, Ordering::Relaxed);
    }

    /// Notify that the following code has not been verified safe for GC.
    pub fn gc_unsafe_from_here_on(&self) {
        self.ps().gc_safety_level.fetch_add(1, Ordering::Relaxed);
    }

    /// Tell the GC whether the interpreter is between operators (the
    /// only time automatic collection may run).
    pub fn set_between_operators(&self, between: bool) {
        self.ps().between_operators.store(between, Ordering::Relaxed);
    }

    pub fn gc_count(&self) -> u64 {
        self.ps().gc_count.load(Ordering::Relaxed)
    }

    /// Register a root set scanned during collection.
    pub fn register_gc_root(&self, root: Arc<dyn RootSet>) {
        self.ps().roots.write().push(root);
    }

    /// Install the object finalizer invoked for dead finalizable
    /// allocations.
    pub fn set_object_finalizer(&self, f: impl Fn(NonNull<u8>) + Send + Sync + 'static) {
        *self.ps().finalizer.write() = Some(Box::new(f));
    }

    /// A forced PS VM garbage collection. The caller picks which of
    /// local and global VM to collect.
    pub fn garbage_collect(&self, do_local: bool, do_global: bool) -> Result<()> {
        debug_assert!(do_local || do_global, "vacuous garbage collection");
        let ps = self.ps();
        let _gc = ps.gc_lock.lock();
        ps.gc_count.fetch_add(1, Ordering::Relaxed);
        let size_before = ps.total_vm_size();

        let mut collected: Vec<&Arc<Pool>> = Vec::new();
        if do_local {
            collected.push(&ps.pool_local);
            collected.push(&ps.pool_typed_local);
        }
        if do_global {
            collected.push(&ps.pool_global);
            collected.push(&ps.pool_typed_global);
        }

        // Mark from every registered root.
        let mut refs = Vec::new();
        for root in ps.roots.read().iter() {
            root.scan(&mut |addr| refs.push(addr));
        }
        for addr in refs {
            for pool in &collected {
                if pool.with_vm(|vm| vm.mark(addr)) {
                    break;
                }
            }
        }

        // Sweep; dead finalizable blocks queue their finalization.
        for pool in &collected {
            let (_, finalizable) = pool.with_vm(|vm| vm.sweep(&self.arena));
            for ptr in finalizable {
                ps.finalization.push(ptr.as_ptr() as usize);
            }
            pool.totals.update_current(pool.size());
        }
        self.recheck_reserves();

        // Run all pending finalizations now; they must precede the next
        // collection.
        {
            let finalizer = ps.finalizer.read();
            while let Some(addr) = ps.finalization.pop() {
                if let (Some(f), Some(ptr)) = (finalizer.as_ref(), NonNull::new(addr as *mut u8)) {
                    f(ptr);
                }
            }
        }

        tracing::debug!(
            local = do_local,
            global = do_global,
            reclaimed = size_before.saturating_sub(ps.total_vm_size()),
            "garbage collection"
        );
        ps.alloc_since_gc.store(0, Ordering::Relaxed);
        let level = ps.save_level.load(Ordering::Relaxed);
        {
            let mut counters = ps.allocs_since_gc.lock();
            for counter in &mut counters[..=level] {
                *counter = 0;
            }
        }
        ps.lowest_save_level_since_gc.store(level, Ordering::Relaxed);
        Ok(())
    }
}

/// The GC low-memory handler; one registration per tier.
struct GcHandler {
    tier: Tier,
}

impl LowMemHandler for GcHandler {
    fn name(&self) -> &'static str {
        match self.tier {
            Tier::Ram => "Garbage collection (RAM)",
            Tier::Disk => "Garbage collection (disk)",
            _ => "Garbage collection (trash VM)",
        }
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn multi_thread_safe(&self) -> bool {
        false
    }

    fn solicit(&self, mm: &MemoryManager, _requests: &[Requirement]) -> Option<Vec<OfferPart>> {
        let ps = mm.ps();
        if !ps.between_operators.load(Ordering::Relaxed)
            || ps.gc_safety_level.load(Ordering::Relaxed) > 0
            || ps.gc_mode.load(Ordering::Relaxed) <= -2
        {
            return None;
        }
        let alloc_since_gc = ps.alloc_since_gc.load(Ordering::Relaxed) as usize;
        if alloc_since_gc < GC_HYSTERESIS_THRESHOLD {
            return None;
        }
        let new_alloc = ps.new_alloc_since_gc();
        if new_alloc == 0 {
            return None;
        }
        let total_vm = ps.total_vm_size();
        // Collection cost scales with total VM; the reclaim mostly comes
        // from allocation since the last GC, plus pointer mutation slowly
        // creating reclaimable data.
        let cost_ratio =
            1e1 * total_vm as f64 / (new_alloc as f64 + 1e-4 * alloc_since_gc as f64);
        let offer_cost = match self.tier {
            Tier::Ram => {
                if cost_ratio > DISK_TO_RAM {
                    return None;
                }
                cost_ratio
            }
            Tier::Disk => {
                let cost = cost_ratio / DISK_TO_RAM;
                if cost > EXTENSION_TO_DISK {
                    return None;
                }
                cost
            }
            // Only really matters if partial paint is blocked; no limit,
            // so this is always tried before giving up.
            _ => cost_ratio / (DISK_TO_RAM * EXTENSION_TO_DISK),
        };
        Some(vec![OfferPart::new(None, new_alloc, offer_cost as f32)])
    }

    fn release(&self, mm: &MemoryManager, _offer: &mut [OfferPart]) -> Result<()> {
        mm.garbage_collect(mm.gc_mode() != -1, true)
    }
}

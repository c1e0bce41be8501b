// End-to-end scenarios for the memory manager: reserve and commit-ladder
// behaviour under pressure, deferred allocation transactions, PS VM
// save/restore and collection, promises, and the debug sweeps.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rip_mm::lowmem::{LowMemHandler, OfferPart, Requirement};
use rip_mm::{
    AllocClass, DeferredAlloc, HeapArena, MemoryManager, MemoryRequest, MmError, MmInitParams,
    PoolType, Tier, COST_ALL, COST_NONE, COST_NORMAL,
};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

fn manager(working: usize, extension: usize, use_all: bool) -> MemoryManager {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let addr_space = working + extension + if use_all { 64 * MB } else { 0 };
    MemoryManager::init(
        Box::new(HeapArena),
        MmInitParams {
            addr_space_size: addr_space,
            working_size: working,
            extension_size: extension,
            use_all_mem: use_all,
        },
    )
    .expect("manager init failed")
}

#[test]
fn init_creates_the_pool_set_and_finish_tears_down() {
    let mut mm = manager(8 * MB, 0, false);
    assert!(mm.pool_fixed().size() == 0);
    assert_eq!(mm.pool_temp().pool_type(), PoolType::Temp);
    assert_eq!(mm.pool_color().pool_type(), PoolType::Color);
    assert!(mm.sac_present(mm.pool_color()));
    assert_eq!(mm.pool_ps_local().pool_type(), PoolType::PsVm);
    assert_eq!(mm.pool_ps_typed_global().pool_type(), PoolType::PsVmFn);

    let mut count = 0;
    mm.pool_walk(|_| {
        count += 1;
        true
    });
    assert_eq!(count, 8, "fixed, temp, color, coc and four PS pools");

    assert_eq!(mm.working_size(), 8 * MB);
    assert_eq!(mm.total_size(), 8 * MB);
    mm.finish(false);
}

#[test]
fn init_fails_when_working_size_cannot_hold_the_reserve() {
    let result = MemoryManager::init(
        Box::new(HeapArena),
        MmInitParams {
            addr_space_size: 64 * MB,
            working_size: 64 * KB,
            extension_size: 0,
            use_all_mem: false,
        },
    );
    assert!(matches!(result, Err(MmError::InitFailed(_))));
}

#[test]
fn alloc_free_with_tags_and_fenceposts() {
    let mm = manager(8 * MB, 0, false);
    let temp = Arc::clone(mm.pool_temp());

    let p = mm.alloc(&temp, 300, AllocClass::General).unwrap();
    unsafe { std::ptr::write_bytes(p.as_ptr(), 0x5a, 300) };
    assert!(mm.pool_check(&temp, p.as_ptr() as usize));

    let leaks = mm.report_leaks();
    assert_eq!(leaks.count, 1);
    assert_eq!(leaks.total_bytes, 300);
    assert!(mm.check_fenceposts().is_ok());

    mm.free(&temp, p, 300);
    assert_eq!(mm.report_leaks().count, 0);
}

#[test]
fn fencepost_corruption_is_detected() {
    let mm = manager(8 * MB, 0, false);
    let temp = Arc::clone(mm.pool_temp());

    let p = mm.alloc(&temp, 64, AllocClass::General).unwrap();
    unsafe {
        // Overrun by one byte into the trailing post.
        *p.as_ptr().add(64) = 0;
    }
    assert!(matches!(
        mm.check_fenceposts(),
        Err(MmError::FencepostCorrupted { which: "trailing", .. })
    ));
    unsafe {
        *p.as_ptr().add(64) = 0xef;
    }
    assert!(mm.check_fenceposts().is_ok());
    mm.free(&temp, p, 64);
}

#[test]
fn truncate_rewrites_the_trailing_post() {
    let mm = manager(8 * MB, 0, false);
    let temp = Arc::clone(mm.pool_temp());

    let p = mm.alloc(&temp, 1024, AllocClass::General).unwrap();
    mm.truncate(&temp, p, 1024, 256);
    assert!(mm.check_fenceposts().is_ok());
    let leaks = mm.report_leaks();
    assert_eq!(leaks.tags[0].size, 256);
    mm.free(&temp, p, 256);
    assert_eq!(mm.report_leaks().count, 0);
}

#[test]
fn reserve_spend_is_graduated_and_idempotent() {
    let mm = manager(8 * MB, 0, false);
    assert_eq!(mm.reserve_level(), 0);
    assert!(!mm.memory_is_low());

    // Normal allocation cost may invade the first two reserve levels
    // but never the final reserve.
    let released = mm.reserve_get(COST_NORMAL);
    assert_eq!(released, 12 * 64 * KB);
    assert_eq!(mm.reserve_level(), 2);
    assert!(mm.memory_is_low());

    // Idempotent: nothing further to spend at this cost.
    assert_eq!(mm.reserve_get(COST_NORMAL), 0);
    assert_eq!(mm.reserve_level(), 2);

    // The gate: cheap allocations must regain first, expensive ones
    // need not.
    assert!(mm.should_regain_reserves(COST_NONE));
    assert!(!mm.should_regain_reserves(COST_ALL));

    // Refill brings the level back and clears the flag.
    mm.recheck_reserves();
    assert_eq!(mm.reserve_level(), 0);
    assert!(!mm.memory_is_low());
}

#[test]
fn commit_ladder_extends_under_pressure_and_shrinks_after() {
    let mm = manager(2 * MB, 2 * MB, false);
    let temp = Arc::clone(mm.pool_temp());
    let base_limit = mm.commit_limit();
    assert_eq!(base_limit, 2 * MB);

    // Fill past the working size; the arena-extension handler raises
    // the commit limit step by step.
    let mut blocks = Vec::new();
    loop {
        match mm.alloc_cost(&temp, 256 * KB, COST_NORMAL, AllocClass::General) {
            Ok(p) => blocks.push(p),
            Err(MmError::VmError) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert!(blocks.len() < 64, "allocation never hit the ceiling");
    }
    assert!(blocks.len() >= 8, "extension never engaged");
    assert!(mm.commit_limit() > base_limit);
    assert!(mm.memory_is_low());

    for p in blocks {
        mm.free(&temp, p, 256 * KB);
    }
    // Frees recheck the reserves: ladder shrinks back, reserve refills.
    assert_eq!(mm.commit_limit(), base_limit);
    assert_eq!(mm.reserve_level(), 0);
    assert!(!mm.memory_is_low());
}

#[test]
fn deferred_alloc_realizes_or_rolls_back_atomically() {
    let mm = manager(2 * MB, 0, false);
    let temp = Arc::clone(mm.pool_temp());

    // Small transaction: realizes.
    let mut ok = DeferredAlloc::new();
    ok.add(MemoryRequest::new(&temp, 16 * KB, 2, COST_NORMAL, AllocClass::General));
    mm.deferred_alloc_realize(&mut ok, COST_NORMAL).unwrap();
    let blocks: Vec<_> = ok.requests()[0].blocks.clone();
    assert!(blocks.iter().all(|b| b.is_some()));
    let distinct: std::collections::HashSet<_> =
        blocks.iter().map(|b| b.unwrap().as_ptr() as usize).collect();
    assert_eq!(distinct.len(), 2);
    for b in blocks {
        mm.free(&temp, b.unwrap(), 16 * KB);
    }

    // Two 1 MB requests cannot fit in a 2 MB arena alongside the final
    // reserve: everything must be rolled back.
    let mut big = DeferredAlloc::new();
    big.add(MemoryRequest::new(&temp, MB, 1, COST_NORMAL, AllocClass::General));
    big.add(MemoryRequest::new(&temp, MB, 1, COST_NORMAL, AllocClass::General));
    assert_eq!(
        mm.deferred_alloc_realize(&mut big, COST_NORMAL),
        Err(MmError::VmError)
    );
    for request in big.requests() {
        assert!(request.blocks.iter().all(|b| b.is_none()));
    }
    assert_eq!(mm.report_leaks().count, 0);
}

#[test]
fn ps_save_restore_resets_counters_above_the_level() {
    let mm = manager(8 * MB, 0, false);
    let local = Arc::clone(mm.pool_ps_local());

    let base = mm.ps_alloc_obj(&local, 256).unwrap();
    mm.ps_save(1);
    let at1 = mm.ps_alloc_obj(&local, 512).unwrap();
    mm.ps_save(2);
    let _at2 = mm.ps_alloc_string(&local, 100).unwrap();
    assert_eq!(mm.ps_save_level(), 2);
    assert!(mm.alloc_since_gc() >= 256 + 512 + 100);

    // Save-level safety: a level-1 pointer is unsafe for level 0.
    assert!(mm.ps_check(0, Some(at1)).is_err());
    assert!(mm.ps_check(1, Some(at1)).is_ok());
    assert!(mm.ps_check(0, None).is_ok());

    mm.ps_restore(0);
    assert_eq!(mm.ps_save_level(), 0);
    // Restored storage is gone; level-0 storage survives.
    assert!(mm.ps_check(0, Some(base)).is_ok());
    assert!(!mm.pool_check(&local, at1.as_ptr() as usize));
}

#[test]
fn ps_object_slots_initialise_as_nulls() {
    let mm = manager(8 * MB, 0, false);
    let local = Arc::clone(mm.pool_ps_local());

    let p = mm.ps_alloc_obj(&local, 4 * 16).unwrap();
    for slot in 0..4 {
        let mark = unsafe { *p.as_ptr().add(slot * 16) };
        let tags = unsafe { *p.as_ptr().add(slot * 16 + 1) };
        assert_eq!(mark & rip_mm::psvm::SLOT_PSVM, rip_mm::psvm::SLOT_PSVM);
        assert_eq!(mark & rip_mm::psvm::SLOT_LOCAL, rip_mm::psvm::SLOT_LOCAL);
        assert_eq!(tags, rip_mm::psvm::TAG_NULL | rip_mm::psvm::TAG_LITERAL);
    }
}

#[test]
fn gc_threshold_alert_cadence() {
    let mm = manager(48 * MB, 0, false);
    let local = Arc::clone(mm.pool_ps_local());
    let alert = Arc::new(AtomicBool::new(false));

    let effective = mm.set_gc_threshold(10.0 * MB as f64, Arc::clone(&alert));
    assert_eq!(effective, 12.0 * MB as f64, "floor is a quarter of the commit limit");

    // 20 MB of allocation breaches the threshold.
    for _ in 0..320 {
        mm.ps_alloc_obj(&local, 64 * KB).unwrap();
    }
    assert!(mm.alloc_since_gc() >= 20 * MB as u64);
    assert!(alert.load(Ordering::Acquire));
    assert!(mm.gc_threshold_exceeded());

    alert.store(false, Ordering::Release);
    mm.garbage_collect(true, true).unwrap();
    assert_eq!(mm.alloc_since_gc(), 0);
    assert!(!mm.gc_threshold_exceeded());

    // The alert stays clear until further allocation breaches again.
    mm.ps_alloc_obj(&local, 64 * KB).unwrap();
    assert!(!alert.load(Ordering::Acquire));
}

#[test]
fn gc_collects_unrooted_vm_and_finalizes() {
    let mm = manager(8 * MB, 0, false);
    let typed = Arc::clone(mm.pool_ps_typed_local());

    let finalized = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&finalized);
    mm.set_object_finalizer(move |_| {
        seen.fetch_add(1, Ordering::Relaxed);
    });

    let doomed = mm.ps_alloc_typed(&typed, 128).unwrap();
    assert!(mm.ps_finalize(doomed));
    let _plain = mm.ps_alloc_weak(&typed, 64).unwrap();

    mm.garbage_collect(true, true).unwrap();
    assert_eq!(finalized.load(Ordering::Relaxed), 1);
    // The finalized object survives until the next collection.
    assert!(mm.pool_check(&typed, doomed.as_ptr() as usize));
    mm.garbage_collect(true, true).unwrap();
    assert!(!mm.pool_check(&typed, doomed.as_ptr() as usize));
}

#[test]
fn gc_handler_reclaims_vm_under_pressure() {
    let mm = manager(6 * MB, 0, false);
    let local = Arc::clone(mm.pool_ps_local());
    let temp = Arc::clone(mm.pool_temp());
    mm.set_gc_mode(0);
    mm.set_between_operators(true);

    // 4 MB of unrooted PS VM.
    for _ in 0..64 {
        mm.ps_alloc_obj(&local, 64 * KB).unwrap();
    }
    assert_eq!(mm.gc_count(), 0);

    // This cannot fit without collecting; the GC handler's offer is the
    // cheapest way out.
    let p = mm
        .alloc_cost(&temp, 2 * MB, COST_NORMAL, AllocClass::General)
        .unwrap();
    assert!(mm.gc_count() >= 1);
    mm.free(&temp, p, 2 * MB);
}

#[test]
fn promise_roundtrip_and_abandonment() {
    let mm = manager(8 * MB, 0, false);
    let dl = mm.pool_create(PoolType::Dl).unwrap();

    // A promise ended without any sub-allocation frees everything.
    mm.dl_promise(&dl, 4 * KB).unwrap();
    assert_eq!(mm.dl_promise_end(&dl), 0);
    assert_eq!(mm.report_leaks().count, 0);

    // Sequential sub-allocations, then truncate to used size.
    mm.dl_promise(&dl, 4 * KB).unwrap();
    let a = mm.dl_promise_next(&dl, 100).unwrap();
    let b = mm.dl_promise_next(&dl, 60).unwrap();
    assert!(a.as_ptr() < b.as_ptr());
    assert_eq!(b.as_ptr() as usize % 8, 0, "sub-allocations are word-aligned");
    let used = mm.dl_promise_end(&dl);
    assert_eq!(used, 104 + 64);

    // The used part is freed by promise_free after the end.
    mm.dl_promise_free(&dl);
    assert_eq!(mm.report_leaks().count, 0);

    // Exhaustion yields None, not an error.
    mm.dl_promise(&dl, 128).unwrap();
    assert!(mm.dl_promise_next(&dl, 200).is_none());
    mm.dl_promise_free(&dl);
    mm.pool_destroy(&dl);
}

#[test]
fn pool_destroy_removes_the_pool_from_the_walk() {
    let mm = manager(8 * MB, 0, false);
    let pool = mm.pool_create(PoolType::Rsd).unwrap();
    let id = pool.id();
    let _p = mm.alloc(&pool, 10 * KB, AllocClass::Rsd).unwrap();

    mm.pool_destroy(&pool);
    let mut seen = false;
    mm.pool_walk(|p| {
        seen |= p.id() == id;
        true
    });
    assert!(!seen);
    assert_eq!(mm.report_leaks().count, 0, "destroy flushes the pool's tags");
}

#[test]
fn multi_allocation_rolls_back_on_failure() {
    let mm = manager(8 * MB, 0, false);
    // The colour pool's class has a 256 KB soft cap, so the third
    // 100 KB block cannot fit.
    let color = Arc::clone(mm.pool_color());
    let mut blocks = [None; 3];
    let result = mm.alloc_multi_homo(&color, 100 * KB, AllocClass::NColor, &mut blocks);
    assert_eq!(result, Err(MmError::VmError));
    assert!(blocks.iter().all(|b| b.is_none()));
}

#[test]
fn sac_caches_and_flushes() {
    let mm = manager(8 * MB, 0, false);
    let color = Arc::clone(mm.pool_color());

    let a = mm.sac_alloc(&color, 96, AllocClass::NColor).unwrap();
    mm.sac_free(&color, a, 96);
    // Same class: the cached block comes straight back.
    let b = mm.sac_alloc(&color, 90, AllocClass::NColor).unwrap();
    assert_eq!(a, b);
    mm.sac_free(&color, b, 90);
    mm.sac_flush(&color);
    assert_eq!(mm.report_leaks().count, 0);
}

#[test]
fn registered_handler_feeds_the_apportioner() {
    struct Hoard {
        pool: Arc<rip_mm::Pool>,
        blocks: Mutex<Vec<(std::ptr::NonNull<u8>, usize)>>,
        released: AtomicUsize,
    }
    unsafe impl Send for Hoard {}
    unsafe impl Sync for Hoard {}

    impl LowMemHandler for Hoard {
        fn name(&self) -> &'static str {
            "test hoard"
        }
        fn tier(&self) -> Tier {
            Tier::Ram
        }
        fn multi_thread_safe(&self) -> bool {
            true
        }
        fn solicit(&self, _mm: &MemoryManager, _req: &[Requirement]) -> Option<Vec<OfferPart>> {
            let held: usize = self.blocks.lock().iter().map(|(_, s)| s).sum();
            if held == 0 {
                return None;
            }
            Some(vec![OfferPart::new(Some(Arc::clone(&self.pool)), held, 0.5)])
        }
        fn release(&self, mm: &MemoryManager, _offer: &mut [OfferPart]) -> rip_mm::Result<()> {
            for (ptr, size) in self.blocks.lock().drain(..) {
                mm.free(&self.pool, ptr, size);
            }
            self.released.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    let mm = manager(2 * MB, 0, false);
    let temp = Arc::clone(mm.pool_temp());
    let hoard = Arc::new(Hoard {
        pool: Arc::clone(&temp),
        blocks: Mutex::new(Vec::new()),
        released: AtomicUsize::new(0),
    });
    // Hoard most of the arena.
    for _ in 0..2 {
        let p = mm.alloc(&temp, 256 * KB, AllocClass::General).unwrap();
        hoard.blocks.lock().push((p, 256 * KB));
    }
    let id = mm.register_low_mem_handler(Arc::clone(&hoard) as Arc<dyn LowMemHandler>);

    // Needs the hoarded memory back.
    let p = mm
        .alloc_cost(&temp, 512 * KB, COST_NORMAL, AllocClass::General)
        .unwrap();
    assert_eq!(hoard.released.load(Ordering::Relaxed), 1);
    assert_eq!(mm.reserve_level(), 0, "cheap handler ran before the reserves");

    mm.free(&temp, p, 512 * KB);
    mm.deregister_low_mem_handler(id);
}

#[test]
fn interrupt_cancels_low_memory_handling() {
    let mm = manager(8 * MB, 0, false);
    mm.set_interrupt();
    let req = [Requirement { pool: None, size: MB, cost: COST_NORMAL }];
    assert_eq!(mm.low_mem_handle(&req), Err(MmError::Interrupt));
    mm.clear_interrupt();
    assert!(mm.low_mem_handle(&req).is_ok());
}

#[test]
fn usage_report_aggregates_pools() {
    let mm = manager(8 * MB, 0, false);
    let temp = Arc::clone(mm.pool_temp());
    let p = mm.alloc(&temp, 100 * KB, AllocClass::General).unwrap();

    let usage = mm.print_pool_usage("scenario");
    let temp_row = usage.iter().find(|u| u.name == "TEMP_POOL_TYPE").unwrap();
    assert_eq!(temp_row.pools, 2, "fixed and temp share the type");
    assert!(temp_row.size >= 100 * KB);

    assert!(mm.no_pool_size(true) >= mm.no_pool_size(false));
    mm.free(&temp, p, 100 * KB);
}

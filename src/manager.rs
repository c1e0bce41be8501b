// # Memory Manager
//
// The owner of everything process-wide: the arena gateway, the pool
// list, the reserve system, the apportioner state, and the PostScript VM
// pools. The RIP runtime creates one of these at boot and hands worker
// threads a `&MemoryManager`.
//
// Initialisation order matters: the fixed pool first (it anchors the
// pool list), then the temp pool, the reserve and commit ladder, the
// colour pools, and finally PostScript VM. Failure at any step tears
// down whatever was created, in reverse. Shutdown runs the same order
// backwards; the fixed pool goes last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::alloc::fence::Fenceposts;
use crate::alloc::tag::TagTable;
use crate::arena::{ArenaGateway, ArenaVm};
use crate::error::{MmError, Result};
use crate::lowmem::{HandlerId, LowMemState, ThreadConstraint};
use crate::pool::sac::SacClass;
use crate::pool::{Pool, PoolRegistry, PoolType};
use crate::psvm::PsVm;
use crate::reserve::ReserveState;

/// Startup sizing for the manager.
#[derive(Debug, Clone, Copy)]
pub struct MmInitParams {
    /// Hard ceiling: the address space the arena may ever occupy.
    pub addr_space_size: usize,
    /// The commit limit the RIP runs at without low-memory pressure.
    pub working_size: usize,
    /// Extra commit available at partial-paint cost.
    pub extension_size: usize,
    /// Allow extending all the way to the address-space limit.
    pub use_all_mem: bool,
}

/// Debug options fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct MmOptions {
    /// MM fenceposting (per pool; debug pools always opt out).
    pub fenceposts: bool,
    /// Out-of-line allocation tags.
    pub tags: bool,
}

impl Default for MmOptions {
    fn default() -> Self {
        MmOptions { fenceposts: true, tags: true }
    }
}

/// A working size below this counts as a resource-poor configuration;
/// subsystems shrink their fixed tables accordingly.
const LOW_MEM_CONFIGURATION_LIMIT: usize = 65 * 1024 * 1024;

pub struct MemoryManager {
    pub(crate) arena: ArenaGateway,
    pub(crate) registry: PoolRegistry,
    pub(crate) lowmem: LowMemState,
    pub(crate) reserves: ReserveState,
    pub(crate) tags: TagTable,
    pub(crate) fence: Fenceposts,
    pub(crate) interrupt: AtomicBool,
    pub(crate) constraint: RwLock<Option<Box<dyn ThreadConstraint>>>,
    pub(crate) builtin_handlers: Mutex<Vec<HandlerId>>,
    pub(crate) ps: Option<PsVm>,

    pool_fixed: Option<Arc<Pool>>,
    pool_temp: Option<Arc<Pool>>,
    pool_color: Option<Arc<Pool>>,
    pool_coc: Option<Arc<Pool>>,

    is_low_mem_configuration: bool,
    finished: AtomicBool,
}

impl MemoryManager {
    /// Bring up the manager: pools, reserves, commit ladder, PS VM.
    pub fn init(arena: Box<dyn ArenaVm>, params: MmInitParams) -> Result<MemoryManager> {
        Self::init_with_options(arena, params, MmOptions::default())
    }

    pub fn init_with_options(
        arena: Box<dyn ArenaVm>,
        params: MmInitParams,
        options: MmOptions,
    ) -> Result<MemoryManager> {
        if params.addr_space_size == 0 || params.working_size == 0 {
            return Err(MmError::InitFailed("zero working or address-space size".into()));
        }
        let mut mm = MemoryManager {
            arena: ArenaGateway::new(arena, params.addr_space_size),
            registry: PoolRegistry::new(),
            lowmem: LowMemState::new(),
            reserves: ReserveState::new(),
            tags: TagTable::new(options.tags),
            fence: Fenceposts::new(options.fenceposts),
            interrupt: AtomicBool::new(false),
            constraint: RwLock::new(None),
            builtin_handlers: Mutex::new(Vec::new()),
            ps: None,
            pool_fixed: None,
            pool_temp: None,
            pool_color: None,
            pool_coc: None,
            is_low_mem_configuration: params.working_size < LOW_MEM_CONFIGURATION_LIMIT,
            finished: AtomicBool::new(false),
        };
        match mm.bootstrap(params) {
            Ok(()) => {
                tracing::info!(
                    working = params.working_size,
                    extension = params.extension_size,
                    use_all = params.use_all_mem,
                    "memory manager initialised"
                );
                Ok(mm)
            }
            Err(e) => {
                mm.teardown(true);
                Err(e)
            }
        }
    }

    fn bootstrap(&mut self, params: MmInitParams) -> Result<()> {
        // The fixed pool must be first: it anchors the pool list.
        self.pool_fixed = Some(self.registry.create(&self.arena, PoolType::Temp)?);
        self.pool_temp = Some(self.registry.create(&self.arena, PoolType::Temp)?);

        self.reserve_create()?;
        self.extension_init(
            params.addr_space_size,
            params.working_size,
            params.extension_size,
            params.use_all_mem,
        )?;

        let color = self.registry.create(&self.arena, PoolType::Color)?;
        // Colour SAC classes: heuristics from observed colour-chain
        // traffic; totals just under a segment, leaving room for larger
        // allocations that aren't worth caching.
        let sac_classes = [
            SacClass { block_size: 64, cached_count: 16, frequency: 1 },
            SacClass { block_size: 96, cached_count: 64, frequency: 32 },
            SacClass { block_size: 112, cached_count: 64, frequency: 64 },
            SacClass { block_size: 128, cached_count: 64, frequency: 32 },
            SacClass { block_size: 192, cached_count: 32, frequency: 16 },
            SacClass { block_size: 256, cached_count: 12, frequency: 2 },
            SacClass { block_size: 512, cached_count: 12, frequency: 8 },
            SacClass { block_size: 1664, cached_count: 12, frequency: 4 },
        ];
        self.sac_create(&color, &sac_classes)?;
        self.pool_color = Some(color);

        self.pool_coc = Some(self.registry.create(&self.arena, PoolType::Coc)?);

        self.ps = Some(PsVm::start(self)?);
        Ok(())
    }

    /// Shut the manager down. On `abort`, pools still registered by
    /// clients are tolerated and destroyed.
    pub fn finish(&mut self, abort: bool) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.teardown(abort);
        tracing::info!(abort, "memory manager finished");
    }

    fn teardown(&mut self, abort: bool) {
        self.extension_finish();
        self.reserve_destroy();
        if let Some(ps) = self.ps.take() {
            ps.finish(self);
        }
        for id in self.builtin_handlers.lock().drain(..).rev() {
            self.lowmem.remove(id);
        }

        // Hard-coded pools go in reverse creation order.
        if let Some(coc) = self.pool_coc.take() {
            self.pool_destroy(&coc);
        }
        if let Some(color) = self.pool_color.take() {
            self.sac_destroy(&color);
            self.pool_destroy(&color);
        }
        if let Some(temp) = self.pool_temp.take() {
            self.pool_destroy(&temp);
        }

        let fixed = self.pool_fixed.take();
        if !abort {
            debug_assert!(
                self.registry
                    .pools()
                    .iter()
                    .all(|p| fixed.as_ref().map_or(false, |f| Arc::ptr_eq(p, f))),
                "unexpected pool not destroyed during regular exit"
            );
        }
        // Destroy any remaining pools, the fixed pool last.
        for pool in self.registry.pools() {
            if fixed.as_ref().map_or(true, |f| !Arc::ptr_eq(&pool, f)) {
                self.pool_destroy(&pool);
            }
        }
        if let Some(fixed) = fixed {
            self.pool_destroy(&fixed);
        }
        debug_assert!(self.registry.is_empty(), "pools not all destroyed");
    }

    // == Accessors ==

    pub(crate) fn ps(&self) -> &PsVm {
        self.ps.as_ref().expect("PS VM not initialised")
    }

    pub fn arena_committed(&self) -> usize {
        self.arena.committed()
    }

    pub fn commit_limit(&self) -> usize {
        self.arena.commit_limit()
    }

    /// The pool holding manager-lifetime data. First created, last
    /// destroyed.
    pub fn pool_fixed(&self) -> &Arc<Pool> {
        self.pool_fixed.as_ref().expect("fixed pool not initialised")
    }

    /// The pool for temporary workspace allocations.
    pub fn pool_temp(&self) -> &Arc<Pool> {
        self.pool_temp.as_ref().expect("temp pool not initialised")
    }

    /// The pool for colour chains, with its SAC.
    pub fn pool_color(&self) -> &Arc<Pool> {
        self.pool_color.as_ref().expect("color pool not initialised")
    }

    /// The colour-cache pool.
    pub fn pool_coc(&self) -> &Arc<Pool> {
        self.pool_coc.as_ref().expect("coc pool not initialised")
    }

    /// Was the RIP given very little memory at startup?
    pub fn low_mem_configuration(&self) -> bool {
        self.is_low_mem_configuration
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            self.teardown(true);
        }
    }
}

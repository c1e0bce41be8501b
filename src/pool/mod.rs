// # Pool Registry
//
// A pool is an owned container of allocations of a declared pool type.
// The type picks the underlying pool class (free-list discipline, whether
// save/restore and tracing are supported) and fixed parameters: segment
// size, average allocation size, alignment, and the free-list knobs.
//
// Every pool is linked into a process-wide list; the fixed pool must be
// the first created and the last destroyed, because the manager's own
// bookkeeping lives there.

pub mod backend;
pub mod promise;
pub mod sac;
pub mod totals;

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arena::{ArenaGateway, Symbol, SEGMENT_SIZE};
use crate::error::{MmError, Result};

use backend::{ManualPool, VmPool};
use promise::PromiseState;
use sac::Sac;
use totals::Totals;

/// Pool classes: the free-list/collection discipline behind a pool type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolClass {
    /// Display-list-like: left-to-right growth, stack discipline.
    Epdl,
    /// Right-fit variant of the above.
    Epdr,
    /// PostScript VM with save/restore and tracing.
    Epvm,
    EpvmDebug,
    /// PostScript VM for typed/weak structures with finalization.
    Epfn,
    EpfnDebug,
    /// Variable-size manual pool with a soft size cap.
    Mv,
    /// Manual pool, first-fit free list with placement knobs.
    Mvff,
}

impl PoolClass {
    pub fn is_vm(self) -> bool {
        matches!(
            self,
            PoolClass::Epvm | PoolClass::EpvmDebug | PoolClass::Epfn | PoolClass::EpfnDebug
        )
    }
}

/// The closed set of pool types the RIP creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolType {
    Dl,
    DlFast,
    Temp,
    Color,
    Coc,
    Table,
    Pcl,
    PclXl,
    PsVm,
    PsVmDebug,
    PsVmFn,
    PsVmFnDebug,
    Pdf,
    Irr,
    Trap,
    ImbFix,
    ImbVar,
    Rsd,
    Tiff,
    Shading,
    XmlParse,
    XmlSubsystem,
    Band,
    BdState,
    BdData,
    Rle,
    HtForm,
}

/// Fixed creation parameters for a pool type.
#[derive(Debug, Clone, Copy)]
pub struct PoolParams {
    pub class: PoolClass,
    pub segment_size: usize,
    pub avg_size: usize,
    pub alignment: usize,
    pub max_pool_size: usize,
    pub slot_high: bool,
    pub arena_high: bool,
    pub first_fit: bool,
    /// Backend-side debug pool: fenceposting is done by the backend, so
    /// the front-end must not add its own.
    pub debug: bool,
}

const MIN_POOL_ALIGN: usize = 8;
const MAX_POOL_SIZE: usize = 2048 * 1024 * 1024;

const fn mvff(
    avg: usize,
    align: usize,
    slot_high: bool,
    arena_high: bool,
    debug: bool,
) -> PoolParams {
    PoolParams {
        class: PoolClass::Mvff,
        segment_size: SEGMENT_SIZE,
        avg_size: avg,
        alignment: align,
        max_pool_size: MAX_POOL_SIZE,
        slot_high,
        arena_high,
        first_fit: true,
        debug,
    }
}

// Placement knobs emulating the two legacy disciplines.
const EPDL_LIKE: (bool, bool) = (false, false);
const EPDR_LIKE: (bool, bool) = (true, true);

const fn vm_params(class: PoolClass) -> PoolParams {
    PoolParams {
        class,
        segment_size: SEGMENT_SIZE,
        avg_size: 0,
        alignment: MIN_POOL_ALIGN,
        max_pool_size: MAX_POOL_SIZE,
        slot_high: false,
        arena_high: false,
        first_fit: false,
        debug: false,
    }
}

impl PoolType {
    pub const ALL: [PoolType; 27] = [
        PoolType::Dl,
        PoolType::DlFast,
        PoolType::Temp,
        PoolType::Color,
        PoolType::Coc,
        PoolType::Table,
        PoolType::Pcl,
        PoolType::PclXl,
        PoolType::PsVm,
        PoolType::PsVmDebug,
        PoolType::PsVmFn,
        PoolType::PsVmFnDebug,
        PoolType::Pdf,
        PoolType::Irr,
        PoolType::Trap,
        PoolType::ImbFix,
        PoolType::ImbVar,
        PoolType::Rsd,
        PoolType::Tiff,
        PoolType::Shading,
        PoolType::XmlParse,
        PoolType::XmlSubsystem,
        PoolType::Band,
        PoolType::BdState,
        PoolType::BdData,
        PoolType::Rle,
        PoolType::HtForm,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PoolType::Dl => "DL_POOL_TYPE",
            PoolType::DlFast => "DL_FAST_POOL_TYPE",
            PoolType::Temp => "TEMP_POOL_TYPE",
            PoolType::Color => "COLOR_POOL_TYPE",
            PoolType::Coc => "COC_POOL_TYPE",
            PoolType::Table => "TABLE_POOL_TYPE",
            PoolType::Pcl => "PCL_POOL_TYPE",
            PoolType::PclXl => "PCLXL_POOL_TYPE",
            PoolType::PsVm => "PSVM_POOL_TYPE",
            PoolType::PsVmDebug => "PSVM_DEBUG_POOL_TYPE",
            PoolType::PsVmFn => "PSVMFN_POOL_TYPE",
            PoolType::PsVmFnDebug => "PSVMFN_DEBUG_POOL_TYPE",
            PoolType::Pdf => "PDF_POOL_TYPE",
            PoolType::Irr => "IRR_POOL_TYPE",
            PoolType::Trap => "TRAP_POOL_TYPE",
            PoolType::ImbFix => "IMBFIX_POOL_TYPE",
            PoolType::ImbVar => "IMBVAR_POOL_TYPE",
            PoolType::Rsd => "RSD_POOL_TYPE",
            PoolType::Tiff => "TIFF_POOL_TYPE",
            PoolType::Shading => "SHADING_POOL_TYPE",
            PoolType::XmlParse => "XML_PARSE_POOL_TYPE",
            PoolType::XmlSubsystem => "XML_SUBSYSTEM_POOL_TYPE",
            PoolType::Band => "BAND_POOL_TYPE",
            PoolType::BdState => "BDSTATE_POOL_TYPE",
            PoolType::BdData => "BDDATA_POOL_TYPE",
            PoolType::Rle => "RLE_POOL_TYPE",
            PoolType::HtForm => "HTFORM_POOL_TYPE",
        }
    }

    pub fn params(self) -> PoolParams {
        match self {
            PoolType::Dl => mvff(512, MIN_POOL_ALIGN, EPDL_LIKE.0, EPDL_LIKE.1, false),
            PoolType::DlFast => mvff(512, MIN_POOL_ALIGN, EPDL_LIKE.0, EPDL_LIKE.1, true),
            PoolType::Temp => mvff(32, 8, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::Color => PoolParams {
                class: PoolClass::Mv,
                segment_size: SEGMENT_SIZE,
                avg_size: 64,
                alignment: 8,
                max_pool_size: 256 * 1024,
                slot_high: EPDR_LIKE.0,
                arena_high: EPDR_LIKE.1,
                first_fit: true,
                debug: false,
            },
            PoolType::Coc => mvff(8192, 512, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::Table => mvff(64, MIN_POOL_ALIGN, EPDL_LIKE.0, EPDL_LIKE.1, false),
            PoolType::Pcl => mvff(32, 8, EPDL_LIKE.0, EPDL_LIKE.1, false),
            PoolType::PclXl => mvff(32, 8, EPDL_LIKE.0, EPDL_LIKE.1, false),
            PoolType::PsVm => vm_params(PoolClass::Epvm),
            PoolType::PsVmDebug => vm_params(PoolClass::EpvmDebug),
            PoolType::PsVmFn => vm_params(PoolClass::Epfn),
            PoolType::PsVmFnDebug => vm_params(PoolClass::EpfnDebug),
            PoolType::Pdf => mvff(32, 8, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::Irr => mvff(512, 8, EPDL_LIKE.0, EPDL_LIKE.1, false),
            PoolType::Trap => mvff(512, 8, EPDL_LIKE.0, EPDL_LIKE.1, false),
            PoolType::ImbFix => mvff(512, 8, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::ImbVar => mvff(512, 8, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::Rsd => mvff(16384, 512, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::Tiff => mvff(512, MIN_POOL_ALIGN, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::Shading => mvff(512, 8, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::XmlParse => mvff(512, MIN_POOL_ALIGN, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::XmlSubsystem => mvff(512, MIN_POOL_ALIGN, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::Band => mvff(512, 8, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::BdState => mvff(512, 8, EPDL_LIKE.0, EPDL_LIKE.1, false),
            PoolType::BdData => mvff(512, 8, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::Rle => mvff(512, 8, EPDR_LIKE.0, EPDR_LIKE.1, false),
            PoolType::HtForm => mvff(512, 8, EPDR_LIKE.0, EPDR_LIKE.1, false),
        }
    }
}

pub(crate) enum Backend {
    Manual(Mutex<ManualPool>),
    Vm(Mutex<VmPool>),
}

/// A pool descriptor.
pub struct Pool {
    id: Uuid,
    pool_type: PoolType,
    class: PoolClass,
    segment_size: usize,
    alignment: usize,
    debug: bool,
    label: Symbol,
    pub(crate) backend: Backend,
    pub(crate) sac: Mutex<Option<Sac>>,
    pub(crate) promise: Mutex<PromiseState>,
    pub(crate) totals: Totals,
}

impl Pool {
    fn from_params(gateway: &ArenaGateway, ty: PoolType, backend: Backend) -> Pool {
        let params = ty.params();
        let id = Uuid::new_v4();
        let label = gateway.intern(ty.name());
        gateway.label(id, label);
        Pool {
            id,
            pool_type: ty,
            class: params.class,
            segment_size: params.segment_size,
            alignment: params.alignment,
            debug: params.debug,
            label,
            backend,
            sac: Mutex::new(None),
            promise: Mutex::new(PromiseState::default()),
            totals: Totals::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    pub fn class(&self) -> PoolClass {
        self.class
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub(crate) fn set_segment_size(&mut self, size: usize) {
        self.segment_size = size;
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Backend-side debug pool: MM fenceposts are skipped.
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn label(&self) -> Symbol {
        self.label
    }

    pub(crate) fn alloc_raw(&self, gateway: &ArenaGateway, size: usize) -> Option<NonNull<u8>> {
        match &self.backend {
            Backend::Manual(m) => m.lock().alloc(gateway, size),
            Backend::Vm(_) => {
                debug_assert!(false, "generic alloc on a VM pool");
                None
            }
        }
    }

    pub(crate) fn free_raw(&self, gateway: &ArenaGateway, ptr: NonNull<u8>, size: usize) {
        match &self.backend {
            Backend::Manual(m) => m.lock().free(gateway, ptr, size),
            Backend::Vm(_) => debug_assert!(false, "generic free on a VM pool"),
        }
    }

    pub(crate) fn clear_backend(&self, gateway: &ArenaGateway) {
        match &self.backend {
            Backend::Manual(m) => m.lock().clear(gateway),
            Backend::Vm(v) => v.lock().clear(gateway),
        }
    }

    pub(crate) fn with_vm<R>(&self, f: impl FnOnce(&mut VmPool) -> R) -> R {
        match &self.backend {
            Backend::Vm(v) => f(&mut v.lock()),
            Backend::Manual(_) => panic!("VM operation on a manual pool"),
        }
    }

    pub(crate) fn is_vm(&self) -> bool {
        matches!(self.backend, Backend::Vm(_))
    }

    /// How many bytes are assigned to this pool?
    pub fn size(&self) -> usize {
        match &self.backend {
            Backend::Manual(m) => m.lock().managed_size(),
            Backend::Vm(v) => v.lock().alloced_size(),
        }
    }

    /// How many of the pool's bytes are free?
    pub fn free_size(&self) -> usize {
        match &self.backend {
            Backend::Manual(m) => m.lock().free_size(),
            Backend::Vm(_) => 0,
        }
    }

    pub fn alloced_size(&self) -> usize {
        self.size() - self.free_size()
    }

    /// Does the address lie within this pool?
    pub fn has_addr(&self, addr: usize) -> bool {
        match &self.backend {
            Backend::Manual(m) => m.lock().has_addr(addr),
            Backend::Vm(v) => v.lock().level_of(addr).is_some(),
        }
    }

    pub fn save_level(&self) -> usize {
        match &self.backend {
            Backend::Vm(v) => v.lock().save_level(),
            Backend::Manual(_) => 0,
        }
    }

    pub fn totals(&self) -> totals::TotalsSnapshot {
        self.totals.snapshot()
    }
}

/// Aggregated usage for one pool type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolUsage {
    pub name: &'static str,
    pub size: usize,
    pub free: usize,
    pub pools: usize,
}

/// The process-wide pool list.
pub(crate) struct PoolRegistry {
    list: Mutex<Vec<Arc<Pool>>>,
}

impl PoolRegistry {
    pub fn new() -> PoolRegistry {
        PoolRegistry {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Create a manual pool of the given type and link it in.
    pub fn create(&self, gateway: &ArenaGateway, ty: PoolType) -> Result<Arc<Pool>> {
        let params = ty.params();
        if params.class.is_vm() {
            return Err(MmError::PoolCreateFailed(format!(
                "{} requires VM pool creation",
                ty.name()
            )));
        }
        let manual = ManualPool::new(
            params.segment_size,
            params.alignment,
            params.max_pool_size,
            params.slot_high,
            params.first_fit,
        );
        let pool = Arc::new(Pool::from_params(
            gateway,
            ty,
            Backend::Manual(Mutex::new(manual)),
        ));
        self.link(&pool);
        tracing::debug!(pool = ty.name(), id = %pool.id(), "pool created");
        Ok(pool)
    }

    /// Create a PS VM pool supporting save levels up to `max_save_level`.
    pub fn create_vm(
        &self,
        gateway: &ArenaGateway,
        ty: PoolType,
        max_save_level: usize,
    ) -> Result<Arc<Pool>> {
        let params = ty.params();
        if !params.class.is_vm() {
            return Err(MmError::PoolCreateFailed(format!(
                "{} is not a VM pool type",
                ty.name()
            )));
        }
        let mut pool = Pool::from_params(
            gateway,
            ty,
            Backend::Vm(Mutex::new(VmPool::new(max_save_level))),
        );
        // VM pools grow by pages, not display-list segments; round
        // low-memory requests accordingly.
        pool.set_segment_size(4 * 1024);
        let pool = Arc::new(pool);
        self.link(&pool);
        tracing::debug!(pool = ty.name(), id = %pool.id(), "VM pool created");
        Ok(pool)
    }

    fn link(&self, pool: &Arc<Pool>) {
        self.list.lock().push(Arc::clone(pool));
    }

    /// Unlink a pool; true if it was present.
    pub fn unlink(&self, pool: &Arc<Pool>) -> bool {
        let mut list = self.list.lock();
        match list.iter().position(|p| Arc::ptr_eq(p, pool)) {
            Some(i) => {
                list.remove(i);
                true
            }
            None => false,
        }
    }

    /// Iterate over every active pool. `f` must not create or destroy
    /// pools. Returns true iff `f` returned true for all pools.
    pub fn walk(&self, mut f: impl FnMut(&Arc<Pool>) -> bool) -> bool {
        let list = self.list.lock();
        let mut res = true;
        for pool in list.iter() {
            res = f(pool) && res;
        }
        res
    }

    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.list.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Aggregate usage by pool type, largest first.
    pub fn usage(&self) -> Vec<PoolUsage> {
        let mut by_type: Vec<PoolUsage> = Vec::new();
        self.walk(|pool| {
            let name = pool.pool_type().name();
            let size = pool.size();
            let free = pool.free_size();
            match by_type.iter_mut().find(|u| u.name == name) {
                Some(u) => {
                    u.size += size;
                    u.free += free;
                    u.pools += 1;
                }
                None => by_type.push(PoolUsage { name, size, free, pools: 1 }),
            }
            true
        });
        by_type.sort_by(|a, b| b.size.cmp(&a.size));
        by_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::HeapArena;

    fn gateway() -> ArenaGateway {
        ArenaGateway::new(Box::new(HeapArena), 1 << 30)
    }

    #[test]
    fn type_table_is_complete() {
        for ty in PoolType::ALL {
            let params = ty.params();
            assert!(params.segment_size >= 4096, "{}", ty.name());
            assert!(params.alignment >= 4, "{}", ty.name());
            assert!(!ty.name().is_empty());
        }
        assert_eq!(PoolType::ALL.len(), 27);
    }

    #[test]
    fn vm_types_map_to_vm_classes() {
        assert!(PoolType::PsVm.params().class.is_vm());
        assert!(PoolType::PsVmFn.params().class.is_vm());
        assert!(!PoolType::Dl.params().class.is_vm());
        assert!(PoolType::DlFast.params().debug);
    }

    #[test]
    fn create_links_destroy_unlinks() {
        let gw = gateway();
        let reg = PoolRegistry::new();
        let pool = reg.create(&gw, PoolType::Temp).unwrap();

        let mut seen = 0;
        reg.walk(|_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 1);

        assert!(reg.unlink(&pool));
        assert!(!reg.unlink(&pool));
        let mut seen = 0;
        reg.walk(|_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 0);
    }

    #[test]
    fn vm_creation_requires_vm_type() {
        let gw = gateway();
        let reg = PoolRegistry::new();
        assert!(reg.create(&gw, PoolType::PsVm).is_err());
        assert!(reg.create_vm(&gw, PoolType::Dl, 31).is_err());
        let pool = reg.create_vm(&gw, PoolType::PsVm, 31).unwrap();
        assert_eq!(pool.segment_size(), 4096);
        reg.unlink(&pool);
    }

    #[test]
    fn usage_aggregates_by_type() {
        let gw = gateway();
        let reg = PoolRegistry::new();
        let a = reg.create(&gw, PoolType::Temp).unwrap();
        let _b = reg.create(&gw, PoolType::Temp).unwrap();
        let _c = reg.create(&gw, PoolType::Dl).unwrap();

        a.alloc_raw(&gw, 1000).unwrap();
        let usage = reg.usage();
        let temp = usage.iter().find(|u| u.name == "TEMP_POOL_TYPE").unwrap();
        assert_eq!(temp.pools, 2);
        assert!(temp.size >= 1000);
        for pool in reg.pools() {
            pool.clear_backend(&gw);
        }
    }
}

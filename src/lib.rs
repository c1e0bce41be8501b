// rip-mm - Memory management subsystem for a PostScript/PDF raster
// image processor. Core library module.

pub mod alloc;
pub mod arena;
pub mod callps;
pub mod cost;
pub mod error;
pub mod lowmem;
pub mod manager;
pub mod pool;
pub mod pscalc;
pub mod psvm;
pub mod reserve;

pub use alloc::deferred::{DeferredAlloc, MemoryRequest};
pub use alloc::AllocClass;
pub use arena::{ArenaVm, HeapArena, SEGMENT_SIZE};
pub use callps::{
    create_callpscache, destroy_callpscache, reserve_callpscache, CallPsCache, CallPsSource,
    FnType, PsCallout,
};
pub use cost::{Cost, Tier, COST_ALL, COST_BELOW_RESERVES, COST_EASY, COST_NONE, COST_NORMAL};
pub use error::{MmError, Result};
pub use lowmem::{HandlerId, LowMemHandler, OfferPart, Requirement, ThreadConstraint};
pub use manager::{MemoryManager, MmInitParams, MmOptions};
pub use pool::sac::SacClass;
pub use pool::{Pool, PoolClass, PoolType};
pub use pscalc::{PsCalcError, PsCalcFunc, PsToken, PSCALC_MAXOBJS, PSCALC_MAXSTACK};
pub use psvm::{RootSet, MAX_GLOBAL_SAVE_LEVEL, MAX_SAVE_LEVELS, MIN_SAVE_LEVEL, SAVE_LEVEL_INC};

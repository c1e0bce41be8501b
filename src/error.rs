use thiserror::Error;

/// Errors surfaced by the memory manager.
///
/// Resource exhaustion and cooperative interrupts are the two errors an
/// allocation path can produce; everything else is a misuse of the API
/// detected at a checkable boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MmError {
    #[error("VM error: allocation could not be satisfied")]
    VmError,

    #[error("interrupted while waiting for low-memory handling")]
    Interrupt,

    #[error("memory manager initialisation failed: {0}")]
    InitFailed(String),

    #[error("pool creation failed: {0}")]
    PoolCreateFailed(String),

    #[error("invalid allocation cost")]
    InvalidCost,

    #[error("low-memory handler error: {0}")]
    HandlerError(String),

    #[error("save level violation: pointer allocated above level {level}")]
    SaveLevelViolation { level: usize },

    #[error("fencepost corrupted at {address:#x}: {which}")]
    FencepostCorrupted { address: usize, which: &'static str },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, MmError>;

//! The crate's top-level error type, composing every component's own
//! error enum behind `#[from]` the way `minidump-writer`'s
//! `CoreDumpError`/`WriterError` family layers component errors into one
//! public type callers can match on without reaching into submodules.

use thiserror::Error;

use crate::gadgets::GadgetError;
use crate::jop::JopError;
use crate::kernel_memory::KernelMemoryError;
use crate::ksim::SimError;
use crate::mach::KernelError;
use crate::oracle::OracleError;
use crate::trap_hook::TrapHookError;
use crate::vtable_finder::FinderError;

/// The union of every fatal error this crate can produce. Best-effort
/// passes (the vtable finder, gadget scanner) report their own failures
/// through [`crate::soft_error::SoftErrorList`] instead and never surface
/// here directly -- this type is only for failures that actually abort
/// an operation outright.
#[derive(Debug, Error)]
pub enum KernelCallError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Simulator(#[from] SimError),
    #[error(transparent)]
    Finder(#[from] FinderError),
    #[error(transparent)]
    Gadget(#[from] GadgetError),
    #[error(transparent)]
    Jop(#[from] JopError),
    #[error(transparent)]
    TrapHook(#[from] TrapHookError),
    #[error(transparent)]
    Memory(#[from] KernelMemoryError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("no calling strategy (trap hook or JOP) is available for this kernel image")]
    NoStrategyAvailable,
    #[error("kernel-call subsystem was not initialized before use")]
    NotInitialized,
    #[error("kernel-call subsystem is already initialized")]
    AlreadyInitialized,
    #[error("class {0:?} was not found among the discovered vtables/metaclasses")]
    UnknownClass(String),
}

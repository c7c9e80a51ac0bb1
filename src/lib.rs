// Because of the nature of this crate, there are lots of times we cast aliased types to `u64`
// Often, on 64-bit platforms, it's already that, so Clippy gets upset at the u64-to-u64
// conversion.
#![allow(clippy::useless_conversion)]

pub mod aarch64;
pub mod config;
pub mod error;
pub mod gadgets;
pub mod interrupt;
pub mod jop;
pub mod kernel_call;
pub mod kernel_memory;
pub mod ksim;
pub mod mach;
pub mod oracle;
pub mod soft_error;
pub mod symbols;
pub mod vtable_finder;

pub use config::KernelCallConfig;
pub use error::KernelCallError;
pub use kernel_call::KernelCall;

failspot::failspot_name! {
    pub enum FailSpotName {
        GadgetScanAbortEarly,
        TrapHookInstallAfterVtableWrite,
        OracleSlideValidation,
    }
}

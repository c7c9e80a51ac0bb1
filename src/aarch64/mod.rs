//! AArch64 instruction decoding.
//!
//! This module only decodes; it performs no I/O and holds no state. See
//! [`crate::ksim`] for the micro-simulator that drives a stream of these
//! instructions. Only the "newer libmemctl" register-encoding convention
//! is implemented; see DESIGN.md for why the older `disasm.c` convention
//! was dropped.

mod bitmask;
mod decode;
mod reg;

pub use bitmask::{decode_bit_masks, BitMasks};
pub use decode::{decode, Instruction, LdpSize, LogicalOp, MovVariant};
pub use reg::{Extend, ExtendKind, GpReg, Shift, Width};

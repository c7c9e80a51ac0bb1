//! Component B: the micro-simulator, grounded on
//! `memctl/aarch64/ksim.h`.
//!
//! Executes a decoded instruction stream over a symbolic register file with
//! abstract "known/unknown" values. No memory model: loads always produce
//! unknown values. Branches are handled by a client-supplied callback;
//! everything else follows the default rule documented on [`Simulator`].

use crate::aarch64::{self, GpReg, Instruction, LogicalOp, MovVariant, Shift, Width};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("simulation was interrupted")]
    Interrupted,
    #[error("instruction budget of {0} exhausted without reaching a stop condition")]
    BudgetExhausted(usize),
    #[error("program counter {0:#x} lies outside the simulated code region")]
    PcOutOfRange(u64),
}

/// A 64-bit value that is either known or, abstractly
/// unknown (the result of an unmodeled operation, a load, or ABI clobber).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegValue {
    Known(u64),
    Unknown,
}

impl RegValue {
    pub fn known(self) -> Option<u64> {
        match self {
            RegValue::Known(v) => Some(v),
            RegValue::Unknown => None,
        }
    }

    fn map2(a: RegValue, b: RegValue, f: impl FnOnce(u64, u64) -> u64) -> RegValue {
        match (a, b) {
            (RegValue::Known(a), RegValue::Known(b)) => RegValue::Known(f(a, b)),
            _ => RegValue::Unknown,
        }
    }
}

/// Thirty-two 64-bit slots, each carrying a value and a known flag (encoded
/// in [`RegValue`] itself): the simulator's register file.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    x: [RegValue; 32],
}

impl RegisterFile {
    fn new() -> RegisterFile {
        RegisterFile {
            x: [RegValue::Unknown; 32],
        }
    }

    pub fn get(&self, reg: GpReg) -> RegValue {
        if reg.is_zr() {
            return RegValue::Known(0);
        }
        let v = self.x[reg.number() as usize];
        if reg.width() == Width::W32 {
            return match v {
                RegValue::Known(x) => RegValue::Known(x & 0xffff_ffff),
                RegValue::Unknown => RegValue::Unknown,
            };
        }
        v
    }

    pub fn set(&mut self, reg: GpReg, value: RegValue) {
        if reg.is_zr() {
            return;
        }
        self.x[reg.number() as usize] = match (reg.width(), value) {
            (Width::W32, RegValue::Known(v)) => RegValue::Known(v & 0xffff_ffff),
            other => other.1,
        };
    }

    /// Clears every slot (the "any unmodeled instruction" fallback, and the
    /// ABI-level clobber for `x0..x17, x30` on `BL`).
    pub fn clear_all(&mut self) {
        self.x = [RegValue::Unknown; 32];
    }

    fn clear_temporaries(&mut self) {
        for i in 0..=17 {
            self.x[i] = RegValue::Unknown;
        }
        self.x[30] = RegValue::Unknown;
    }
}

/// For conditional branches, whether the simulator could determine the
/// branch's direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCondition {
    Unknown,
    True,
    False,
}

/// Client decision for a branch instruction: whether to take it, and
/// whether to stop simulating immediately after (overriding `stop_after`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchDecision {
    pub take: bool,
    pub stop: bool,
}

/// Reason [`Simulator::run`] returned control to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StopBefore,
    StopAfter,
    HandleBranch,
    Ret,
}

/// Client callbacks driving the simulator, mirroring `ksim_stop_fn` /
/// `ksim_handle_branch_fn` in `memctl/aarch64/ksim.h`.
pub trait SimClient {
    fn stop_before(&mut self, _sim: &Simulator, _ins: Instruction) -> bool {
        false
    }
    fn stop_after(&mut self, _sim: &Simulator, _ins: Instruction) -> bool {
        false
    }
    /// Returning `None` lets the simulator apply its default rule (see
    /// [`Simulator`]'s doc comment).
    fn handle_branch(
        &mut self,
        _sim: &Simulator,
        _ins: Instruction,
        _branch_address: u64,
        _condition: BranchCondition,
    ) -> Option<BranchDecision> {
        None
    }
}

/// A no-op client: every default rule from `memctl/aarch64/ksim.h` applies
/// unmodified. Useful for simple "walk until RET" scans.
pub struct DefaultClient;
impl SimClient for DefaultClient {}

/// The AArch64 kernel/kext simulator.
///
/// All general-purpose register values are initially unknown. No memory
/// state is maintained; loads always produce unknown values and stores are
/// assumed to succeed. Default branch handling (when the client's
/// `handle_branch` returns `None`): unconditional `B` is taken; `BL` and
/// conditional branches are not; `RET` is terminal and ends the simulation.
pub struct Simulator<'code> {
    code: &'code [u8],
    code_address: u64,
    pc: u64,
    regs: RegisterFile,
    instruction_count: usize,
    max_instruction_count: usize,
}

impl<'code> Simulator<'code> {
    pub fn new(code: &'code [u8], code_address: u64, pc: u64, max_instruction_count: usize) -> Simulator<'code> {
        Simulator {
            code,
            code_address,
            pc,
            regs: RegisterFile::new(),
            instruction_count: 0,
            max_instruction_count,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    pub fn reg(&self, reg: GpReg) -> Option<u64> {
        self.regs.get(reg).known()
    }

    fn fetch(&self, pc: u64) -> Result<u32, SimError> {
        if pc < self.code_address {
            return Err(SimError::PcOutOfRange(pc));
        }
        let offset = (pc - self.code_address) as usize;
        let bytes = self
            .code
            .get(offset..offset + 4)
            .ok_or(SimError::PcOutOfRange(pc))?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Runs until a client stop condition fires, the instruction budget is
    /// exhausted, or `RET` is reached.
    pub fn run(
        &mut self,
        client: &mut dyn SimClient,
        interrupted: &AtomicBool,
    ) -> Result<StopReason, SimError> {
        loop {
            if interrupted.load(Ordering::Relaxed) {
                return Err(SimError::Interrupted);
            }
            if self.instruction_count >= self.max_instruction_count {
                return Err(SimError::BudgetExhausted(self.max_instruction_count));
            }
            let word = self.fetch(self.pc)?;
            let Some(ins) = aarch64::decode(word, self.pc) else {
                // Unmodeled encoding: conservative unknown
                self.regs.clear_all();
                self.pc += 4;
                self.instruction_count += 1;
                continue;
            };

            if client.stop_before(self, ins) {
                return Ok(StopReason::StopBefore);
            }

            if let Some(reason) = self.step(ins, client)? {
                return Ok(reason);
            }

            self.instruction_count += 1;
            if client.stop_after(self, ins) {
                return Ok(StopReason::StopAfter);
            }
        }
    }

    /// Executes one instruction, returning `Some(reason)` if simulation
    /// should stop (branch handling said so, or `RET` was reached).
    fn step(&mut self, ins: Instruction, client: &mut dyn SimClient) -> Result<Option<StopReason>, SimError> {
        match ins {
            Instruction::Nop => {
                self.pc += 4;
            }
            Instruction::Adr { rd, target, .. } => {
                self.regs.set(rd, RegValue::Known(target));
                self.pc += 4;
            }
            Instruction::MovWide { variant, rd, imm, shift } => {
                let imm = (imm as u64) << shift;
                let value = match variant {
                    MovVariant::Movz => RegValue::Known(imm),
                    MovVariant::Movn => RegValue::Known(!imm),
                    MovVariant::Movk => match self.regs.get(rd) {
                        RegValue::Known(old) => {
                            let mask = 0xffffu64 << shift;
                            RegValue::Known((old & !mask) | imm)
                        }
                        RegValue::Unknown => RegValue::Unknown,
                    },
                };
                self.regs.set(rd, value);
                self.pc += 4;
            }
            Instruction::AddSubImmediate { add, rd, rn, imm, shift, .. } => {
                let imm = (imm as u64) << shift;
                let a = self.regs.get(rn);
                let value = match a {
                    RegValue::Known(a) => RegValue::Known(if add { a.wrapping_add(imm) } else { a.wrapping_sub(imm) }),
                    RegValue::Unknown => RegValue::Unknown,
                };
                self.regs.set(rd, value);
                self.pc += 4;
            }
            Instruction::AddSubShiftedReg { add, rd, rn, rm, shift, amount, .. } => {
                let rm_val = apply_shift(self.regs.get(rm), shift, amount);
                let value = RegValue::map2(self.regs.get(rn), rm_val, |a, b| {
                    if add { a.wrapping_add(b) } else { a.wrapping_sub(b) }
                });
                self.regs.set(rd, value);
                self.pc += 4;
            }
            Instruction::LogicalImmediate { op, rd, rn, imm, .. } => {
                let value = match self.regs.get(rn) {
                    RegValue::Known(a) => RegValue::Known(apply_logical(op, a, imm)),
                    RegValue::Unknown => RegValue::Unknown,
                };
                self.regs.set(rd, value);
                self.pc += 4;
            }
            Instruction::LogicalShiftedReg { op, invert, rd, rn, rm, shift, amount, .. } => {
                let rm_val = apply_shift(self.regs.get(rm), shift, amount);
                let rm_val = if invert {
                    match rm_val {
                        RegValue::Known(v) => RegValue::Known(!v),
                        RegValue::Unknown => RegValue::Unknown,
                    }
                } else {
                    rm_val
                };
                let value = RegValue::map2(self.regs.get(rn), rm_val, |a, b| apply_logical(op, a, b));
                self.regs.set(rd, value);
                self.pc += 4;
            }
            Instruction::Branch { link, target } => {
                let condition = BranchCondition::Unknown;
                let decision = client
                    .handle_branch(self, ins, target, condition)
                    .unwrap_or(BranchDecision { take: !link, stop: false });
                if link {
                    self.regs.clear_temporaries();
                }
                self.pc = if decision.take { target } else { self.pc + 4 };
                if decision.stop {
                    return Ok(Some(StopReason::HandleBranch));
                }
            }
            Instruction::CompareAndBranch { rt, target, nonzero, .. } => {
                let condition = match self.regs.get(rt) {
                    RegValue::Known(0) => {
                        if nonzero {
                            BranchCondition::False
                        } else {
                            BranchCondition::True
                        }
                    }
                    RegValue::Known(_) => {
                        if nonzero {
                            BranchCondition::True
                        } else {
                            BranchCondition::False
                        }
                    }
                    RegValue::Unknown => BranchCondition::Unknown,
                };
                let decision = client
                    .handle_branch(self, ins, target, condition)
                    .unwrap_or(BranchDecision { take: false, stop: false });
                self.pc = if decision.take { target } else { self.pc + 4 };
                if decision.stop {
                    return Ok(Some(StopReason::HandleBranch));
                }
            }
            Instruction::BranchRegister { ret, link, rn } => {
                if ret {
                    return Ok(Some(StopReason::Ret));
                }
                let target = self.regs.get(rn);
                let condition = BranchCondition::Unknown;
                let decision = client
                    .handle_branch(self, ins, target.known().unwrap_or(0), condition)
                    .unwrap_or(BranchDecision { take: !link, stop: false });
                if link {
                    self.regs.clear_temporaries();
                }
                if decision.take {
                    match target.known() {
                        Some(addr) => self.pc = addr,
                        None => return Err(SimError::PcOutOfRange(0)),
                    }
                } else {
                    self.pc += 4;
                }
                if decision.stop {
                    return Ok(Some(StopReason::HandleBranch));
                }
            }
            Instruction::LoadStoreImmediate { load, rt, .. } => {
                if load {
                    self.regs.set(rt, RegValue::Unknown);
                }
                self.pc += 4;
            }
            Instruction::LoadStoreRegister { load, rt, .. } => {
                if load {
                    self.regs.set(rt, RegValue::Unknown);
                }
                self.pc += 4;
            }
            Instruction::LoadLiteral { rt, .. } => {
                self.regs.set(rt, RegValue::Unknown);
                self.pc += 4;
            }
            Instruction::LoadStorePair { load, rt1, rt2, .. } => {
                if load {
                    self.regs.set(rt1, RegValue::Unknown);
                    self.regs.set(rt2, RegValue::Unknown);
                }
                self.pc += 4;
            }
            Instruction::AddSubCarry { .. } | Instruction::AddSubExtendedReg { .. } => {
                // Not in the small set of families the finders actually
                // need; conservative clear.
                self.regs.clear_all();
                self.pc += 4;
            }
        }
        Ok(None)
    }
}

fn apply_shift(value: RegValue, shift: Shift, amount: u8) -> RegValue {
    match value {
        RegValue::Known(v) => RegValue::Known(match shift {
            Shift::Lsl => v.checked_shl(amount as u32).unwrap_or(0),
            Shift::Lsr => v.checked_shr(amount as u32).unwrap_or(0),
            Shift::Asr => ((v as i64) >> amount.min(63)) as u64,
            Shift::Ror => v.rotate_right(amount as u32),
        }),
        RegValue::Unknown => RegValue::Unknown,
    }
}

fn apply_logical(op: LogicalOp, a: u64, b: u64) -> u64 {
    match op {
        LogicalOp::And => a & b,
        LogicalOp::Orr => a | b,
        LogicalOp::Eor => a ^ b,
    }
}

/// Runs the simulator from `pc` with no client until `RET`, a decode
/// failure aside, collecting nothing but the final register file. Used by
/// callers (e.g. the vtable finder's `getMetaClass` confirmation, §4.D.3)
/// that just want "the value in x0 when this short method returns".
pub fn run_until_return(
    code: &[u8],
    code_address: u64,
    pc: u64,
    max_instruction_count: usize,
    interrupted: &AtomicBool,
) -> Result<RegisterFile, SimError> {
    let mut sim = Simulator::new(code, code_address, pc, max_instruction_count);
    sim.run(&mut DefaultClient, interrupted)?;
    Ok(sim.regs().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_movz_x0(imm: u16) -> u32 {
        0xd280_0000 | (imm as u32) << 5
    }

    #[test]
    fn movz_then_ret_is_known() {
        let ret = 0xd65f_03c0u32;
        let mut code = Vec::new();
        code.extend_from_slice(&encode_movz_x0(42).to_le_bytes());
        code.extend_from_slice(&ret.to_le_bytes());
        let flag = AtomicBool::new(false);
        let regs = run_until_return(&code, 0, 0, 256, &flag).expect("simulation");
        assert_eq!(regs.get(GpReg::new(0, Width::W64, true)).known(), Some(42));
    }

    #[test]
    fn unmodeled_instruction_clears_all_known_bits() {
        // ADC clears the whole file (not in the modeled set).
        let adc = 0x9a00_0000u32; // adc x0, x0, x0
        let ret = 0xd65f_03c0u32;
        let mut code = Vec::new();
        code.extend_from_slice(&encode_movz_x0(7).to_le_bytes());
        code.extend_from_slice(&adc.to_le_bytes());
        code.extend_from_slice(&ret.to_le_bytes());
        let flag = AtomicBool::new(false);
        let regs = run_until_return(&code, 0, 0, 256, &flag).expect("simulation");
        assert_eq!(regs.get(GpReg::new(0, Width::W64, true)).known(), None);
    }

    #[test]
    fn interrupted_flag_aborts() {
        let code = vec![0; 4096];
        let flag = AtomicBool::new(true);
        let mut sim = Simulator::new(&code, 0, 0, 1000);
        let err = sim.run(&mut DefaultClient, &flag).unwrap_err();
        assert!(matches!(err, SimError::Interrupted));
    }
}

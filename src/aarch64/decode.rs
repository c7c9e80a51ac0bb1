//! Component A: the AArch64 instruction decoder.
//!
//! Decoding is pure: no I/O, no state. Each family is checked as a
//! `(mask, bits)` pair against the instruction word; on a match the fields
//! are extracted and normalized into [`Instruction`]. Families are tried in
//! the order listed in `memctl/aarch64/disasm.h`.

use super::bitmask::decode_bit_masks;
use super::reg::{Extend, ExtendKind, GpReg, Shift, Width};

/// One decoded instruction, normalized so that alias forms (`MOV`, `CMP`,
/// `TST`, `NEG`, ...) are recognized via predicate methods rather than
/// being separate variants "Decoded instruction"
/// record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    /// ADC/SBC (add/sub with carry).
    AddSubCarry {
        add: bool,
        setflags: bool,
        rd: GpReg,
        rn: GpReg,
        rm: GpReg,
    },
    /// ADD/SUB (extended register).
    AddSubExtendedReg {
        add: bool,
        setflags: bool,
        rd: GpReg,
        rn: GpReg,
        rm: GpReg,
        extend: Extend,
        amount: u8,
    },
    /// ADD/SUB (immediate).
    AddSubImmediate {
        add: bool,
        setflags: bool,
        rd: GpReg,
        rn: GpReg,
        imm: u16,
        shift: u8,
    },
    /// AND/ORR/EOR (immediate).
    LogicalImmediate {
        op: LogicalOp,
        setflags: bool,
        rd: GpReg,
        rn: GpReg,
        imm: u64,
    },
    /// AND/ORR/EOR (shifted register).
    LogicalShiftedReg {
        op: LogicalOp,
        setflags: bool,
        invert: bool,
        rd: GpReg,
        rn: GpReg,
        rm: GpReg,
        shift: Shift,
        amount: u8,
    },
    /// ADD/SUB (shifted register).
    AddSubShiftedReg {
        add: bool,
        setflags: bool,
        rd: GpReg,
        rn: GpReg,
        rm: GpReg,
        shift: Shift,
        amount: u8,
    },
    /// ADR/ADRP. `target` is already the absolute, page-adjusted address.
    Adr { is_adrp: bool, rd: GpReg, target: u64 },
    /// MOVZ/MOVN/MOVK.
    MovWide {
        variant: MovVariant,
        rd: GpReg,
        imm: u16,
        shift: u8,
    },
    /// B/BL. `target` is absolute.
    Branch { link: bool, target: u64 },
    /// BR/BLR/RET.
    BranchRegister { ret: bool, link: bool, rn: GpReg },
    /// CBZ/CBNZ. `target` is absolute.
    CompareAndBranch { nonzero: bool, rt: GpReg, target: u64 },
    /// LDP/STP and their non-temporal variants.
    LoadStorePair {
        load: bool,
        size: LdpSize,
        writeback: bool,
        post_index: bool,
        signed: bool,
        non_temporal: bool,
        rt1: GpReg,
        rt2: GpReg,
        rn: GpReg,
        imm: i16,
    },
    /// LDR/STR, immediate forms (pre-/post-index and unsigned offset).
    LoadStoreImmediate {
        load: bool,
        size: u8,
        sign_extend: bool,
        writeback: bool,
        post_index: bool,
        rt: GpReg,
        rn: GpReg,
        imm: i32,
    },
    /// LDR (literal). `target` is absolute.
    LoadLiteral { rt: GpReg, target: u64 },
    /// LDR/STR, register-offset form.
    LoadStoreRegister {
        load: bool,
        size: u8,
        sign_extend: bool,
        rt: GpReg,
        rn: GpReg,
        rm: GpReg,
        extend: Extend,
        amount: u8,
    },
    /// NOP.
    Nop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Orr,
    Eor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovVariant {
    Movz,
    Movn,
    Movk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdpSize {
    Word,
    DoubleWord,
}

fn bits(word: u32, hi: u32, lo: u32) -> u32 {
    (word >> lo) & ((1u32 << (hi - lo + 1)) - 1)
}

fn bit(word: u32, n: u32) -> bool {
    (word >> n) & 1 != 0
}

fn sign_extend(value: u32, bits_wide: u32) -> i64 {
    let shift = 64 - bits_wide;
    ((value as u64) << shift) as i64 >> shift
}

fn gpreg(word: u32, lo: u32, width: Width, zr: bool) -> GpReg {
    GpReg::new(bits(word, lo + 4, lo) as u8, width, zr)
}

/// Decodes one 32-bit little-endian-encoded AArch64 instruction word.
///
/// Returns `None` for any encoding this decoder does not implement or that
/// is architecturally reserved "Failure modes".
pub fn decode(ins: u32, pc: u64) -> Option<Instruction> {
    let decoded = decode_nop(ins)
        .or_else(|| decode_ldr_literal(ins, pc))
        .or_else(|| decode_branch(ins, pc))
        .or_else(|| decode_branch_register(ins))
        .or_else(|| decode_compare_and_branch(ins, pc))
        .or_else(|| decode_adr(ins, pc))
        .or_else(|| decode_mov_wide(ins))
        .or_else(|| decode_add_sub_carry(ins))
        .or_else(|| decode_add_sub_immediate(ins))
        .or_else(|| decode_logical_immediate(ins))
        .or_else(|| decode_add_sub_extended_reg(ins))
        .or_else(|| decode_add_sub_shifted_reg(ins))
        .or_else(|| decode_logical_shifted_reg(ins))
        .or_else(|| decode_load_store_pair(ins))
        .or_else(|| decode_load_store_register_offset(ins))
        .or_else(|| decode_load_store_immediate(ins));
    if decoded.is_none() {
        log::trace!("no known family matches instruction word {ins:#010x} at pc {pc:#x}");
    }
    decoded
}

fn width_of(sf: bool) -> Width {
    if sf { Width::W64 } else { Width::W32 }
}

fn decode_nop(ins: u32) -> Option<Instruction> {
    if ins == 0xd503201f {
        Some(Instruction::Nop)
    } else {
        None
    }
}

fn decode_add_sub_carry(ins: u32) -> Option<Instruction> {
    // sf op S 1 1010 000 Rm 000000 Rn Rd
    if bits(ins, 28, 21) != 0b11010000 || bits(ins, 15, 10) != 0 {
        return None;
    }
    let sf = bit(ins, 31);
    let op = bit(ins, 30);
    let setflags = bit(ins, 29);
    let width = width_of(sf);
    Some(Instruction::AddSubCarry {
        add: !op,
        setflags,
        rd: gpreg(ins, 0, width, true),
        rn: gpreg(ins, 5, width, true),
        rm: gpreg(ins, 16, width, true),
    })
}

fn decode_add_sub_immediate(ins: u32) -> Option<Instruction> {
    // sf op S 100010 sh imm12 Rn Rd
    if bits(ins, 28, 23) != 0b100010 {
        return None;
    }
    let sf = bit(ins, 31);
    let op = bit(ins, 30);
    let setflags = bit(ins, 29);
    let sh = bit(ins, 22);
    if sh && !sf {
        return None; // sf=0 forbids shift=12, architectural constraint
    }
    let imm = bits(ins, 21, 10) as u16;
    let width = width_of(sf);
    // Rd may be SP (when setflags is false); Rn may be SP always.
    let rd = gpreg(ins, 0, width, setflags);
    let rn = gpreg(ins, 5, width, false);
    Some(Instruction::AddSubImmediate {
        add: !op,
        setflags,
        rd,
        rn,
        imm,
        shift: if sh { 12 } else { 0 },
    })
}

fn decode_logical_immediate(ins: u32) -> Option<Instruction> {
    // sf opc 100100 N immr imms Rn Rd
    if bits(ins, 28, 23) != 0b100100 {
        return None;
    }
    let sf = bit(ins, 31);
    let opc = bits(ins, 30, 29);
    let n = bit(ins, 22) as u8;
    if !sf && n != 0 {
        return None; // N=1 reserved when sf=0
    }
    let immr = bits(ins, 21, 16) as u8;
    let imms = bits(ins, 15, 10) as u8;
    let masks = decode_bit_masks(sf, n, imms, immr, true)?;
    let width = width_of(sf);
    let op = match opc {
        0b00 => LogicalOp::And,
        0b01 => LogicalOp::Orr,
        0b10 => LogicalOp::Eor,
        _ => LogicalOp::And, // ANDS, setflags carries the distinction
    };
    let setflags = opc == 0b11;
    // ORR immediate permits Rd == SP; AND/ANDS/EOR do not.
    let rd_is_sp_eligible = matches!(op, LogicalOp::Orr) && !setflags;
    Some(Instruction::LogicalImmediate {
        op,
        setflags,
        rd: gpreg(ins, 0, width, !rd_is_sp_eligible),
        rn: gpreg(ins, 5, width, true),
        imm: masks.wmask,
    })
}

fn decode_add_sub_extended_reg(ins: u32) -> Option<Instruction> {
    // sf op S 01011 00 1 Rm option imm3 Rn Rd
    if bits(ins, 28, 21) != 0b01011001 || bits(ins, 15, 13) > 0b100 {
        return None;
    }
    let opt = bits(ins, 23, 22);
    if opt != 0 {
        return None; // only the extended-register form (opt=00) is decoded here
    }
    let sf = bit(ins, 31);
    let op = bit(ins, 30);
    let setflags = bit(ins, 29);
    let amount = bits(ins, 12, 10) as u8;
    if amount > 4 {
        return None;
    }
    let extend_bits = bits(ins, 15, 13) as u8;
    let width = width_of(sf);
    let preferred_lsl = (extend_bits == 0b011 && sf) || (extend_bits == 0b010 && !sf);
    let rm_width = if extend_bits & 0b001 != 0 { Width::W64 } else { Width::W32 };
    Some(Instruction::AddSubExtendedReg {
        add: !op,
        setflags,
        rd: gpreg(ins, 0, width, setflags),
        rn: gpreg(ins, 5, width, false),
        rm: gpreg(ins, 16, rm_width, false),
        extend: Extend::from_bits(extend_bits, width, preferred_lsl),
        amount,
    })
}

fn decode_add_sub_shifted_reg(ins: u32) -> Option<Instruction> {
    // sf op S 01011 shift 0 Rm imm6 Rn Rd
    if bits(ins, 28, 24) != 0b01011 || bit(ins, 21) {
        return None;
    }
    let shift_bits = bits(ins, 23, 22) as u8;
    if shift_bits == 0b11 {
        return None; // reserved
    }
    let sf = bit(ins, 31);
    let op = bit(ins, 30);
    let setflags = bit(ins, 29);
    let amount = bits(ins, 15, 10) as u8;
    if !sf && amount > 31 {
        return None;
    }
    let width = width_of(sf);
    Some(Instruction::AddSubShiftedReg {
        add: !op,
        setflags,
        rd: gpreg(ins, 0, width, true),
        rn: gpreg(ins, 5, width, true),
        rm: gpreg(ins, 16, width, true),
        shift: Shift::from_bits(shift_bits),
        amount,
    })
}

fn decode_logical_shifted_reg(ins: u32) -> Option<Instruction> {
    // sf opc 01010 shift N Rm imm6 Rn Rd
    if bits(ins, 28, 24) != 0b01010 {
        return None;
    }
    let sf = bit(ins, 31);
    let opc = bits(ins, 30, 29);
    let shift_bits = bits(ins, 23, 22) as u8;
    let n = bit(ins, 21);
    let amount = bits(ins, 15, 10) as u8;
    if !sf && amount > 31 {
        return None;
    }
    let width = width_of(sf);
    let (op, setflags) = match (opc, n) {
        (0b00, false) => (LogicalOp::And, false),
        (0b00, true) => (LogicalOp::And, false), // BIC: invert=true carries the distinction
        (0b01, false) => (LogicalOp::Orr, false),
        (0b01, true) => (LogicalOp::Orr, false), // ORN
        (0b10, false) => (LogicalOp::Eor, false),
        (0b10, true) => (LogicalOp::Eor, false), // EON
        (0b11, false) => (LogicalOp::And, true), // ANDS
        _ => (LogicalOp::And, true),              // BICS
    };
    Some(Instruction::LogicalShiftedReg {
        op,
        setflags,
        invert: n,
        rd: gpreg(ins, 0, width, true),
        rn: gpreg(ins, 5, width, true),
        rm: gpreg(ins, 16, width, true),
        shift: Shift::from_bits(shift_bits),
        amount,
    })
}

fn decode_adr(ins: u32, pc: u64) -> Option<Instruction> {
    // op immlo 10000 immhi Rd
    if bits(ins, 28, 24) != 0b10000 {
        return None;
    }
    let is_adrp = bit(ins, 31);
    let immlo = bits(ins, 30, 29) as u64;
    let immhi = bits(ins, 23, 5) as u64;
    let imm21 = (immhi << 2) | immlo;
    let offset = sign_extend(imm21 as u32, 21);
    let rd = gpreg(ins, 0, Width::W64, true);
    let target = if is_adrp {
        let page = (pc as i64) & !0xfff;
        (page + (offset << 12)) as u64
    } else {
        (pc as i64 + offset) as u64
    };
    Some(Instruction::Adr { is_adrp, rd, target })
}

fn decode_mov_wide(ins: u32) -> Option<Instruction> {
    // sf opc 100101 hw imm16 Rd
    if bits(ins, 28, 23) != 0b100101 {
        return None;
    }
    let sf = bit(ins, 31);
    let opc = bits(ins, 30, 29);
    if opc == 0b01 {
        return None; // reserved
    }
    let hw = bits(ins, 22, 21);
    if !sf && hw > 1 {
        return None;
    }
    let imm = bits(ins, 20, 5) as u16;
    let shift = (hw * 16) as u8;
    let variant = match opc {
        0b00 => MovVariant::Movn,
        0b10 => MovVariant::Movz,
        _ => MovVariant::Movk,
    };
    let width = width_of(sf);
    Some(Instruction::MovWide {
        variant,
        rd: gpreg(ins, 0, width, true),
        imm,
        shift,
    })
}

fn decode_branch(ins: u32, pc: u64) -> Option<Instruction> {
    // op 00101 imm26
    if bits(ins, 30, 26) != 0b00101 {
        return None;
    }
    let link = bit(ins, 31);
    let imm26 = bits(ins, 25, 0);
    let offset = sign_extend(imm26, 26) << 2;
    Some(Instruction::Branch {
        link,
        target: (pc as i64 + offset) as u64,
    })
}

fn decode_branch_register(ins: u32) -> Option<Instruction> {
    // 1101011 opc 00000 11111 000000 Rn 00000 (for BR/BLR/RET)
    if bits(ins, 31, 25) != 0b1101011 || bits(ins, 20, 16) != 0b11111 || bits(ins, 9, 0) != 0 {
        return None;
    }
    let opc = bits(ins, 24, 21);
    let (ret, link) = match opc {
        0b0000 => (false, false), // BR
        0b0001 => (false, true),  // BLR
        0b0010 => (true, false),  // RET
        _ => return None,
    };
    Some(Instruction::BranchRegister {
        ret,
        link,
        rn: gpreg(ins, 5, Width::W64, true),
    })
}

fn decode_compare_and_branch(ins: u32, pc: u64) -> Option<Instruction> {
    // sf 011010 op imm19 Rt
    if bits(ins, 30, 25) != 0b011010 {
        return None;
    }
    let sf = bit(ins, 31);
    let nonzero = bit(ins, 24);
    let imm19 = bits(ins, 23, 5);
    let offset = sign_extend(imm19, 19) << 2;
    let width = width_of(sf);
    Some(Instruction::CompareAndBranch {
        nonzero,
        rt: gpreg(ins, 0, width, true),
        target: (pc as i64 + offset) as u64,
    })
}

fn decode_ldr_literal(ins: u32, pc: u64) -> Option<Instruction> {
    // opc 011 V 00 imm19 Rt ; only the plain-integer forms (V=0) are decoded
    if bits(ins, 29, 24) != 0b011000 || bit(ins, 26) {
        return None;
    }
    let opc = bits(ins, 31, 30);
    if opc == 0b11 {
        return None; // PRFM, not a load we model
    }
    let imm19 = bits(ins, 23, 5);
    let offset = sign_extend(imm19, 19) << 2;
    Some(Instruction::LoadLiteral {
        rt: gpreg(ins, 0, Width::W64, true),
        target: (pc as i64 + offset) as u64,
    })
}

fn decode_load_store_pair(ins: u32) -> Option<Instruction> {
    // opc V 101 0 xxx L imm7 Rt2 Rn Rt1, V=0 (general-purpose)
    if bits(ins, 29, 27) != 0b101 || bit(ins, 26) {
        return None;
    }
    let opc = bits(ins, 31, 30);
    let class = bits(ins, 25, 23);
    let (post_index, writeback) = match class {
        0b010 => (false, false), // signed offset, no writeback
        0b001 => (true, true),   // post-index
        0b011 => (false, true),  // pre-index
        _ => return None,
    };
    if opc == 0b01 {
        return None; // reserved for integer LDP/STP
    }
    let size = if opc == 0b10 { LdpSize::DoubleWord } else { LdpSize::Word };
    let signed = bit(ins, 30) && opc == 0b01;
    let load = bit(ins, 22);
    let imm7 = bits(ins, 21, 15);
    let scale = if size == LdpSize::DoubleWord { 3 } else { 2 };
    let imm = (sign_extend(imm7, 7) << scale) as i16;
    let width = if size == LdpSize::DoubleWord { Width::W64 } else { Width::W32 };
    Some(Instruction::LoadStorePair {
        load,
        size,
        writeback,
        post_index,
        signed,
        non_temporal: false,
        rt1: gpreg(ins, 0, width, true),
        rt2: gpreg(ins, 10, width, true),
        rn: gpreg(ins, 5, Width::W64, false),
        imm,
    })
}

fn decode_load_store_immediate(ins: u32) -> Option<Instruction> {
    // V=0 general-purpose loads/stores only; bit 24 distinguishes the
    // unsigned-offset class (imm12) from the unscaled/pre/post-index class
    // (imm9), which in turn uses bits[11:10] to pick pre/post-index vs the
    // register-offset form (handled by `decode_load_store_register_offset`).
    if bits(ins, 29, 27) != 0b111 || bit(ins, 26) {
        return None;
    }
    let size = bits(ins, 31, 30) as u8;
    let opc = bits(ins, 23, 22);
    let (load, sign_extend_flag) = match opc {
        0b00 => (false, false),
        0b01 => (true, false),
        0b10 if size < 0b11 => (true, true), // LDRSW/LDRSB/LDRSH (64-bit dest)
        _ => return None,
    };
    let rt_width = if size == 0b11 { Width::W64 } else { Width::W32 };
    let rn = gpreg(ins, 5, Width::W64, false);

    if bit(ins, 24) {
        // unsigned-offset form, imm12 scaled by size
        let imm12 = bits(ins, 21, 10);
        let imm = (imm12 << size) as i32;
        return Some(Instruction::LoadStoreImmediate {
            load,
            size,
            sign_extend: sign_extend_flag,
            writeback: false,
            post_index: false,
            rt: gpreg(ins, 0, rt_width, true),
            rn,
            imm,
        });
    }

    let sub_class = bits(ins, 11, 10);
    if sub_class != 0b01 && sub_class != 0b11 {
        return None; // 00 = unscaled immediate (not modeled), 10 = register offset
    }
    let post_index = sub_class == 0b01;
    let imm9 = bits(ins, 20, 12);
    let imm = sign_extend(imm9, 9) as i32;
    Some(Instruction::LoadStoreImmediate {
        load,
        size,
        sign_extend: sign_extend_flag,
        writeback: true,
        post_index,
        rt: gpreg(ins, 0, rt_width, true),
        rn,
        imm,
    })
}

fn decode_load_store_register_offset(ins: u32) -> Option<Instruction> {
    // size 111 V 00 opc 1 Rm option S 10 Rn Rt
    if bits(ins, 29, 27) != 0b111 || bit(ins, 26) || bit(ins, 24) || bits(ins, 11, 10) != 0b10 {
        return None;
    }
    let size = bits(ins, 31, 30) as u8;
    let opc = bits(ins, 23, 22);
    let (load, sign_extend_flag) = match opc {
        0b00 => (false, false),
        0b01 => (true, false),
        0b10 if size < 0b11 => (true, true),
        _ => return None,
    };
    let option = bits(ins, 15, 13) as u8;
    if option & 0b010 == 0 {
        return None; // option must select W or X (sxtw/uxtw/lsl/sxtx)
    }
    let s = bit(ins, 12);
    let rt_width = if size == 0b11 { Width::W64 } else { Width::W32 };
    let rm_width = if option & 0b001 != 0 { Width::W64 } else { Width::W32 };
    let preferred_lsl = option == 0b011;
    Some(Instruction::LoadStoreRegister {
        load,
        size,
        sign_extend: sign_extend_flag,
        rt: gpreg(ins, 0, rt_width, true),
        rn: gpreg(ins, 5, Width::W64, false),
        rm: gpreg(ins, 16, rm_width, true),
        extend: Extend::from_bits(option, rm_width, preferred_lsl),
        amount: if s { size } else { 0 },
    })
}

impl Instruction {
    /// `CMN`/`CMP` alias: an `ADDS`/`SUBS` whose destination is discarded.
    pub fn is_cmn_or_cmp(&self) -> bool {
        matches!(self,
            Instruction::AddSubImmediate { setflags: true, rd, .. }
            | Instruction::AddSubShiftedReg { setflags: true, rd, .. }
            | Instruction::AddSubExtendedReg { setflags: true, rd, .. }
            if rd.is_zr())
    }

    /// `TST` alias: an `ANDS` whose destination is discarded.
    pub fn is_tst(&self) -> bool {
        matches!(self, Instruction::LogicalImmediate { op: LogicalOp::And, setflags: true, rd, .. } if rd.is_zr())
            || matches!(self, Instruction::LogicalShiftedReg { op: LogicalOp::And, setflags: true, rd, .. } if rd.is_zr())
    }

    /// `MOV (to/from SP)` alias: an `ADD` immediate of zero touching `SP`.
    pub fn is_mov_to_or_from_sp(&self) -> bool {
        matches!(self, Instruction::AddSubImmediate { add: true, imm: 0, shift: 0, rd, rn, .. }
            if rd.is_sp() || rn.is_sp())
    }

    /// `MOV (register)` alias: `ORR` shifted-register with `Rn == XZR` and a
    /// zero `LSL` shift.
    pub fn is_mov_register(&self) -> bool {
        matches!(self, Instruction::LogicalShiftedReg {
            op: LogicalOp::Orr, invert: false, shift: Shift::Lsl, amount: 0, rn, ..
        } if rn.is_zr())
    }

    /// `MOV (wide immediate)`: preferred alias of `MOVZ`.
    pub fn is_mov_wide_immediate(&self) -> bool {
        matches!(self, Instruction::MovWide { variant: MovVariant::Movz, .. })
    }

    /// `MOV (inverted wide immediate)`: preferred alias of `MOVN`, except
    /// where `MOVZ` would also apply (handled by `is_mov_wide_immediate`).
    pub fn is_mov_inverted_wide_immediate(&self) -> bool {
        matches!(self, Instruction::MovWide { variant: MovVariant::Movn, .. })
    }

    /// `MOV (bitmask immediate)`: preferred alias of `ORR` immediate with
    /// `Rn == XZR`, for immediates that cannot be expressed as a `MOVZ`/
    /// `MOVN` wide immediate.
    pub fn is_mov_bitmask(&self) -> bool {
        matches!(self, Instruction::LogicalImmediate { op: LogicalOp::Orr, setflags: false, rn, .. } if rn.is_zr())
    }

    /// `NEG`/`NEGS` alias: `SUB`/`SUBS` with `Rn == XZR`.
    pub fn is_neg_or_negs(&self) -> bool {
        matches!(self, Instruction::AddSubShiftedReg { add: false, rn, .. } if rn.is_zr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nop() {
        assert_eq!(decode(0xd503201f, 0), Some(Instruction::Nop));
    }

    #[test]
    fn decodes_ret() {
        let ins = decode(0xd65f03c0, 0).expect("RET");
        match ins {
            Instruction::BranchRegister { ret, link, rn } => {
                assert!(ret);
                assert!(!link);
                assert_eq!(rn.number(), 30);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_movz() {
        // movz x0, #0x1234
        let ins = decode(0xd2824680, 0).expect("MOVZ");
        match ins {
            Instruction::MovWide { variant, imm, shift, .. } => {
                assert_eq!(variant, MovVariant::Movz);
                assert_eq!(imm, 0x1234);
                assert_eq!(shift, 0);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_bl_absolute_target() {
        // bl #0x100 from pc=0x1000 -> target 0x1100
        let word = 0x9400_0040u32; // bl +0x100 (imm26 = 0x40 words)
        let ins = decode(word, 0x1000).expect("BL");
        match ins {
            Instruction::Branch { link, target } => {
                assert!(link);
                assert_eq!(target, 0x1100);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn mov_register_alias_recognized() {
        // mov x1, x2  == orr x1, xzr, x2
        let word = 0xaa0203e1u32;
        let ins = decode(word, 0).expect("ORR (MOV alias)");
        assert!(ins.is_mov_register());
    }
}

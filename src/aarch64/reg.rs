//! Register identifiers and shift/extend kinds.
//!
//! Mirrors the "newer libmemctl" encoding named in `memctl/aarch64/disasm.h`:
//! a 5-bit register number, a width bit, and a bit marking that register 31
//! is the zero register rather than the stack pointer in this context. See
//! DESIGN.md for why this encoding (and not the older `src/aarch64/disasm.c`
//! one) was chosen.

const NUMBER_MASK: u8 = 0x1f;
const WIDTH_BIT: u8 = 0x20;
const ZR_BIT: u8 = 0x40;

/// General-purpose register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W32,
    W64,
}

/// A decoded AArch64 general-purpose register reference.
///
/// `31` is ambiguous in the architecture: it means the stack pointer in some
/// contexts and the zero register in others. The decoder resolves this at
/// decode time so callers never have to know which instruction family they
/// came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpReg(u8);

impl GpReg {
    pub const SP: GpReg = GpReg(31 | WIDTH_BIT);

    /// Builds a register reference from a raw 5-bit field, a width bit
    /// (`sf`), and whether 31 should be read as the zero register in this
    /// instruction's context.
    pub fn new(number: u8, width: Width, zr: bool) -> GpReg {
        debug_assert!(number <= 31);
        let mut bits = number & NUMBER_MASK;
        if width == Width::W64 {
            bits |= WIDTH_BIT;
        }
        if number == 31 && zr {
            bits |= ZR_BIT;
        }
        GpReg(bits)
    }

    pub fn number(self) -> u8 {
        self.0 & NUMBER_MASK
    }

    pub fn width(self) -> Width {
        if self.0 & WIDTH_BIT != 0 {
            Width::W64
        } else {
            Width::W32
        }
    }

    pub fn is_zr(self) -> bool {
        self.number() == 31 && self.0 & ZR_BIT != 0
    }

    pub fn is_sp(self) -> bool {
        self.number() == 31 && self.0 & ZR_BIT == 0
    }
}

impl std::fmt::Display for GpReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_sp() {
            return write!(f, "{}", if self.width() == Width::W64 { "sp" } else { "wsp" });
        }
        if self.is_zr() {
            return write!(f, "{}", if self.width() == Width::W64 { "xzr" } else { "wzr" });
        }
        let prefix = if self.width() == Width::W64 { 'x' } else { 'w' };
        write!(f, "{prefix}{}", self.number())
    }
}

/// Shift applied to a register operand (`LSL`, `LSR`, `ASR`, `ROR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shift {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl Shift {
    pub fn from_bits(bits: u8) -> Shift {
        match bits & 0b11 {
            0 => Shift::Lsl,
            1 => Shift::Lsr,
            2 => Shift::Asr,
            _ => Shift::Ror,
        }
    }
}

/// Extend kind used by add/sub (extended register) forms.
///
/// The `is_lsl` flag records that the disassembly should read `lsl #n`
/// rather than e.g. `uxtx #n` even though the underlying bit pattern is
/// `UXTX`/`SXTX` — a cosmetic distinction that doesn't change the
/// semantic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extend {
    kind: ExtendKind,
    pub is_lsl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtendKind {
    Uxtb,
    Uxth,
    Uxtw,
    Uxtx,
    Sxtb,
    Sxth,
    Sxtw,
    Sxtx,
}

impl Extend {
    pub fn from_bits(bits: u8, width: Width, amount_is_preferred_lsl: bool) -> Extend {
        let kind = match bits & 0b111 {
            0 => ExtendKind::Uxtb,
            1 => ExtendKind::Uxth,
            2 => ExtendKind::Uxtw,
            3 => ExtendKind::Uxtx,
            4 => ExtendKind::Sxtb,
            5 => ExtendKind::Sxth,
            6 => ExtendKind::Sxtw,
            _ => ExtendKind::Sxtx,
        };
        let canonical_lsl = matches!(
            (kind, width),
            (ExtendKind::Uxtw, Width::W32) | (ExtendKind::Uxtx, Width::W64)
        );
        Extend {
            kind,
            is_lsl: canonical_lsl && amount_is_preferred_lsl,
        }
    }

    pub fn kind(self) -> ExtendKind {
        self.kind
    }
}

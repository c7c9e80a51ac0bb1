//! Component E: the gadget catalog & scanner, grounded on
//! the `gadgets[]` table and `find_gadgets`/`find_gadgets_in_data` in
//! `examples/original_source/src/libmemctl/aarch64/kernel_call_aarch64.c:383-422`.
//!
//! The catalog is a fixed, statically declared table of short instruction
//! sequences, each ending in an indirect branch. Every entry's words are
//! carried over byte-for-byte from the `GADGET(...)` table; none are
//! re-derived or invented here.

use crate::soft_error::SoftErrorList;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

bitflags! {
    /// Segment protection bits, mirroring `VM_PROT_READ`/`VM_PROT_EXECUTE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

#[derive(Debug, Error)]
pub enum GadgetError {
    #[error("gadget {0:?} not found in any scanned segment")]
    NotFound(&'static str),
    #[error("scan was interrupted")]
    Interrupted,
}

/// One catalog entry: a human-readable name and the exact instruction
/// words that must match ("Gadget record" -- the write-once runtime
/// address is tracked separately in [`GadgetAddresses`] rather than
/// mutating this `const` data, which keeps the catalog `'static` and
/// `Sync`).
#[derive(Debug, Clone, Copy)]
pub struct Gadget {
    pub name: &'static str,
    pub words: &'static [u32],
}

static CATALOG: &[Gadget] = &[
    Gadget { name: "ldp x2, x1, [x1] ; br x2", words: &[0xa9400422, 0xd61f0040] },
    Gadget { name: "mov x12, x2 ; br x3", words: &[0xaa0203ec, 0xd61f0060] },
    Gadget { name: "mov x2, x30 ; br x12", words: &[0xaa1e03e2, 0xd61f0180] },
    Gadget { name: "mov x8, x4 ; br x5", words: &[0xaa0403e8, 0xd61f00a0] },
    Gadget { name: "mov x21, x2 ; br x8", words: &[0xaa0203f5, 0xd61f0100] },
    Gadget { name: "mov x20, x0 ; blr x8", words: &[0xaa0003f4, 0xd63f0100] },
    Gadget { name: "mov x10, x4 ; br x8", words: &[0xaa0403ea, 0xd61f0100] },
    Gadget { name: "mov x9, x10 ; br x8", words: &[0xaa0a03e9, 0xd61f0100] },
    Gadget { name: "mov x11, x9 ; br x8", words: &[0xaa0903eb, 0xd61f0100] },
    Gadget {
        name: "ldp x3, x4, [x20, #0x20] ; ldp x5, x6, [x20, #0x30] ; blr x8",
        words: &[0xa9421283, 0xa9431a85, 0xd63f0100],
    },
    Gadget { name: "add x20, x20, #0x34 ; br x8", words: &[0x9100d294, 0xd61f0100] },
    Gadget { name: "mov x22, x6 ; blr x8", words: &[0xaa0603f6, 0xd63f0100] },
    Gadget { name: "mov x24, x4 ; br x8", words: &[0xaa0403f8, 0xd61f0100] },
    Gadget { name: "mov x0, x3 ; blr x8", words: &[0xaa0303e0, 0xd63f0100] },
    Gadget { name: "mov x28, x0 ; blr x8", words: &[0xaa0003fc, 0xd63f0100] },
    Gadget { name: "mov x12, x3 ; br x8", words: &[0xaa0303ec, 0xd61f0100] },
    Gadget { name: "mov x0, x5 ; blr x8", words: &[0xaa0503e0, 0xd63f0100] },
    Gadget { name: "mov x9, x0 ; br x11", words: &[0xaa0003e9, 0xd61f0160] },
    Gadget { name: "mov x7, x9 ; blr x11", words: &[0xaa0903e7, 0xd63f0160] },
    Gadget { name: "mov x11, x24 ; br x8", words: &[0xaa1803eb, 0xd61f0100] },
    Gadget {
        name: "mov x1, x9 ; mov x2, x10 ; blr x11",
        words: &[0xaa0903e1, 0xaa0a03e2, 0xd63f0160],
    },
    Gadget { name: "mov x30, x28 ; br x12", words: &[0xaa1c03fe, 0xd61f0180] },
    Gadget {
        name: "ldp x8, x1, [x20, #0x10] ; blr x8",
        words: &[0xa9410688, 0xd63f0100],
    },
    Gadget {
        name: "str x0, [x20] ; ldr x8, [x22] ; ldr x8, [x8, #0x28] ; mov x0, x22 ; blr x8",
        words: &[0xf9000280, 0xf94002c8, 0xf9401508, 0xaa1603e0, 0xd63f0100],
    },
    Gadget { name: "mov x30, x21 ; br x8", words: &[0xaa1503fe, 0xd61f0100] },
    Gadget { name: "ret", words: &[0xd65f03c0] },
    Gadget { name: "mov x28, x2 ; blr x8", words: &[0xaa0203fc, 0xd63f0100] },
    Gadget { name: "mov x21, x5 ; blr x8", words: &[0xaa0503f5, 0xd63f0100] },
    Gadget { name: "mov x15, x5 ; br x11", words: &[0xaa0503ef, 0xd61f0160] },
    Gadget { name: "mov x17, x15 ; br x8", words: &[0xaa0f03f1, 0xd61f0100] },
    Gadget { name: "mov x30, x22 ; br x17", words: &[0xaa1603fe, 0xd61f0220] },
    Gadget {
        name: "str x0, [x20] ; ldr x8, [x21] ; ldr x8, [x8, #0x28] ; mov x0, x21 ; blr x8",
        words: &[0xf9000280, 0xf94002a8, 0xf9401508, 0xaa1503e0, 0xd63f0100],
    },
    Gadget { name: "mov x30, x28 ; br x8", words: &[0xaa1c03fe, 0xd61f0100] },
];

/// Returns the full gadget catalog.
pub fn catalog() -> &'static [Gadget] {
    CATALOG
}

/// The discovered runtime address of each catalog entry, by name. Write-
/// once: [`scan`] never revisits a name once found.
#[derive(Debug, Default)]
pub struct GadgetAddresses {
    found: HashMap<&'static str, u64>,
}

impl GadgetAddresses {
    pub fn get(&self, name: &str) -> Option<u64> {
        self.found.get(name).copied()
    }

    pub fn contains_all(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.found.contains_key(n))
    }
}

/// One segment of the kernel image eligible for scanning: executable and
/// readable ("whose `initprot & maxprot` includes both
/// read and execute").
pub struct ScannableSegment<'a> {
    pub runtime_address: u64,
    pub bytes: &'a [u8],
    pub init_prot: VmProt,
    pub max_prot: VmProt,
}

/// Linear-scans `segments` for every catalog entry not yet found. On a
/// match records `segment_address + offset` (the caller is expected to
/// have already applied the kernel slide when building `runtime_address`).
/// Entries not found by the end of the scan are reported by name in the
/// returned [`SoftErrorList`] rather than aborting the whole scan.
pub fn scan(
    segments: &[ScannableSegment],
    interrupted: &AtomicBool,
) -> (GadgetAddresses, SoftErrorList<GadgetError>) {
    let mut addresses = GadgetAddresses::default();
    'outer: for segment in segments {
        let required = VmProt::READ | VmProt::EXECUTE;
        if (segment.init_prot & segment.max_prot) & required != required {
            continue;
        }
        for offset in (0..segment.bytes.len()).step_by(4) {
            if interrupted.load(Ordering::Relaxed) || failspot::failspot!(crate::FailSpotName::GadgetScanAbortEarly) {
                break 'outer;
            }
            for gadget in CATALOG {
                if addresses.found.contains_key(gadget.name) {
                    continue;
                }
                let len = gadget.words.len() * 4;
                if offset + len > segment.bytes.len() {
                    continue;
                }
                if words_match(&segment.bytes[offset..offset + len], gadget.words) {
                    addresses
                        .found
                        .insert(gadget.name, segment.runtime_address + offset as u64);
                }
            }
        }
    }

    let mut errors = SoftErrorList::default();
    for gadget in CATALOG {
        if !addresses.found.contains_key(gadget.name) {
            errors.push(GadgetError::NotFound(gadget.name));
        }
    }
    (addresses, errors)
}

fn words_match(bytes: &[u8], words: &[u32]) -> bool {
    words.iter().enumerate().all(|(i, &w)| {
        let off = i * 4;
        u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) == w
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_dispatcher_gadget_at_known_offset() {
        let dispatcher = catalog()[0];
        let mut bytes = vec![0u8; 64];
        bytes[16..20].copy_from_slice(&dispatcher.words[0].to_le_bytes());
        bytes[20..24].copy_from_slice(&dispatcher.words[1].to_le_bytes());
        let segments = [ScannableSegment {
            runtime_address: 0x1000,
            bytes: &bytes,
            init_prot: VmProt::READ | VmProt::EXECUTE,
            max_prot: VmProt::READ | VmProt::EXECUTE,
        }];
        let flag = AtomicBool::new(false);
        let (addrs, errors) = scan(&segments, &flag);
        assert_eq!(addrs.get(dispatcher.name), Some(0x1010));
        assert!(errors.len() >= CATALOG.len() - 1);
    }

    #[test]
    fn non_executable_segment_is_skipped() {
        let dispatcher = catalog()[0];
        let mut bytes = vec![0u8; 32];
        bytes[0..4].copy_from_slice(&dispatcher.words[0].to_le_bytes());
        bytes[4..8].copy_from_slice(&dispatcher.words[1].to_le_bytes());
        let segments = [ScannableSegment {
            runtime_address: 0x1000,
            bytes: &bytes,
            init_prot: VmProt::READ | VmProt::WRITE,
            max_prot: VmProt::READ | VmProt::WRITE,
        }];
        let flag = AtomicBool::new(false);
        let (addrs, _) = scan(&segments, &flag);
        assert!(addrs.get(dispatcher.name).is_none());
    }

    #[test]
    fn catalog_has_all_thirty_four_entries() {
        assert_eq!(CATALOG.len(), 34);
    }
}

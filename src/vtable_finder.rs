//! Component D: the metaclass/vtable finder, grounded on
//! `examples/original_source/src/libmemctl/aarch64/finder/vtables.c`.
//!
//! Best-effort: every failure mode here is recorded into a
//! [`SoftErrorList`] rather than aborting the whole pass. The finder
//! reports success even if it discovers nothing.

use crate::config::KernelCallConfig;
use crate::ksim::{self, BranchCondition, BranchDecision, SimClient, Simulator};
use crate::oracle::{KernelImage, MappedRegion, OracleError};
use crate::soft_error::SoftErrorList;
use crate::symbols::{ClassSymbols, SymbolTable};
use std::sync::atomic::AtomicBool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FinderError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("module initializer at {0:#x} did not resolve to a known OSMetaClass constructor call")]
    NoMetaclassCallFound(u64),
    #[error("class name at {0:#x} is not a valid C string")]
    InvalidClassName(u64),
    #[error("candidate vtable at {0:#x} failed validation: {1}")]
    RejectedCandidate(u64, &'static str),
    #[error("required section {0}.{1} is absent from the kernel image")]
    MissingSection(String, String),
}

/// A `(metaclass-address, class-name)` pair recorded while simulating a
/// module initializer step 1.
#[derive(Debug, Clone)]
pub struct MetaclassCandidate {
    pub metaclass_address: u64,
    pub class_name: String,
}

fn read_cstring(image: &dyn KernelImage, address: u64) -> Option<String> {
    const MAX_LEN: usize = 256;
    let bytes = image.instructions_at(address).ok()?;
    let len = bytes.iter().take(MAX_LEN).position(|&b| b == 0)?;
    std::str::from_utf8(&bytes[..len]).ok().map(str::to_string)
}

/// For every function pointer in
/// `__DATA_CONST.__mod_init_func`, simulate until a call is reached and,
/// if its arguments look like `OSMetaClass::OSMetaClass(this, name, super,
/// size)`, record `(this, class-name-at(name))`.
pub fn collect_metaclasses(
    image: &dyn KernelImage,
    config: &KernelCallConfig,
    interrupted: &AtomicBool,
) -> (Vec<MetaclassCandidate>, SoftErrorList<FinderError>) {
    let mut errors = SoftErrorList::default();
    let mod_init_func = match image.section("__DATA_CONST", "__mod_init_func") {
        Some(region) => region,
        None => {
            errors.push(FinderError::MissingSection(
                "__DATA_CONST".into(),
                "__mod_init_func".into(),
            ));
            return (Vec::new(), errors);
        }
    };
    let data_segment = image.segment("__DATA");
    let text_segment = image.segment("__TEXT");

    let mut candidates = Vec::new();
    for chunk in mod_init_func.bytes.chunks_exact(8) {
        let initializer = u64::from_le_bytes(chunk.try_into().unwrap());
        if initializer == 0 {
            continue;
        }
        let mut client = MetaclassCollector {
            data_segment,
            text_segment,
            found: Vec::new(),
        };
        match run_initializer(image, initializer, config, interrupted, &mut client) {
            Ok(_) => {}
            Err(FinderError::Oracle(OracleError::UnmappedAddress(addr))) => {
                errors.push(FinderError::NoMetaclassCallFound(addr));
                continue;
            }
            Err(e) => {
                errors.push(e);
                continue;
            }
        }
        for (this, name_addr) in client.found {
            match read_cstring(image, name_addr) {
                Some(class_name) => candidates.push(MetaclassCandidate {
                    metaclass_address: this,
                    class_name,
                }),
                None => errors.push(FinderError::InvalidClassName(name_addr)),
            }
        }
    }
    (candidates, errors)
}

fn run_initializer(
    image: &dyn KernelImage,
    initializer: u64,
    config: &KernelCallConfig,
    interrupted: &AtomicBool,
    client: &mut MetaclassCollector,
) -> Result<(), FinderError> {
    let code = image.instructions_at(initializer)?;
    let mut sim = Simulator::new(code, initializer, initializer, config.metaclass_collection_instruction_budget);
    match sim.run(client, interrupted) {
        Ok(_) => Ok(()),
        // Budget exhaustion is not fatal here: keep whatever calls were
        // already recorded best-effort contract.
        Err(ksim::SimError::BudgetExhausted(_)) => Ok(()),
        Err(_) => Err(FinderError::NoMetaclassCallFound(initializer)),
    }
}

struct MetaclassCollector<'a> {
    data_segment: Option<MappedRegion<'a>>,
    text_segment: Option<MappedRegion<'a>>,
    found: Vec<(u64, u64)>,
}

impl<'a> SimClient for MetaclassCollector<'a> {
    fn handle_branch(
        &mut self,
        sim: &Simulator,
        ins: crate::aarch64::Instruction,
        _branch_address: u64,
        _condition: BranchCondition,
    ) -> Option<BranchDecision> {
        if let crate::aarch64::Instruction::Branch { link: true, .. }
        | crate::aarch64::Instruction::BranchRegister { link: true, .. } = ins
        {
            let x0 = sim.reg(crate::aarch64::GpReg::new(0, crate::aarch64::Width::W64, true));
            let x1 = sim.reg(crate::aarch64::GpReg::new(1, crate::aarch64::Width::W64, true));
            let x3 = sim.reg(crate::aarch64::GpReg::new(3, crate::aarch64::Width::W64, true));
            if let (Some(x0), Some(x1), Some(x3)) = (x0, x1, x3) {
                let in_data = self.data_segment.map(|r| r.contains(x0)).unwrap_or(false);
                let in_text = self.text_segment.map(|r| r.contains(x1)).unwrap_or(false);
                if in_data && in_text && x3 < (1u64 << 32) {
                    self.found.push((x0, x1));
                }
            }
        }
        // Never actually enter the callee; keep scanning the initializer
        // for further metaclass-constructing calls
        Some(BranchDecision { take: false, stop: false })
    }
}

/// Sweeps `__DATA_CONST.__const` for plausible vtables and confirms each
/// by simulating its `getMetaClass` method.
pub fn scan_vtables(
    image: &dyn KernelImage,
    config: &KernelCallConfig,
    candidates: &[MetaclassCandidate],
    interrupted: &AtomicBool,
) -> (SymbolTable, SoftErrorList<FinderError>) {
    let mut errors = SoftErrorList::default();
    let mut table = SymbolTable::new();

    let const_section = match image.section("__DATA_CONST", "__const") {
        Some(region) => region,
        None => {
            errors.push(FinderError::MissingSection("__DATA_CONST".into(), "__const".into()));
            return (table, errors);
        }
    };
    let text_exec = image.segment("__TEXT_EXEC");

    let word_count = const_section.bytes.len() / 8;
    let word_at = |i: usize| -> u64 {
        let off = i * 8;
        u64::from_le_bytes(const_section.bytes[off..off + 8].try_into().unwrap())
    };

    let n = config.vtable_candidate_method_count;
    let idx = config.get_metaclass_vtable_index;
    for i in 2..word_count.saturating_sub(n) {
        if interrupted.load(std::sync::atomic::Ordering::Relaxed) {
            break;
        }
        // Itanium vtable prologue: the two words preceding `v` are zero.
        if word_at(i - 2) != 0 || word_at(i - 1) != 0 {
            continue;
        }
        // The next `n` vtable slots must all exist (be non-zero).
        if (0..n).any(|slot| word_at(i + slot) == 0) {
            continue;
        }
        let get_metaclass = word_at(i + idx);
        let in_text_exec = text_exec.map(|r| r.contains(get_metaclass)).unwrap_or(false);
        if !in_text_exec {
            continue;
        }

        let v_address = const_section.runtime_address + (i as u64) * 8;
        match confirm_get_metaclass(image, config, get_metaclass, interrupted) {
            Ok(Some(metaclass_address)) => {
                if let Some(candidate) = candidates.iter().find(|c| c.metaclass_address == metaclass_address) {
                    let vtable_len = vtable_length(&const_section, i);
                    let bound = table.bind(
                        &candidate.class_name,
                        ClassSymbols {
                            vtable_address: v_address,
                            vtable_len,
                            metaclass_address,
                        },
                    );
                    if !bound {
                        errors.push(FinderError::RejectedCandidate(v_address, "vtable already claimed by another class"));
                    }
                }
            }
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }
    (table, errors)
}

fn vtable_length(section: &MappedRegion, start_word: usize) -> usize {
    let total_words = section.bytes.len() / 8;
    let mut len = 0;
    for i in start_word..total_words {
        let off = i * 8;
        let word = u64::from_le_bytes(section.bytes[off..off + 8].try_into().unwrap());
        if word == 0 {
            break;
        }
        len += 1;
    }
    len
}

/// Simulates a candidate's `getMetaClass` method for at most
/// `get_metaclass_instruction_budget` instructions and reads `x0` on
/// return step 3.
fn confirm_get_metaclass(
    image: &dyn KernelImage,
    config: &KernelCallConfig,
    method: u64,
    interrupted: &AtomicBool,
) -> Result<Option<u64>, FinderError> {
    let code = image.instructions_at(method)?;
    let mut sim = Simulator::new(code, method, method, config.get_metaclass_instruction_budget);
    match sim.run(&mut ksim::DefaultClient, interrupted) {
        Ok(ksim::StopReason::Ret) => {}
        _ => return Err(FinderError::RejectedCandidate(method, "did not reach ret within budget")),
    }
    if sim.instruction_count() < config.get_metaclass_min_instruction_count {
        return Err(FinderError::RejectedCandidate(method, "body too short to be a real getMetaClass"));
    }
    Ok(sim.reg(crate::aarch64::GpReg::new(0, crate::aarch64::Width::W64, true)))
}

/// Runs both passes and merges their soft-error lists.
pub fn find_vtables(
    image: &dyn KernelImage,
    config: &KernelCallConfig,
    interrupted: &AtomicBool,
) -> (SymbolTable, SoftErrorList<FinderError>) {
    let (candidates, mut errors) = collect_metaclasses(image, config, interrupted);
    let (table, scan_errors) = scan_vtables(image, config, &candidates, interrupted);
    for e in scan_errors {
        errors.push(e);
    }
    (table, errors)
}

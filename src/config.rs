//! `KernelCallConfig`: tunables named throughout this crate rather than
//! hardcoded as magic numbers. Not persisted state and not a CLI surface
//! — this is purely a library-level parameter bag a caller constructs
//! in-process.

/// Tunables and victim-class choice for the whole kernel-call subsystem.
#[derive(Debug, Clone)]
pub struct KernelCallConfig {
    /// The `IOUserClient` subclass to hook. The original
    /// uses `AppleKeyStoreUserClient`; any subclass whose parent service an
    /// unprivileged task may open and whose vtable is discoverable works.
    pub victim_class_name: String,
    /// The bundle identifier (kext) that owns `victim_class_name`'s vtable.
    pub victim_class_bundle_id: String,

    /// Per-initializer instruction budget while collecting metaclasses:
    /// a small constant, around 256 instructions.
    pub metaclass_collection_instruction_budget: usize,
    /// Instruction budget for simulating a candidate's `getMetaClass`
    /// method: at most eight instructions.
    pub get_metaclass_instruction_budget: usize,
    /// Lower bound on plausible `getMetaClass` bodies, below which a
    /// candidate is rejected as too short to be real (mirrors
    /// `MIN_GETMETACLASS_INSTRUCTION_COUNT` in
    /// `libmemctl/aarch64/finder/vtables.c`).
    pub get_metaclass_min_instruction_count: usize,

    /// Retry bound for the "open-service-with-known-ID" race: how many
    /// times to retry opening the victim service when another process's
    /// concurrent child enumeration makes the diff ambiguous.
    pub child_enumeration_retries: u32,

    /// Byte offset of `IORegistryEntry::reserved` (default
    /// `2 * size_of::<u64>()`), named rather than hardcoded so a caller
    /// can override it for a kernel version where the ABI shifted.
    pub registry_entry_reserved_offset: u64,
    /// Byte offset of `IORegistryEntry::ExpansionData::fRegistryEntryID`
    /// (default `1 * size_of::<u64>()`).
    pub registry_entry_id_offset: u64,

    /// Number of vtable method slots the scanner requires to be non-zero
    /// before treating a candidate as plausible: twelve.
    pub vtable_candidate_method_count: usize,
    /// Zero-based index of `getMetaClass` within a vtable: the seventh
    /// entry, i.e. index 6.
    pub get_metaclass_vtable_index: usize,

    /// Byte distance the value-stack pointer (`x20`) advances between each
    /// load/advance gadget invocation (`kernel_call_aarch64.c`'s
    /// `LOAD_ADVANCE`).
    pub jop_load_advance: u64,
    /// Offset within the payload where the call's return value is
    /// deposited before the dispatcher hands control back (`RESULT_OFFSET`).
    pub jop_result_offset: u64,
    /// Byte used to pad unused payload slots, chosen to be recognizable in
    /// a crash log (`kernel_call_aarch64.c` uses `0xba` for this).
    pub jop_filler_byte: u8,
    /// Offset within the payload where the JOP stack's linked list of
    /// dispatch nodes begins (`JOP_STACK_OFFSET`). The value stack and
    /// store-resume record occupy the bytes before it, not the whole
    /// payload -- this is a boundary inside one allocation, not its size.
    pub jop_stack_offset: usize,
    /// Total size in bytes of the allocated JOP payload (value stack +
    /// store-resume record + JOP stack), mirroring `strategy::payload_size`.
    /// The underlying kernel allocation still rounds up to a whole page;
    /// this is the logical payload size within it.
    pub jop_payload_size: usize,
}

impl Default for KernelCallConfig {
    fn default() -> KernelCallConfig {
        KernelCallConfig {
            victim_class_name: "AppleKeyStoreUserClient".to_string(),
            victim_class_bundle_id: "com.apple.iokit.IOAppleKeyStore".to_string(),
            metaclass_collection_instruction_budget: 256,
            get_metaclass_instruction_budget: 8,
            get_metaclass_min_instruction_count: 2,
            child_enumeration_retries: 5,
            registry_entry_reserved_offset: 2 * size_of::<u64>() as u64,
            registry_entry_id_offset: size_of::<u64>() as u64,
            vtable_candidate_method_count: 12,
            get_metaclass_vtable_index: 6,
            jop_load_advance: 0x34,
            jop_result_offset: 0x9c,
            jop_filler_byte: 0xba,
            jop_stack_offset: 0xe0,
            jop_payload_size: 0x400,
        }
    }
}

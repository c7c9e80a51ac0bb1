//! Component H: the kernel-call façade, grounded on the
//! top-level `kernel_call()`/`kernel_call_init()`/`kernel_call_deinit()` in
//! `examples/original_source/src/libmemctl/kernel_call.c`. Only the trap
//! hook and JOP calling strategies are ported -- the original's x86_64
//! syscall path has no AArch64 counterpart and this crate is AArch64-only.
//!
//! Neither calling strategy can actually fire a Mach trap or deliver its
//! return value from inside this crate: `IOConnectTrap6`/`io_connect_method`
//! belong to a caller's Mach IPC layer, which this crate does not
//! implement (see the module docs on [`crate::trap_hook`] and
//! [`crate::jop`]). [`KernelCall::kernel_call`] therefore *stages* a call
//! rather than performing it end to end, mirroring the scope already
//! drawn by [`KernelCall::stage_trap_call`] and [`KernelCall::build_jop_call`].

use crate::config::KernelCallConfig;
use crate::error::KernelCallError;
use crate::gadgets::GadgetAddresses;
use crate::jop::{self, JopPayload};
use crate::kernel_memory::KernelMemory;
use crate::symbols::SymbolTable;
use crate::trap_hook::{HeapPage, ServiceOpener, TrapHook, VtableSwap};
use std::sync::atomic::AtomicBool;

/// Which strategy a given kernel image supports, decided once at
/// [`KernelCall::init`] time by probing both paths with `func == 0`
/// (`kernel_call_7`/`kernel_call_aarch64`'s own probe convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStrategy {
    TrapHook,
    Jop,
}

/// What [`KernelCall::kernel_call`] prepared for a non-probe call. The
/// caller is responsible for actually firing the trap (staging the
/// `IOExternalTrap` record is already done by the time this is returned)
/// or writing the JOP payload to kernel memory and diverting control flow
/// to its `entry_pc`.
#[derive(Debug)]
pub enum StagedCall {
    TrapHook,
    Jop(JopPayload),
}

/// The façade a caller constructs once per kernel image and uses for
/// every subsequent privileged call or class lookup.
pub struct KernelCall {
    config: KernelCallConfig,
    symbols: SymbolTable,
    gadgets: Option<GadgetAddresses>,
    hook: Option<TrapHook>,
    strategy: Option<CallStrategy>,
    jop_page: Option<u64>,
}

impl KernelCall {
    pub fn new(config: KernelCallConfig, symbols: SymbolTable, gadgets: Option<GadgetAddresses>) -> Self {
        KernelCall {
            config,
            symbols,
            gadgets,
            hook: None,
            strategy: None,
            jop_page: None,
        }
    }

    /// Picks a strategy without committing to one: JOP is preferred when
    /// its gadget requirements are met (it needs no vtable hook and
    /// survives a kernel panic better, so the original's ordering --
    /// `kernel_call_7` before `kernel_call_aarch64` -- is reversed here
    /// deliberately).
    pub fn preferred_strategy(&self) -> Option<CallStrategy> {
        if let Some(gadgets) = &self.gadgets {
            if jop::check_available(gadgets).is_ok() {
                return Some(CallStrategy::Jop);
            }
        }
        if self.hook.as_ref().is_some_and(TrapHook::is_installed) {
            return Some(CallStrategy::TrapHook);
        }
        None
    }

    /// Locates and hooks the live instance of `class_name` behind
    /// `service`, making [`CallStrategy::TrapHook`] available. Runs the
    /// full §4.G install sequence: opens a connection and learns its
    /// registry entry ID via `opener`, heap-scans `heap_pages` for the
    /// matching instance, then patches its vtable. Idempotent: returns
    /// `Ok(())` if already installed.
    #[allow(clippy::too_many_arguments)]
    pub fn init_trap_hook(
        &mut self,
        memory: &dyn KernelMemory,
        opener: &dyn ServiceOpener,
        heap_pages: &[HeapPage],
        interrupted: &AtomicBool,
        class_name: &str,
        service: u64,
        replaced_method: u64,
        replacement_method: u64,
    ) -> Result<(), KernelCallError> {
        if self.hook.as_ref().is_some_and(TrapHook::is_installed) {
            return Ok(());
        }
        let symbols = self
            .symbols
            .class_symbols(class_name)
            .ok_or_else(|| KernelCallError::UnknownClass(class_name.to_string()))?;

        let (_connection, registry_id) =
            crate::trap_hook::open_with_known_instance(opener, service, self.config.child_enumeration_retries)?;
        let (user_client, id_address) =
            TrapHook::locate_instance(heap_pages, symbols.vtable_address, registry_id, &self.config, interrupted)?;

        let mut hook = TrapHook::new(user_client, id_address, symbols);
        hook.install(
            memory,
            VtableSwap {
                from: replaced_method,
                to: replacement_method,
            },
        )?;
        self.hook = Some(hook);
        self.strategy = Some(CallStrategy::TrapHook);
        Ok(())
    }

    /// Allocates the JOP payload page, making [`CallStrategy::Jop`]
    /// available once gadget scanning has populated `self.gadgets`.
    /// Idempotent.
    pub fn init_jop(&mut self, memory: &dyn KernelMemory) -> Result<(), KernelCallError> {
        if self.jop_page.is_some() {
            return Ok(());
        }
        let gadgets = self.gadgets.as_ref().ok_or(KernelCallError::NoStrategyAvailable)?;
        jop::check_available(gadgets)?;
        let page = memory.allocate(self.config.jop_payload_size)?;
        self.jop_page = Some(page);
        Ok(())
    }

    /// Tears down whichever strategy is active. Safe to call when nothing
    /// was ever initialized.
    pub fn deinit(&mut self, memory: &dyn KernelMemory) -> Result<(), KernelCallError> {
        if let Some(hook) = &mut self.hook {
            hook.uninstall(memory)?;
        }
        if let Some(page) = self.jop_page.take() {
            memory.deallocate(page, self.config.jop_payload_size)?;
        }
        self.strategy = None;
        Ok(())
    }

    /// The façade of spec §4.H: picks a strategy by the shape of the
    /// call (`argc`/`argv[0]`/`result_size`) and stages it, without
    /// actually firing the Mach trap that would run it. `func == 0` is a
    /// feature-detection probe: it returns `Ok(None)` if some strategy
    /// could service a call of this shape, without staging anything,
    /// matching spec's "returns true iff the call ... could be performed
    /// without actually performing it". Any shape no available strategy
    /// can service, or whose shape matches neither path at all, is an
    /// error.
    pub fn kernel_call(
        &self,
        memory: &dyn KernelMemory,
        result_size: usize,
        func: u64,
        argv: &[u64],
    ) -> Result<Option<StagedCall>, KernelCallError> {
        let argc = argv.len();
        let probe = func == 0;

        let trap_shape = argc <= 7 && argv.first().copied().unwrap_or(0) != 0 && result_size <= 4;
        let jop_shape = argc <= jop::MAX_ARGUMENTS && result_size <= 8;

        if trap_shape {
            let hook = self.hook.as_ref().filter(|h| h.is_installed());
            if let Some(hook) = hook {
                if probe {
                    return Ok(None);
                }
                hook.set_target(memory, argv[0], func)?;
                return Ok(Some(StagedCall::TrapHook));
            }
        }

        if jop_shape {
            if let (Some(gadgets), Some(stack_base)) = (&self.gadgets, self.jop_page) {
                if jop::check_available(gadgets).is_ok() {
                    if probe {
                        return Ok(None);
                    }
                    let payload = jop::build(&self.config, gadgets, stack_base, func, argv)?;
                    return Ok(Some(StagedCall::Jop(payload)));
                }
            }
        }

        Err(KernelCallError::NoStrategyAvailable)
    }

    /// Builds a JOP payload calling `func(args...)` at an explicit
    /// `stack_base` without touching `self.jop_page`. Does not write or
    /// execute it -- that is left to the caller's Mach IPC layer.
    pub fn build_jop_call(
        &self,
        stack_base: u64,
        func: u64,
        args: &[u64],
    ) -> Result<JopPayload, KernelCallError> {
        let gadgets = self
            .gadgets
            .as_ref()
            .ok_or(KernelCallError::NoStrategyAvailable)?;
        Ok(jop::build(&self.config, gadgets, stack_base, func, args)?)
    }

    /// Stages `func(object)` on an installed trap hook; the caller still
    /// has to fire the Mach trap itself via `IOConnectTrap6`/
    /// `io_connect_method` (outside this crate's scope).
    pub fn stage_trap_call(&self, memory: &dyn KernelMemory, object: u64, func: u64) -> Result<(), KernelCallError> {
        let hook = self.hook.as_ref().ok_or(KernelCallError::NotInitialized)?;
        hook.set_target(memory, object, func)?;
        Ok(())
    }

    pub fn class_vtable(&self, class_name: &str) -> Option<u64> {
        self.symbols.class_vtable(class_name).map(|(addr, _)| addr)
    }

    pub fn class_metaclass(&self, class_name: &str) -> Option<u64> {
        self.symbols.class_metaclass(class_name)
    }

    /// Stages a call to `OSMetaClass::getClassSize` (`__ZNK11OSMetaClass12getClassSizeEv`)
    /// against `class_name`'s metaclass instance. `get_class_size_addr` is
    /// the resolved runtime address of that method -- a single global
    /// function symbol this crate's own [`SymbolTable`] does not carry
    /// (it only binds per-class vtable/metaclass symbols), so the caller
    /// resolves it the same way it resolved any other kernel symbol
    /// (e.g. `oracle::KernelImage::resolve_symbol`) and passes it in.
    /// Returns the staged call; the caller still has to fire it and read
    /// back the 4-byte result the original stores via `kernel_call(size,
    /// sizeof(*size), getClassSize, 1, &metaclass)`.
    pub fn class_size(
        &self,
        memory: &dyn KernelMemory,
        class_name: &str,
        get_class_size_addr: u64,
    ) -> Result<Option<StagedCall>, KernelCallError> {
        let metaclass = self
            .symbols
            .class_metaclass(class_name)
            .ok_or_else(|| KernelCallError::UnknownClass(class_name.to_string()))?;
        self.kernel_call(memory, 4, get_class_size_addr, &[metaclass])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_memory::fake::FakeKernelMemory;
    use crate::symbols::ClassSymbols;

    fn config() -> KernelCallConfig {
        KernelCallConfig::default()
    }

    fn gadgets_with_full_catalog() -> GadgetAddresses {
        use crate::gadgets::{self, ScannableSegment, VmProt};
        use std::sync::atomic::AtomicBool;

        let catalog = gadgets::catalog();
        let mut bytes = Vec::new();
        for g in catalog {
            for w in g.words {
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
    fn prefers_jop_when_gadgets_available() {
        let gadgets = gadgets_with_full_catalog();
        let kc = KernelCall::new(config(), SymbolTable::new(), Some(gadgets));
        assert_eq!(kc.preferred_strategy(), Some(CallStrategy::Jop));
    }

    #[test]
    fn no_strategy_available_without_hook_or_gadgets() {
        let kc = KernelCall::new(config(), SymbolTable::new(), None);
        assert_eq!(kc.preferred_strategy(), None);
    }

    #[test]
    fn unknown_class_rejected_when_installing_trap_hook() {
        use crate::trap_hook::TrapHookError;

        struct NoopOpener;
        impl ServiceOpener for NoopOpener {
            fn child_ids(&self, _service: u64) -> Result<Vec<u64>, TrapHookError> {
                Ok(vec![])
            }
            fn open(&self, _service: u64) -> Result<u64, TrapHookError> {
                Ok(0x10)
            }
        }

        let memory = FakeKernelMemory::new(0x9000);
        let mut kc = KernelCall::new(config(), SymbolTable::new(), None);
        let interrupted = AtomicBool::new(false);
        let err = kc
            .init_trap_hook(&memory, &NoopOpener, &[], &interrupted, "NoSuchClass", 0x10, 0x100, 0x200)
            .unwrap_err();
        assert!(matches!(err, KernelCallError::UnknownClass(_)));
    }

    #[test]
    fn probe_reports_availability_without_staging_a_call() {
        let gadgets = gadgets_with_full_catalog();
        let memory = FakeKernelMemory::new(0x9000);
        let mut kc = KernelCall::new(config(), SymbolTable::new(), Some(gadgets));
        kc.init_jop(&memory).unwrap();

        let result = kc.kernel_call(&memory, 8, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn zero_first_argument_is_forbidden_on_trap_path() {
        let kc = KernelCall::new(config(), SymbolTable::new(), None);
        let memory = FakeKernelMemory::new(0x9000);
        let err = kc.kernel_call(&memory, 4, 0xdead_beef, &[0]).unwrap_err();
        assert!(matches!(err, KernelCallError::NoStrategyAvailable));
    }

    #[test]
    fn too_many_arguments_for_either_path_is_rejected() {
        let kc = KernelCall::new(config(), SymbolTable::new(), None);
        let memory = FakeKernelMemory::new(0x9000);
        let args = [1u64; 9];
        let err = kc.kernel_call(&memory, 8, 0xdead_beef, &args).unwrap_err();
        assert!(matches!(err, KernelCallError::NoStrategyAvailable));
    }

    #[test]
    fn jop_path_stages_a_payload_when_available() {
        let gadgets = gadgets_with_full_catalog();
        let memory = FakeKernelMemory::new(0x9000);
        let mut kc = KernelCall::new(config(), SymbolTable::new(), Some(gadgets));
        kc.init_jop(&memory).unwrap();

        let staged = kc.kernel_call(&memory, 8, 0xdead_beef, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(matches!(staged, Some(StagedCall::Jop(_))));
    }

    #[test]
    fn class_size_resolves_metaclass_before_staging() {
        let gadgets = gadgets_with_full_catalog();
        let memory = FakeKernelMemory::new(0x9000);
        let mut symbols = SymbolTable::new();
        symbols.bind(
            "OSString",
            ClassSymbols {
                vtable_address: 0x1000,
                vtable_len: 12,
                metaclass_address: 0x2000,
            },
        );
        let mut kc = KernelCall::new(config(), symbols, Some(gadgets));
        kc.init_jop(&memory).unwrap();

        let staged = kc.class_size(&memory, "OSString", 0xdead_beef).unwrap();
        assert!(matches!(staged, Some(StagedCall::Jop(_))));

        let err = kc.class_size(&memory, "OSArray", 0xdead_beef).unwrap_err();
        assert!(matches!(err, KernelCallError::UnknownClass(_)));
    }
}

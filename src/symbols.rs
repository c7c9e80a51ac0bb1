//! The synthetic symbol table produced by the vtable/metaclass finder
//! and consumed by the trap-hook installer and the kernel-call façade's
//! `class_*` queries.

use std::collections::HashMap;

/// One discovered C++ class: its vtable (base address, skipping the
/// two-word Itanium prologue, and length in slots) and its metaclass
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassSymbols {
    pub vtable_address: u64,
    pub vtable_len: usize,
    pub metaclass_address: u64,
}

/// Append-only for the lifetime of the kernel-image handle. Duplicate
/// bindings are ignored; conflicting bindings (two class names claiming
/// the same vtable) keep the first binder and reject the second.
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_class: HashMap<String, ClassSymbols>,
    vtable_owner: HashMap<u64, String>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Binds `vtable for K` and `K::gMetaClass`. Returns `false` (and binds
    /// nothing) if `vtable_address` is already owned by a different class.
    pub fn bind(&mut self, class_name: &str, symbols: ClassSymbols) -> bool {
        if let Some(owner) = self.vtable_owner.get(&symbols.vtable_address) {
            return owner == class_name;
        }
        if self.by_class.contains_key(class_name) {
            return true; // duplicate rediscovery, ignored
        }
        self.vtable_owner
            .insert(symbols.vtable_address, class_name.to_string());
        self.by_class.insert(class_name.to_string(), symbols);
        true
    }

    pub fn class_vtable(&self, class_name: &str) -> Option<(u64, usize)> {
        self.by_class
            .get(class_name)
            .map(|s| (s.vtable_address, s.vtable_len))
    }

    pub fn class_symbols(&self, class_name: &str) -> Option<ClassSymbols> {
        self.by_class.get(class_name).copied()
    }

    pub fn class_metaclass(&self, class_name: &str) -> Option<u64> {
        self.by_class.get(class_name).map(|s| s.metaclass_address)
    }

    pub fn class_name_for_vtable(&self, vtable_address: u64) -> Option<&str> {
        self.vtable_owner.get(&vtable_address).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_class.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_class.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_binding_keeps_first() {
        let mut table = SymbolTable::new();
        let sym = ClassSymbols {
            vtable_address: 0x1000,
            vtable_len: 12,
            metaclass_address: 0x2000,
        };
        assert!(table.bind("OSString", sym));
        assert!(!table.bind("OSArray", sym));
        assert_eq!(table.class_name_for_vtable(0x1000), Some("OSString"));
    }

    #[test]
    fn duplicate_rediscovery_ignored() {
        let mut table = SymbolTable::new();
        let sym = ClassSymbols {
            vtable_address: 0x1000,
            vtable_len: 12,
            metaclass_address: 0x2000,
        };
        assert!(table.bind("OSString", sym));
        assert!(table.bind("OSString", sym));
        assert_eq!(table.len(), 1);
    }
}

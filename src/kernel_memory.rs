//! The `KernelMemory` trait boundary: everything above this module
//! reasons about kernel virtual addresses and bytes; everything below it
//! is responsible for actually getting those bytes into or out of the
//! running kernel. Obtaining the underlying privileged memory-read/write
//! primitive is out of scope here — this trait is the seam a caller plugs
//! such a primitive into, mirrored on `oracle::KernelImage`'s read-only
//! counterpart for the static image.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelMemoryError {
    #[error("failed to read {len} bytes at {address:#x}: {source}")]
    Read {
        address: u64,
        len: usize,
        #[source]
        source: crate::mach::KernelError,
    },
    #[error("failed to write {len} bytes at {address:#x}: {source}")]
    Write {
        address: u64,
        len: usize,
        #[source]
        source: crate::mach::KernelError,
    },
    #[error("failed to allocate {size} bytes in kernel heap: {source}")]
    Allocate {
        size: usize,
        #[source]
        source: crate::mach::KernelError,
    },
    #[error("failed to deallocate {size} bytes at {address:#x}: {source}")]
    Deallocate {
        address: u64,
        size: usize,
        #[source]
        source: crate::mach::KernelError,
    },
}

/// A privileged read/write/allocate primitive over live kernel memory.
///
/// Implementors are expected to already hold whatever capability
/// (compromised `kernel_task` port, a prior arbitrary-call primitive used
/// to bootstrap this one, ...) is required; this trait does not model how
/// that capability was obtained, only how it is used once held.
pub trait KernelMemory {
    /// Reads `len` bytes starting at `address`. "Unsafe" names the
    /// contract, not the Rust keyword: the caller, not this trait, is
    /// responsible for `address` being sane.
    fn read_unsafe(&self, address: u64, len: usize) -> Result<Vec<u8>, KernelMemoryError>;

    /// Writes `bytes` to `address`.
    fn write_unsafe(&self, address: u64, bytes: &[u8]) -> Result<(), KernelMemoryError>;

    /// Allocates `size` bytes of kernel heap memory, returning its address.
    fn allocate(&self, size: usize) -> Result<u64, KernelMemoryError>;

    /// Releases memory previously returned by [`allocate`](Self::allocate).
    fn deallocate(&self, address: u64, size: usize) -> Result<(), KernelMemoryError>;

    /// Convenience: read exactly `N` bytes into a fixed-size array.
    fn read_heap<const N: usize>(&self, address: u64) -> Result<[u8; N], KernelMemoryError> {
        let bytes = self.read_unsafe(address, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Convenience: read a single little-endian `u64`.
    fn read_u64(&self, address: u64) -> Result<u64, KernelMemoryError> {
        Ok(u64::from_le_bytes(self.read_heap::<8>(address)?))
    }

    /// Convenience: write a single little-endian `u64`.
    fn write_heap(&self, address: u64, value: u64) -> Result<(), KernelMemoryError> {
        self.write_unsafe(address, &value.to_le_bytes())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// An in-process fake used to unit-test callers of [`KernelMemory`]
    /// without a real kernel task port, analogous to `oracle::FakeKernelImage`.
    #[derive(Default)]
    pub struct FakeKernelMemory {
        pages: RefCell<HashMap<u64, Vec<u8>>>,
        next_alloc: RefCell<u64>,
    }

    impl FakeKernelMemory {
        pub fn new(heap_base: u64) -> Self {
            FakeKernelMemory {
                pages: RefCell::new(HashMap::new()),
                next_alloc: RefCell::new(heap_base),
            }
        }
    }

    impl KernelMemory for FakeKernelMemory {
        fn read_unsafe(&self, address: u64, len: usize) -> Result<Vec<u8>, KernelMemoryError> {
            let pages = self.pages.borrow();
            let bytes = pages.get(&address).cloned().unwrap_or_else(|| vec![0u8; len]);
            Ok(bytes[..len.min(bytes.len())].to_vec())
        }

        fn write_unsafe(&self, address: u64, bytes: &[u8]) -> Result<(), KernelMemoryError> {
            self.pages.borrow_mut().insert(address, bytes.to_vec());
            Ok(())
        }

        fn allocate(&self, size: usize) -> Result<u64, KernelMemoryError> {
            let mut next = self.next_alloc.borrow_mut();
            let addr = *next;
            *next += size as u64;
            self.pages.borrow_mut().insert(addr, vec![0u8; size]);
            Ok(addr)
        }

        fn deallocate(&self, address: u64, _size: usize) -> Result<(), KernelMemoryError> {
            self.pages.borrow_mut().remove(&address);
            Ok(())
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mem = FakeKernelMemory::new(0x1000);
        let addr = mem.allocate(16).unwrap();
        mem.write_heap(addr, 0xdead_beef_0000_0001).unwrap();
        assert_eq!(mem.read_u64(addr).unwrap(), 0xdead_beef_0000_0001);
        mem.deallocate(addr, 16).unwrap();
    }
}

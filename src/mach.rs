//! Thin wrappers over `mach2`, adapted from `src/mac/mach.rs`'s
//! `KernelError` (kept verbatim, it is pure `kern_return_t` taxonomy) plus
//! the handful of `mach_vm_*` calls [`crate::kernel_memory`] needs that the
//! original minidump writer never called (it only ever read remote memory,
//! never wrote or allocated it).

#[cfg(target_os = "macos")]
pub use mach2::{
    kern_return::{kern_return_t, KERN_SUCCESS},
    port::mach_port_name_t,
    traps::mach_task_self,
    vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_protect, mach_vm_read_overwrite, mach_vm_write},
    vm_prot::{vm_prot_t, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE},
};

/// A Mach kernel error. See `<mach/kern_return.h>`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("specified address is not currently valid")]
    InvalidAddress = 1,
    #[error("specified memory is valid, but does not permit the required forms of access")]
    ProtectionFailure = 2,
    #[error("the address range specified is already in use, or no address range of the size specified could be found")]
    NoSpace = 3,
    #[error("the function requested was not applicable to this type of argument, or an argument is invalid")]
    InvalidArgument = 4,
    #[error("the function could not be performed")]
    Failure = 5,
    #[error("system resource could not be allocated to fulfill this request")]
    ResourceShortage = 6,
    #[error("the task in question does not hold receive rights for the port argument")]
    NotReceiver = 7,
    #[error("bogus access restriction")]
    NoAccess = 8,
    #[error("the name doesn't denote a right in the task")]
    InvalidName = 15,
    #[error("target task isn't an active task")]
    InvalidTask = 16,
    #[error("a blatant range error")]
    InvalidValue = 18,
    #[error("the provided buffer is of insufficient size for the requested data")]
    InsufficientBufferSize = 52,
    #[error("denied by security policy")]
    Denied = 53,
    #[error("a search or query operation did not return a result")]
    NotFound = 56,
    #[error("mach call returned an error code this crate does not model: {0}")]
    Other(i32),
}

#[cfg(target_os = "macos")]
impl From<kern_return_t> for KernelError {
    fn from(kr: kern_return_t) -> Self {
        use mach2::kern_return::*;
        match kr {
            KERN_INVALID_ADDRESS => Self::InvalidAddress,
            KERN_PROTECTION_FAILURE => Self::ProtectionFailure,
            KERN_NO_SPACE => Self::NoSpace,
            KERN_INVALID_ARGUMENT => Self::InvalidArgument,
            KERN_FAILURE => Self::Failure,
            KERN_RESOURCE_SHORTAGE => Self::ResourceShortage,
            KERN_NOT_RECEIVER => Self::NotReceiver,
            KERN_NO_ACCESS => Self::NoAccess,
            KERN_INVALID_NAME => Self::InvalidName,
            KERN_INVALID_TASK => Self::InvalidTask,
            KERN_INVALID_VALUE => Self::InvalidValue,
            52 => Self::InsufficientBufferSize,
            53 => Self::Denied,
            56 => Self::NotFound,
            other => Self::Other(other),
        }
    }
}

/// Reads `len` bytes of another task's virtual memory into `out`.
///
/// # Safety
/// `task` must name a task port this process holds at least
/// `VM_PROT_READ` rights over, and `address` must be a range the caller
/// has reasoned is safe to fault in -- only [`crate::kernel_memory`] is
/// meant to call this directly.
#[cfg(target_os = "macos")]
pub unsafe fn vm_read(
    task: mach_port_name_t,
    address: u64,
    out: &mut [u8],
) -> Result<(), KernelError> {
    let mut out_size: u64 = 0;
    let kr = mach_vm_read_overwrite(
        task,
        address,
        out.len() as u64,
        out.as_mut_ptr() as u64,
        &mut out_size,
    );
    if kr != KERN_SUCCESS {
        return Err(KernelError::from(kr));
    }
    Ok(())
}

/// Writes `bytes` into another task's virtual memory.
///
/// # Safety
/// Same obligations as [`vm_read`], plus: the target range must already
/// be writable (callers needing to change protection should call
/// [`vm_protect`] first).
#[cfg(target_os = "macos")]
pub unsafe fn vm_write(task: mach_port_name_t, address: u64, bytes: &[u8]) -> Result<(), KernelError> {
    let kr = mach_vm_write(task, address, bytes.as_ptr() as u64, bytes.len() as u32);
    if kr != KERN_SUCCESS {
        return Err(KernelError::from(kr));
    }
    Ok(())
}

/// Allocates `size` bytes of anonymous memory in `task`, returning its
/// address.
///
/// # Safety
/// `task` must be a task port this process holds allocate rights over.
#[cfg(target_os = "macos")]
pub unsafe fn vm_allocate(task: mach_port_name_t, size: u64) -> Result<u64, KernelError> {
    let mut address: u64 = 0;
    let kr = mach_vm_allocate(task, &mut address, size, 1 /* VM_FLAGS_ANYWHERE */);
    if kr != KERN_SUCCESS {
        return Err(KernelError::from(kr));
    }
    Ok(address)
}

/// # Safety
/// `task` must be a task port this process holds deallocate rights over,
/// and `address`/`size` must describe a region previously returned by
/// [`vm_allocate`].
#[cfg(target_os = "macos")]
pub unsafe fn vm_deallocate(task: mach_port_name_t, address: u64, size: u64) -> Result<(), KernelError> {
    let kr = mach_vm_deallocate(task, address, size);
    if kr != KERN_SUCCESS {
        return Err(KernelError::from(kr));
    }
    Ok(())
}

/// # Safety
/// `task` must be a task port this process holds rights to reprotect,
/// and `address`/`size` must describe a previously allocated region.
#[cfg(target_os = "macos")]
pub unsafe fn vm_protect(
    task: mach_port_name_t,
    address: u64,
    size: u64,
    prot: vm_prot_t,
) -> Result<(), KernelError> {
    let kr = mach_vm_protect(task, address, size, 0, prot);
    if kr != KERN_SUCCESS {
        return Err(KernelError::from(kr));
    }
    Ok(())
}

#[cfg(all(test, target_os = "macos"))]
mod tests {
    use super::*;

    #[test]
    fn allocate_write_read_deallocate_round_trip() {
        unsafe {
            let task = mach_task_self();
            let addr = vm_allocate(task, 4096).unwrap();
            vm_write(task, addr, b"hello").unwrap();
            let mut buf = [0u8; 5];
            vm_read(task, addr, &mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            vm_deallocate(task, addr, 4096).unwrap();
        }
    }
}

//! Cooperative cancellation: a single process-wide flag set from a
//! `SIGINT` handler, read by long-running scans (the gadget scanner,
//! the micro-simulator) between steps. Uses raw `libc::sigaction`
//! rather than a signal-handling crate, matching this codebase's
//! preference for raw OS primitives over higher-level abstractions.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Installs a `SIGINT` handler that sets the flag returned by
/// [`flag`]. Safe to call more than once; later calls just reinstall
/// the same handler.
///
/// # Safety
/// Must not be called from within a signal handler, and must not race
/// a concurrent `sigaction` call for `SIGINT` on another thread.
pub unsafe fn install_sigint_handler() {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = on_sigint as usize;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
}

/// The flag long-running scans poll to decide whether to stop early.
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear() {
        assert!(!flag().load(Ordering::SeqCst));
    }
}

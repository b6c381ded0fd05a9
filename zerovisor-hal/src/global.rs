//! Process-wide hypervisor-enable state (§9 "Global mutable state").
//!
//! The only module-level mutable state in this engine: whether some
//! `VirtExtension` instance currently holds the CPU's virtualization
//! extension (VMXON on Intel, `EFER.SVME` on AMD). Acquired by `enable()`,
//! released by `disable()`; a second acquire while one is already held is
//! rejected with `Busy`, matching hardware — only one hypervisor can own
//! VMX root mode or SVM on a given logical CPU at a time.
//!
//! [`crate::arch::soft::SoftBackend`] deliberately does not participate:
//! it is a test double standing in for hardware that was never actually
//! entered, and this crate's test suite constructs many of them
//! concurrently across parallel test threads. Routing `SoftBackend` through
//! this guard would make unrelated tests fail each other's `enable()` calls.

use std::sync::atomic::{AtomicBool, Ordering};

static VIRT_EXTENSION_ENABLED: AtomicBool = AtomicBool::new(false);

/// Attempts to acquire process-wide ownership of the virtualization
/// extension. Returns `true` if this call acquired it, `false` if another
/// instance already holds it (the caller should surface `HalError::Busy`).
pub fn try_acquire() -> bool {
    VIRT_EXTENSION_ENABLED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Releases process-wide ownership. A release with nothing held is a
/// harmless no-op rather than a panic, since a `disable()` may run on a
/// cleanup path after a failed `enable()`.
pub fn release() {
    VIRT_EXTENSION_ENABLED.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_acquire_is_rejected_until_released() {
        // Not shared with any other test in this crate — safe to assert
        // the flag's starting state directly.
        release();
        assert!(try_acquire());
        assert!(!try_acquire(), "a second acquire while one is held must fail");
        release();
        assert!(try_acquire(), "acquire must succeed again after release");
        release();
    }
}

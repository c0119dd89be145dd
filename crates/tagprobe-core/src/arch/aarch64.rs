//! ARMv8 implementation: `dc civac` eviction, `dsb`/`isb` ordering.

use std::arch::asm;

use super::{ProbeOps, monotonic_ns};

#[derive(Debug, Default, Clone, Copy)]
pub struct Aarch64Ops;

impl ProbeOps for Aarch64Ops {
    #[inline(always)]
    unsafe fn flush(&self, addr: *const u8) {
        // SAFETY: caller guarantees `addr` is mapped; DC CIVAC is permitted
        // from EL0 on Linux (SCTLR_EL1.UCI is set).
        unsafe {
            asm!(
                "dc civac, {0}",
                "dsb ish",
                "isb",
                in(reg) addr,
                options(nostack, preserves_flags)
            );
        }
    }

    #[inline(always)]
    unsafe fn load(&self, addr: *const u8) {
        // SAFETY: caller guarantees `addr` is mapped and readable. Probe
        // addresses are cache-line aligned, so the 8-byte load is aligned.
        unsafe {
            asm!(
                "ldr {0}, [{1}]",
                out(reg) _,
                in(reg) addr,
                options(nostack, readonly, preserves_flags)
            );
        }
    }

    #[inline(always)]
    unsafe fn store(&self, addr: *mut u8) {
        // SAFETY: caller guarantees `addr` is mapped and writable.
        unsafe {
            asm!(
                "str xzr, [{0}]",
                in(reg) addr,
                options(nostack, preserves_flags)
            );
        }
    }

    #[inline(always)]
    fn barrier(&self) {
        // SAFETY: barrier instructions have no operands and no side effects
        // beyond ordering.
        unsafe {
            asm!("dsb sy", "isb", options(nostack, preserves_flags));
        }
    }

    #[inline(always)]
    fn clock(&self) -> u64 {
        monotonic_ns()
    }
}

//! x86-64 implementation: `clflush` eviction, `mfence`/`lfence` ordering.
//!
//! There is no memory tagging on this architecture; the probe array and
//! calibrator still work, which is enough to exercise the channel.

use std::arch::x86_64::{_mm_clflush, _mm_lfence, _mm_mfence};

use super::{ProbeOps, monotonic_ns};

#[derive(Debug, Default, Clone, Copy)]
pub struct X86Ops;

impl ProbeOps for X86Ops {
    #[inline(always)]
    unsafe fn flush(&self, addr: *const u8) {
        // SAFETY: caller guarantees `addr` is mapped; SSE2 is baseline on x86-64.
        unsafe {
            _mm_clflush(addr);
            _mm_mfence();
        }
    }

    #[inline(always)]
    unsafe fn load(&self, addr: *const u8) {
        // SAFETY: caller guarantees `addr` is mapped and readable.
        unsafe {
            let _ = std::ptr::read_volatile(addr);
        }
    }

    #[inline(always)]
    unsafe fn store(&self, addr: *mut u8) {
        // SAFETY: caller guarantees `addr` is mapped and writable.
        unsafe {
            std::ptr::write_volatile(addr, 0);
        }
    }

    #[inline(always)]
    fn barrier(&self) {
        // SAFETY: fences have no preconditions.
        unsafe {
            _mm_mfence();
            _mm_lfence();
        }
    }

    #[inline(always)]
    fn clock(&self) -> u64 {
        monotonic_ns()
    }
}

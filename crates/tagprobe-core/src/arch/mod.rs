//! Low-level probe operations.
//!
//! Everything above this module is architecture-agnostic: the probe array,
//! calibrator, histogram and leakage campaigns only talk to a [`ProbeOps`]
//! implementation. One implementation exists per target architecture and
//! [`NativeOps`] names the one for the current build target.
//! [`sim::SimulatedCache`] is a deterministic model used for dry runs and
//! tests.

pub mod sim;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
mod portable;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::Aarch64Ops as NativeOps;
#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
pub use portable::PortableOps as NativeOps;
#[cfg(target_arch = "x86_64")]
pub use x86_64::X86Ops as NativeOps;

/// Cache-control, memory-access and clock primitives.
///
/// The pointer-taking methods are `unsafe`: callers guarantee that `addr`
/// points into a live, readable (and for [`store`](ProbeOps::store),
/// writable) mapping.
pub trait ProbeOps {
    /// Evict the line containing `addr` from every cache level.
    ///
    /// # Safety
    /// `addr` must point into a live mapping.
    unsafe fn flush(&self, addr: *const u8);

    /// Load from `addr`, discarding the value.
    ///
    /// # Safety
    /// `addr` must point into a live, readable mapping.
    unsafe fn load(&self, addr: *const u8);

    /// Store to `addr`. The stored value is unspecified.
    ///
    /// # Safety
    /// `addr` must point into a live, writable mapping.
    unsafe fn store(&self, addr: *mut u8);

    /// Full bidirectional memory barrier plus instruction synchronisation.
    fn barrier(&self);

    /// Raw monotonic clock, nanoseconds or finer.
    fn clock(&self) -> u64;

    /// Clock read bracketed by barriers on both sides.
    #[inline(always)]
    fn timestamp(&self) -> u64 {
        self.barrier();
        let t = self.clock();
        self.barrier();
        t
    }
}

/// `CLOCK_MONOTONIC` in nanoseconds.
#[inline(always)]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec; CLOCK_MONOTONIC always exists.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0);
    (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as u64)
}

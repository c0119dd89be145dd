//! Fallback for targets without a user-space cache flush.
//!
//! `flush` is a fence only, so every reload looks like a hit. Builds run, but
//! measurements carry no signal.

use std::sync::atomic::{Ordering, fence};

use super::{ProbeOps, monotonic_ns};

#[derive(Debug, Default, Clone, Copy)]
pub struct PortableOps;

impl ProbeOps for PortableOps {
    unsafe fn flush(&self, _addr: *const u8) {
        fence(Ordering::SeqCst);
    }

    unsafe fn load(&self, addr: *const u8) {
        // SAFETY: caller guarantees `addr` is mapped and readable.
        unsafe {
            let _ = std::ptr::read_volatile(addr);
        }
    }

    unsafe fn store(&self, addr: *mut u8) {
        // SAFETY: caller guarantees `addr` is mapped and writable.
        unsafe {
            std::ptr::write_volatile(addr, 0);
        }
    }

    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }

    fn clock(&self) -> u64 {
        monotonic_ns()
    }
}

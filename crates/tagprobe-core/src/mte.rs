//! Memory tagging extension (MTE) plumbing.
//!
//! Capability detection, per-process tagged-address configuration, pointer
//! tag arithmetic, allocation-tag stores and tag-checked mappings. Pointer
//! helpers are pure and available everywhere. Everything that touches
//! hardware needs an [`Mte`] token, which only [`Mte::enable`] hands out
//! after detection and configuration have succeeded.

use std::fmt;
use std::io;

use log::debug;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::mem::Mapping;

/// `HWCAP2_MTE` from `arch/arm64/include/uapi/asm/hwcap.h`.
pub const HWCAP2_MTE: u64 = 1 << 18;
/// `PROT_MTE` from `arch/arm64/include/uapi/asm/mman.h`.
pub const PROT_MTE: libc::c_int = 0x20;

pub const PR_SET_TAGGED_ADDR_CTRL: libc::c_int = 55;
pub const PR_GET_TAGGED_ADDR_CTRL: libc::c_int = 56;
pub const PR_TAGGED_ADDR_ENABLE: u64 = 1 << 0;
pub const PR_MTE_TCF_SHIFT: u32 = 1;
pub const PR_MTE_TCF_SYNC: u64 = 1 << PR_MTE_TCF_SHIFT;
pub const PR_MTE_TCF_ASYNC: u64 = 2 << PR_MTE_TCF_SHIFT;
pub const PR_MTE_TAG_SHIFT: u32 = 3;
/// Tags the kernel may pick for random tag generation: all but tag 0.
pub const PR_MTE_TAG_INCLUDE: u64 = 0xfffe;

/// Logical tag position in a pointer.
pub const TAG_SHIFT: u32 = 56;
pub const TAG_MASK: u64 = 0xf;
/// Bytes covered by one allocation tag.
pub const GRANULE: usize = 16;
/// Largest tag value.
pub const MAX_TAG: u8 = 15;

/// How tag-check faults are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultMode {
    /// Fault precisely on the offending access.
    Sync,
    /// Record the fault and deliver it at the next kernel entry.
    #[default]
    Async,
}

impl FaultMode {
    pub fn tcf_bits(self) -> u64 {
        match self {
            Self::Sync => PR_MTE_TCF_SYNC,
            Self::Async => PR_MTE_TCF_ASYNC,
        }
    }
}

impl fmt::Display for FaultMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

/// Control word for `prctl(PR_SET_TAGGED_ADDR_CTRL, ..)`.
pub fn tagged_addr_ctrl(mode: FaultMode) -> u64 {
    PR_TAGGED_ADDR_ENABLE | mode.tcf_bits() | (PR_MTE_TAG_INCLUDE << PR_MTE_TAG_SHIFT)
}

/// Whether the kernel advertises MTE to user space.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub fn is_supported() -> bool {
    // SAFETY: getauxval has no preconditions.
    let hwcap2 = unsafe { libc::getauxval(libc::AT_HWCAP2) } as u64;
    hwcap2 & HWCAP2_MTE != 0
}

#[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
pub fn is_supported() -> bool {
    false
}

/// Replace the logical tag of `ptr`.
pub fn with_tag<T>(ptr: *mut T, tag: u8) -> *mut T {
    ptr.map_addr(|a| {
        let cleared = a as u64 & !(TAG_MASK << TAG_SHIFT);
        (cleared | ((tag as u64 & TAG_MASK) << TAG_SHIFT)) as usize
    })
}

/// Strip the logical tag from `ptr`.
pub fn clear_tag<T>(ptr: *mut T) -> *mut T {
    with_tag(ptr, 0)
}

/// Logical tag carried by `ptr`.
pub fn tag_of<T>(ptr: *const T) -> u8 {
    ((ptr.addr() as u64 >> TAG_SHIFT) & TAG_MASK) as u8
}

/// Set the allocation tag of the granule at `tagged` to the pointer's tag.
///
/// # Safety
/// `tagged` must point into a live tag-checked mapping and be granule
/// aligned.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub unsafe fn set_allocation_tag(tagged: *mut u8) {
    // SAFETY: caller guarantees a live PROT_MTE granule.
    unsafe {
        std::arch::asm!(
            ".arch_extension memtag",
            "stg {0}, [{0}]",
            in(reg) tagged,
            options(nostack, preserves_flags)
        );
    }
}

/// No allocation tags exist on this architecture.
///
/// # Safety
/// Always safe; kept `unsafe` to match the aarch64 signature.
#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
pub unsafe fn set_allocation_tag(_tagged: *mut u8) {}

/// Proof that MTE was detected and the tagged-address ABI is enabled for
/// this process.
#[derive(Debug, Clone, Copy)]
pub struct Mte {
    mode: FaultMode,
}

impl Mte {
    /// Detect MTE and enable tag checking with `mode`.
    pub fn enable(mode: FaultMode) -> Result<Self> {
        if !is_supported() {
            return Err(Error::MteUnsupported);
        }
        let ctrl = tagged_addr_ctrl(mode);
        // SAFETY: PR_SET_TAGGED_ADDR_CTRL takes an integer control word and
        // three zero arguments.
        let rc = unsafe {
            libc::prctl(
                PR_SET_TAGGED_ADDR_CTRL,
                ctrl as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc != 0 {
            return Err(Error::TaggedAddrCtrl(io::Error::last_os_error()));
        }
        debug!("mte: tagged address ABI enabled, {mode} tag check faults (ctrl={ctrl:#x})");
        Ok(Self { mode })
    }

    pub fn fault_mode(&self) -> FaultMode {
        self.mode
    }
}

/// Anonymous mapping with tag checking enabled.
#[derive(Debug)]
pub struct TaggedRegion {
    mapping: Mapping,
}

impl TaggedRegion {
    /// Map `len` bytes and switch them to `PROT_MTE`.
    pub fn new(_mte: &Mte, len: usize) -> Result<Self> {
        let mapping = Mapping::anonymous(len)?;
        mapping
            .protect(libc::PROT_READ | libc::PROT_WRITE | PROT_MTE)
            .map_err(|source| Error::Protect { len, source })?;
        Ok(Self { mapping })
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mapping.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip_on_pointer() {
        let mut x = 0u8;
        let p: *mut u8 = &mut x;
        for tag in 0..=MAX_TAG {
            let t = with_tag(p, tag);
            assert_eq!(tag_of(t), tag);
            assert_eq!(clear_tag(t), p);
        }
    }

    #[test]
    fn with_tag_masks_to_four_bits() {
        let p = 0x1000usize as *mut u8;
        assert_eq!(tag_of(with_tag(p, 0x1f)), 0xf);
        assert_eq!(with_tag(p, 0x15).addr(), 0x0500_0000_0000_1000);
    }

    #[test]
    fn retagging_replaces_old_tag() {
        let p = 0x2000usize as *mut u8;
        let t = with_tag(with_tag(p, 9), 3);
        assert_eq!(tag_of(t), 3);
    }

    #[test]
    fn ctrl_word_layout() {
        assert_eq!(tagged_addr_ctrl(FaultMode::Sync), 0x1 | 0x2 | (0xfffe << 3));
        assert_eq!(tagged_addr_ctrl(FaultMode::Async), 0x1 | 0x4 | (0xfffe << 3));
    }

    #[test]
    fn fault_mode_display_and_default() {
        assert_eq!(FaultMode::default(), FaultMode::Async);
        assert_eq!(FaultMode::Sync.to_string(), "sync");
    }

    #[test]
    fn enable_matches_detection() {
        match Mte::enable(FaultMode::Async) {
            Ok(mte) => {
                assert!(is_supported());
                assert_eq!(mte.fault_mode(), FaultMode::Async);
            }
            Err(Error::MteUnsupported) => assert!(!is_supported()),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}

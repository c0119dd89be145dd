//! Owned anonymous memory mappings.

use std::fmt;
use std::io;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Private anonymous `mmap` region, unmapped on drop.
///
/// Fresh mappings are page aligned and zero filled.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Reserve `len` bytes of readable, writable memory.
    pub fn anonymous(len: usize) -> Result<Self> {
        Self::map(len, libc::PROT_READ | libc::PROT_WRITE)
    }

    pub(crate) fn map(len: usize, prot: libc::c_int) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidConfig("mapping length must be non-zero".into()));
        }
        // SAFETY: MAP_ANONYMOUS|MAP_PRIVATE with a null hint creates a fresh
        // private mapping; no existing memory is affected.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Map {
                len,
                source: io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| Error::Map {
            len,
            source: io::Error::other("mmap returned null"),
        })?;
        Ok(Self { ptr, len })
    }

    /// Change the protection of the whole mapping.
    pub(crate) fn protect(&self, prot: libc::c_int) -> io::Result<()> {
        // SAFETY: the range is exactly the region we own.
        let rc = unsafe { libc::mprotect(self.ptr.as_ptr().cast(), self.len, prot) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// System page size, 4096 if `sysconf` cannot tell.
    pub fn page_size() -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 { sz as usize } else { 4096 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Pointer to `offset` bytes into the mapping.
    ///
    /// # Panics
    /// If `offset` is past the end.
    pub fn at(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len, "offset {offset} outside mapping of {} bytes", self.len);
        // SAFETY: offset is in bounds.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    /// Volatile read of one byte.
    pub fn read(&self, offset: usize) -> u8 {
        // SAFETY: `at` bounds-checks; the mapping is readable.
        unsafe { std::ptr::read_volatile(self.at(offset)) }
    }

    /// Volatile write of one byte.
    pub fn write(&mut self, offset: usize, value: u8) {
        // SAFETY: `at` bounds-checks; the mapping is writable.
        unsafe { std::ptr::write_volatile(self.at(offset), value) }
    }

    /// Set every byte to `value`.
    pub fn fill(&mut self, value: u8) {
        // SAFETY: writes exactly `len` bytes of the region we own.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), value, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("addr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_mapping_is_zeroed_and_page_aligned() {
        let m = Mapping::anonymous(2 * Mapping::page_size()).unwrap();
        assert_eq!(m.as_ptr().addr() % Mapping::page_size(), 0);
        assert_eq!(m.read(0), 0);
        assert_eq!(m.read(m.len() - 1), 0);
    }

    #[test]
    fn fill_and_write() {
        let mut m = Mapping::anonymous(4096).unwrap();
        m.fill(0x01);
        m.write(17, 0x2d);
        assert_eq!(m.read(0), 0x01);
        assert_eq!(m.read(17), 0x2d);
        assert_eq!(m.read(4095), 0x01);
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(matches!(Mapping::anonymous(0), Err(Error::InvalidConfig(_))));
    }

    #[test]
    #[should_panic(expected = "outside mapping")]
    fn out_of_bounds_offset_panics() {
        let m = Mapping::anonymous(4096).unwrap();
        m.at(4096);
    }
}

//! Setup errors.
//!
//! Only setup can fail: capability detection, process configuration and
//! memory acquisition. Timing noise during measurement is never an error; it
//! is absorbed by the histogram.

use std::io;

/// Fatal setup error. Any of these aborts a run before measurement begins.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The CPU or kernel does not advertise the memory tagging extension.
    #[error("memory tagging extension not available on this machine")]
    MteUnsupported,

    /// The kernel rejected the tagged-address ABI / tag-check-fault request.
    #[error("prctl(PR_SET_TAGGED_ADDR_CTRL) failed: {0}")]
    TaggedAddrCtrl(#[source] io::Error),

    /// An anonymous mapping could not be reserved.
    #[error("mmap of {len} bytes failed: {source}")]
    Map {
        len: usize,
        #[source]
        source: io::Error,
    },

    /// A mapping could not be switched to tag-checked memory.
    #[error("mprotect(PROT_MTE) of {len} bytes failed: {source}")]
    Protect {
        len: usize,
        #[source]
        source: io::Error,
    },

    /// The thread could not be bound to the requested CPU.
    #[error("sched_setaffinity failed: {0}")]
    Affinity(#[source] io::Error),

    /// A configuration value is out of its documented range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_error_mentions_length() {
        let err = Error::Map {
            len: 4096,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn source_is_preserved() {
        use std::error::Error as _;
        let err = Error::TaggedAddrCtrl(io::Error::from_raw_os_error(libc::EINVAL));
        assert!(err.source().is_some());
    }
}

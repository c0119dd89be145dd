//! Flush+Reload probe array.
//!
//! `buckets` addressable slots spaced `stride` bytes apart, so that no two
//! buckets share a cache line (and with the default 4 KiB stride, no two
//! share a page and the adjacent-line prefetcher stays out of the way). Each
//! replica is a separate mapping with the same layout; a bucket counts as hit
//! in a sweep only if every replica reloads fast.
//!
//! Cache state is never stored. It is derived each round by timing a reload,
//! and every reload leaves the bucket evicted for the next round.

use log::debug;

use crate::arch::ProbeOps;
use crate::error::{Error, Result};
use crate::histogram::Histogram;
use crate::mem::Mapping;
use crate::timing::measure;

/// Byte the probe memory is painted with on reset.
pub const FILL_BYTE: u8 = 0x01;

const CACHE_LINE: usize = 64;

/// Shape of the probe array.
///
/// # Example
/// ```
/// # use tagprobe_core::ProbeConfig;
/// let config = ProbeConfig {
///     buckets: 8,
///     ..ProbeConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Number of buckets. Signal values are used directly as bucket indices,
    /// so byte-valued signals need the full 256.
    ///
    /// **Range:** 1+. **Default:** `256`
    pub buckets: usize,

    /// Distance between consecutive buckets in bytes.
    ///
    /// **Range:** non-zero multiple of 64. **Default:** `4096`
    pub stride: usize,

    /// Number of independent probe arrays. More replicas trade speed for
    /// fewer false positives.
    ///
    /// **Range:** 1+. **Default:** `1`
    pub replicas: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            buckets: 256,
            stride: 4096,
            replicas: 1,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buckets == 0 {
            return Err(Error::InvalidConfig("buckets must be at least 1".into()));
        }
        if self.replicas == 0 {
            return Err(Error::InvalidConfig("replicas must be at least 1".into()));
        }
        if self.stride == 0 || self.stride % CACHE_LINE != 0 {
            return Err(Error::InvalidConfig(format!(
                "stride {} is not a non-zero multiple of {CACHE_LINE}",
                self.stride
            )));
        }
        Ok(())
    }

    /// Bytes reserved per replica.
    pub fn replica_len(&self) -> Result<usize> {
        self.buckets
            .checked_mul(self.stride)
            .ok_or_else(|| Error::InvalidConfig("buckets * stride overflows".into()))
    }
}

/// Clamp an inclusive sweep range to `[0, buckets)`.
///
/// An out-of-range start falls back to 0 and an out-of-range end to the last
/// bucket. A start past the end yields an empty sweep.
pub fn clamp_range(start: usize, end: usize, buckets: usize) -> (usize, usize) {
    let last = buckets.saturating_sub(1);
    let start = if start >= buckets { 0 } else { start };
    let end = if end >= buckets { last } else { end };
    (start, end)
}

#[derive(Debug)]
pub struct ProbeArray<O: ProbeOps> {
    ops: O,
    config: ProbeConfig,
    replicas: Vec<Mapping>,
}

impl<O: ProbeOps> ProbeArray<O> {
    /// Map every replica, paint it and evict it.
    pub fn new(ops: O, config: ProbeConfig) -> Result<Self> {
        config.validate()?;
        let len = config.replica_len()?;
        let replicas = (0..config.replicas)
            .map(|_| Mapping::anonymous(len))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "probe array: {} buckets x {} bytes x {} replicas",
            config.buckets, config.stride, config.replicas
        );
        let mut probe = Self {
            ops,
            config,
            replicas,
        };
        probe.reset();
        Ok(probe)
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn buckets(&self) -> usize {
        self.config.buckets
    }

    pub fn replicas(&self) -> usize {
        self.config.replicas
    }

    /// Address of `bucket` in `replica`.
    ///
    /// # Panics
    /// If either index is out of range.
    pub fn address(&self, bucket: usize, replica: usize) -> *mut u8 {
        assert!(
            bucket < self.config.buckets,
            "bucket {bucket} out of range (0..{})",
            self.config.buckets
        );
        self.replicas[replica].at(bucket * self.config.stride)
    }

    /// Repaint every replica and evict every bucket.
    pub fn reset(&mut self) {
        for replica in &mut self.replicas {
            replica.fill(FILL_BYTE);
        }
        self.evict_all();
    }

    /// Evict `bucket` in every replica, then barrier.
    pub fn evict(&self, bucket: usize) {
        for r in 0..self.replicas() {
            // SAFETY: address() bounds-checks into a live mapping.
            unsafe { self.ops.flush(self.address(bucket, r)) };
        }
        self.ops.barrier();
    }

    pub fn evict_all(&self) {
        for bucket in 0..self.buckets() {
            for r in 0..self.replicas() {
                // SAFETY: address() bounds-checks into a live mapping.
                unsafe { self.ops.flush(self.address(bucket, r)) };
            }
        }
        self.ops.barrier();
    }

    /// Untimed load of `bucket` in every replica.
    pub fn prime(&self, bucket: usize) {
        for r in 0..self.replicas() {
            self.load(bucket, r);
        }
    }

    /// Untimed load of one replica's bucket.
    #[inline(always)]
    pub fn load(&self, bucket: usize, replica: usize) {
        // SAFETY: address() bounds-checks into a live mapping.
        unsafe { self.ops.load(self.address(bucket, replica)) };
    }

    /// Untimed store to one replica's bucket.
    #[inline(always)]
    pub fn store(&self, bucket: usize, replica: usize) {
        // SAFETY: address() bounds-checks into a live, writable mapping.
        unsafe { self.ops.store(self.address(bucket, replica)) };
    }

    /// Time a single load of one replica's bucket. Leaves cache state alone.
    pub fn time_load(&self, bucket: usize, replica: usize) -> u64 {
        let addr = self.address(bucket, replica);
        measure(&self.ops, || {
            // SAFETY: address() bounds-checks into a live mapping.
            unsafe { self.ops.load(addr) };
            self.ops.barrier();
        })
    }

    /// Time loading `bucket` across all replicas, then evict it.
    ///
    /// Eviction happens whatever the measured duration.
    pub fn timed_reload(&self, bucket: usize) -> u64 {
        let t = measure(&self.ops, || {
            for r in 0..self.replicas() {
                self.load(bucket, r);
                self.ops.barrier();
            }
        });
        self.evict(bucket);
        t
    }

    /// Reload every bucket in the inclusive range `start..=end` and record
    /// hits in `histogram`. Returns the number of buckets counted as hits.
    ///
    /// The range is clamped with [`clamp_range`]. A bucket is a hit only if
    /// every replica reloads strictly below `threshold`, and is recorded at
    /// most once per sweep. Every swept bucket ends evicted.
    pub fn reload_sweep(
        &self,
        start: usize,
        end: usize,
        threshold: u64,
        histogram: &mut Histogram,
    ) -> usize {
        let (start, end) = clamp_range(start, end, self.buckets());
        let mut hits = 0;
        for bucket in start..=end {
            let fast = (0..self.replicas())
                .filter(|&r| self.time_load(bucket, r) < threshold)
                .count();
            self.evict(bucket);
            if fast == self.replicas() {
                histogram.record_hit(bucket);
                hits += 1;
            }
        }
        self.ops.barrier();
        hits
    }

    /// [`reload_sweep`](Self::reload_sweep) over every bucket.
    pub fn reload_all(&self, threshold: u64, histogram: &mut Histogram) -> usize {
        self.reload_sweep(0, self.buckets() - 1, threshold, histogram)
    }
}

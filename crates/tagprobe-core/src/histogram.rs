//! Per-bucket hit accumulator and ranked queries over it.
//!
//! A bucket's count is the number of sweeps in which it was found cached.
//! Counts only grow until [`Histogram::reset`] or a destructive
//! [`Histogram::ranked_dump`].

use serde::Serialize;

/// Smallest non-zero bucket plus the sum over all buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MinStats {
    pub bucket: usize,
    pub hits: u64,
    pub total: u64,
}

/// One line of a ranked dump.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankedEntry {
    pub bucket: usize,
    pub hits: u64,
    /// `hits / rounds * 100`.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    counts: Vec<u64>,
}

impl Histogram {
    pub fn new(buckets: usize) -> Self {
        Self {
            counts: vec![0; buckets],
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Raw counts, indexed by bucket.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Count one hit for `bucket`. Out-of-range buckets are ignored.
    pub fn record_hit(&mut self, bucket: usize) {
        if let Some(c) = self.counts.get_mut(bucket) {
            *c = c.saturating_add(1);
        }
    }

    pub fn reset(&mut self) {
        self.counts.fill(0);
    }

    /// Count for one bucket; zero when out of range.
    pub fn count_for(&self, bucket: usize) -> u64 {
        self.counts.get(bucket).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Bucket with the smallest non-zero count, or `None` when every count is
    /// zero. Ties go to the lowest index.
    pub fn stats_min(&self) -> Option<MinStats> {
        let mut total = 0u64;
        let mut min: Option<(usize, u64)> = None;
        for (bucket, &hits) in self.counts.iter().enumerate() {
            total += hits;
            if hits == 0 {
                continue;
            }
            if min.is_none_or(|(_, m)| hits < m) {
                min = Some((bucket, hits));
            }
        }
        min.map(|(bucket, hits)| MinStats { bucket, hits, total })
    }

    /// Every bucket that received a hit, ascending by count.
    ///
    /// Consumes the histogram: each listed bucket is zeroed as it is popped,
    /// so afterwards [`stats_min`](Self::stats_min) returns `None`.
    pub fn ranked_dump(&mut self, rounds: u64) -> Vec<RankedEntry> {
        let mut out = Vec::new();
        while let Some(stats) = self.stats_min() {
            let percent = if rounds == 0 {
                0.0
            } else {
                stats.hits as f64 / rounds as f64 * 100.0
            };
            out.push(RankedEntry {
                bucket: stats.bucket,
                hits: stats.hits,
                percent,
            });
            self.counts[stats.bucket] = 0;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_counts(counts: &[u64]) -> Histogram {
        let mut h = Histogram::new(counts.len());
        for (bucket, &n) in counts.iter().enumerate() {
            for _ in 0..n {
                h.record_hit(bucket);
            }
        }
        h
    }

    #[test]
    fn empty_histogram_has_no_data() {
        let h = Histogram::new(256);
        assert_eq!(h.stats_min(), None);
        assert_eq!(h.total(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut h = with_counts(&[1, 2, 3]);
        h.reset();
        assert_eq!(h.stats_min(), None);
        assert!(h.counts().iter().all(|&c| c == 0));
    }

    #[test]
    fn min_skips_zero_buckets() {
        let h = with_counts(&[0, 5, 0, 2, 9]);
        assert_eq!(
            h.stats_min(),
            Some(MinStats {
                bucket: 3,
                hits: 2,
                total: 16
            })
        );
    }

    #[test]
    fn min_tie_goes_to_lowest_index() {
        let h = with_counts(&[0, 4, 7, 4]);
        assert_eq!(h.stats_min().unwrap().bucket, 1);
    }

    #[test]
    fn ranked_dump_is_ascending_and_destructive() {
        let mut h = with_counts(&[0, 30, 10, 0, 20, 10]);
        let dump = h.ranked_dump(100);
        let order: Vec<(usize, u64)> = dump.iter().map(|e| (e.bucket, e.hits)).collect();
        assert_eq!(order, vec![(2, 10), (5, 10), (4, 20), (1, 30)]);
        assert!((dump[3].percent - 30.0).abs() < 1e-9);
        assert_eq!(h.stats_min(), None);
    }

    #[test]
    fn ranked_dump_of_empty_histogram() {
        let mut h = Histogram::new(8);
        assert!(h.ranked_dump(1000).is_empty());
    }

    #[test]
    fn ranked_dump_with_zero_rounds() {
        let mut h = with_counts(&[0, 1]);
        let dump = h.ranked_dump(0);
        assert_eq!(dump[0].percent, 0.0);
    }

    #[test]
    fn count_for_out_of_range_is_zero() {
        let mut h = Histogram::new(4);
        h.record_hit(99);
        assert_eq!(h.count_for(99), 0);
        assert_eq!(h.total(), 0);
    }
}

//! The measurement context: probe array, histogram and hit threshold owned
//! together and passed by `&mut` to everything that measures.
//!
//! A `FlushReload` is neither `Send` nor `Sync`. Running campaigns in
//! parallel means one context per thread; sharing a probe array between
//! concurrent campaigns would mix their signals.

use log::debug;
use serde::Serialize;

use crate::arch::ProbeOps;
use crate::calibrate::{self, Calibration, CalibrationConfig, DEFAULT_HIT_THRESHOLD, LoadStrategy};
use crate::error::Result;
use crate::histogram::Histogram;
use crate::probe::{ProbeArray, ProbeConfig};

/// Warm/cold classification rates for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SelfTestReport {
    pub bucket: usize,
    pub trials: usize,
    pub hit_threshold: u64,
    /// Trials where prime-then-reload was classified as a hit.
    pub warm_hits: usize,
    /// Trials where evict-then-reload was classified as a miss.
    pub cold_misses: usize,
}

impl SelfTestReport {
    pub fn warm_hit_rate(&self) -> f64 {
        ratio(self.warm_hits, self.trials)
    }

    pub fn cold_miss_rate(&self) -> f64 {
        ratio(self.cold_misses, self.trials)
    }
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 { 0.0 } else { n as f64 / d as f64 }
}

#[derive(Debug)]
pub struct FlushReload<O: ProbeOps> {
    probe: ProbeArray<O>,
    histogram: Histogram,
    hit_threshold: u64,
}

impl<O: ProbeOps> FlushReload<O> {
    pub fn new(ops: O, config: ProbeConfig) -> Result<Self> {
        let probe = ProbeArray::new(ops, config)?;
        let histogram = Histogram::new(config.buckets);
        Ok(Self {
            probe,
            histogram,
            hit_threshold: DEFAULT_HIT_THRESHOLD,
        })
    }

    pub fn probe(&self) -> &ProbeArray<O> {
        &self.probe
    }

    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    pub fn histogram_mut(&mut self) -> &mut Histogram {
        &mut self.histogram
    }

    pub fn hit_threshold(&self) -> u64 {
        self.hit_threshold
    }

    pub fn set_hit_threshold(&mut self, ticks: u64) {
        self.hit_threshold = ticks;
    }

    /// Zero the histogram, repaint and evict the probe array.
    pub fn reset(&mut self) {
        self.histogram.reset();
        self.probe.reset();
    }

    /// Run the calibrator and adopt its threshold.
    pub fn calibrate(&mut self, strategy: LoadStrategy, config: &CalibrationConfig) -> Calibration {
        let cal = calibrate::calibrate(&mut self.probe, strategy, config);
        self.hit_threshold = cal.hit_threshold;
        cal
    }

    /// Whether a timed reload of `bucket` is below the threshold. Evicts it.
    pub fn is_hit(&self, bucket: usize) -> bool {
        self.probe.timed_reload(bucket) < self.hit_threshold
    }

    pub fn reload_sweep(&mut self, start: usize, end: usize) -> usize {
        self.probe
            .reload_sweep(start, end, self.hit_threshold, &mut self.histogram)
    }

    pub fn reload_all(&mut self) -> usize {
        self.probe.reload_all(self.hit_threshold, &mut self.histogram)
    }

    /// Prime-then-reload and evict-then-reload `bucket` `trials` times each.
    pub fn self_test(&self, bucket: usize, trials: usize) -> SelfTestReport {
        let mut warm_hits = 0;
        let mut cold_misses = 0;
        for _ in 0..trials {
            self.probe.prime(bucket);
            if self.is_hit(bucket) {
                warm_hits += 1;
            }
            self.probe.evict(bucket);
            if !self.is_hit(bucket) {
                cold_misses += 1;
            }
            std::thread::yield_now();
        }
        debug!("self-test bucket {bucket}: warm {warm_hits}/{trials}, cold {cold_misses}/{trials}");
        SelfTestReport {
            bucket,
            trials,
            hit_threshold: self.hit_threshold,
            warm_hits,
            cold_misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimulatedCache;
    use crate::error::Error;

    fn channel() -> FlushReload<SimulatedCache> {
        let config = ProbeConfig {
            buckets: 8,
            ..ProbeConfig::default()
        };
        FlushReload::new(SimulatedCache::new(), config).unwrap()
    }

    #[test]
    fn default_threshold_before_calibration() {
        assert_eq!(channel().hit_threshold(), 200);
    }

    #[test]
    fn calibrate_adopts_threshold() {
        let mut ch = channel();
        let cfg = CalibrationConfig {
            iterations: 10,
            ..CalibrationConfig::default()
        };
        ch.calibrate(LoadStrategy::Dependent, &cfg);
        assert_eq!(ch.hit_threshold(), 64);
        ch.calibrate(LoadStrategy::Independent, &cfg);
        assert_eq!(ch.hit_threshold(), 200);
    }

    #[test]
    fn simulated_self_test_is_perfect() {
        let ch = channel();
        let report = ch.self_test(3, 1000);
        assert_eq!(report.warm_hits, 1000);
        assert_eq!(report.cold_misses, 1000);
        assert_eq!(report.warm_hit_rate(), 1.0);
    }

    #[test]
    fn reset_clears_histogram() {
        let mut ch = channel();
        ch.probe().prime(1);
        ch.reload_all();
        assert_eq!(ch.histogram().count_for(1), 1);
        ch.reset();
        assert_eq!(ch.histogram().stats_min(), None);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn unsatisfiable_reservation_is_a_map_error() {
        // 4 PiB is past any user address space.
        let config = ProbeConfig {
            buckets: 1 << 40,
            stride: 4096,
            replicas: 1,
        };
        let err = FlushReload::new(SimulatedCache::new(), config).unwrap_err();
        assert!(matches!(err, Error::Map { len, .. } if len == (1 << 40) * 4096), "{err:?}");
    }

    #[test]
    fn overflowing_array_size_is_rejected() {
        let config = ProbeConfig {
            buckets: usize::MAX,
            ..ProbeConfig::default()
        };
        assert!(matches!(
            FlushReload::new(SimulatedCache::new(), config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn sweep_clamps_through_context() {
        let mut ch = channel();
        ch.set_hit_threshold(u64::MAX);
        assert_eq!(ch.reload_sweep(42, 43), 8);
    }

    #[test]
    fn zero_trials_rates() {
        let report = channel().self_test(0, 0);
        assert_eq!(report.warm_hit_rate(), 0.0);
        assert_eq!(report.cold_miss_rate(), 0.0);
    }
}

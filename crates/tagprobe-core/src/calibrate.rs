//! Hit-threshold calibration.
//!
//! The calibrator times back-to-back stores to one always-resident bucket and
//! records the extremes, but the threshold it returns is a fixed per-strategy
//! constant tuned on MTE-capable Cortex cores. The measured extremes are
//! reported for diagnostics only. Re-tune the constants when moving to new
//! hardware rather than deriving them from a single run.

use std::fmt;

use log::debug;
use serde::Serialize;

use crate::arch::ProbeOps;
use crate::probe::ProbeArray;
use crate::timing::measure;

/// Threshold for [`LoadStrategy::Independent`], in clock ticks.
pub const INDEPENDENT_HIT_THRESHOLD: u64 = 200;

/// Per-replica threshold for [`LoadStrategy::Dependent`], in clock ticks.
pub const DEPENDENT_TICKS_PER_REPLICA: u64 = 64;

/// Threshold in effect before any calibration.
pub const DEFAULT_HIT_THRESHOLD: u64 = INDEPENDENT_HIT_THRESHOLD;

/// How the classifier load relates to the address under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// The probe load is keyed by an out-of-band signal page. The probe
    /// array never aliases the tag-checked address, so contention noise is
    /// lower.
    #[default]
    Independent,
    /// The probe load is keyed by the byte read through the tested pointer.
    /// Simpler, but the classifier competes with the tested access and the
    /// noise floor scales with the replica count.
    Dependent,
}

impl LoadStrategy {
    /// Hit threshold for this strategy with `replicas` probe arrays.
    pub fn hit_threshold(self, replicas: usize) -> u64 {
        match self {
            Self::Independent => INDEPENDENT_HIT_THRESHOLD,
            Self::Dependent => DEPENDENT_TICKS_PER_REPLICA * replicas as u64,
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Independent => write!(f, "independent"),
            Self::Dependent => write!(f, "dependent"),
        }
    }
}

/// Configuration for a calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Number of timed stores.
    ///
    /// **Default:** `1000`
    pub iterations: usize,

    /// Bucket that is stored to (wrapped modulo the bucket count).
    ///
    /// **Default:** `b'A'` (65)
    pub probe_bucket: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            probe_bucket: b'A' as usize,
        }
    }
}

/// Outcome of [`calibrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Calibration {
    pub strategy: LoadStrategy,
    pub iterations: usize,
    /// Fastest observed resident access (diagnostic).
    pub min_ticks: u64,
    /// Slowest observed resident access (diagnostic).
    pub max_ticks: u64,
    /// Threshold selected by strategy policy.
    pub hit_threshold: u64,
}

/// Measure resident-access timing and select the hit threshold for
/// `strategy`.
///
/// The probe array is reset before and after. The scheduler is yielded
/// between iterations.
pub fn calibrate<O: ProbeOps>(
    probe: &mut ProbeArray<O>,
    strategy: LoadStrategy,
    config: &CalibrationConfig,
) -> Calibration {
    probe.reset();
    let bucket = config.probe_bucket % probe.buckets();

    let mut min_ticks = u64::MAX;
    let mut max_ticks = 0;
    for _ in 0..config.iterations {
        probe.store(bucket, 0);
        probe.ops().barrier();
        let t = measure(probe.ops(), || {
            probe.store(bucket, 0);
            probe.ops().barrier();
        });
        min_ticks = min_ticks.min(t);
        max_ticks = max_ticks.max(t);
        std::thread::yield_now();
    }
    if config.iterations == 0 {
        min_ticks = 0;
    }
    probe.reset();

    let hit_threshold = strategy.hit_threshold(probe.replicas());
    debug!(
        "calibrate: strategy={strategy} min={min_ticks} max={max_ticks} threshold={hit_threshold}"
    );
    Calibration {
        strategy,
        iterations: config.iterations,
        min_ticks,
        max_ticks,
        hit_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimulatedCache;
    use crate::probe::ProbeConfig;

    fn probe(replicas: usize) -> ProbeArray<SimulatedCache> {
        let config = ProbeConfig {
            replicas,
            ..ProbeConfig::default()
        };
        ProbeArray::new(SimulatedCache::new(), config).unwrap()
    }

    #[test]
    fn policy_constants() {
        assert_eq!(LoadStrategy::Independent.hit_threshold(1), 200);
        assert_eq!(LoadStrategy::Independent.hit_threshold(4), 200);
        assert_eq!(LoadStrategy::Dependent.hit_threshold(1), 64);
        assert_eq!(LoadStrategy::Dependent.hit_threshold(4), 256);
    }

    #[test]
    fn modes_give_different_thresholds() {
        let mut p = probe(1);
        let cfg = CalibrationConfig {
            iterations: 50,
            ..CalibrationConfig::default()
        };
        let indep = calibrate(&mut p, LoadStrategy::Independent, &cfg);
        let dep = calibrate(&mut p, LoadStrategy::Dependent, &cfg);
        assert_eq!(indep.hit_threshold, INDEPENDENT_HIT_THRESHOLD);
        assert_eq!(dep.hit_threshold, DEPENDENT_TICKS_PER_REPLICA);
        assert_ne!(indep.hit_threshold, dep.hit_threshold);
    }

    #[test]
    fn simulated_extremes_are_resident_costs() {
        let mut p = probe(1);
        let cal = calibrate(&mut p, LoadStrategy::Independent, &CalibrationConfig::default());
        assert_eq!(cal.iterations, 1000);
        assert_eq!(cal.min_ticks, SimulatedCache::HIT_COST);
        assert_eq!(cal.max_ticks, SimulatedCache::HIT_COST);
    }

    #[test]
    fn calibration_leaves_array_cold() {
        let mut p = probe(1);
        calibrate(&mut p, LoadStrategy::Dependent, &CalibrationConfig::default());
        assert_eq!(p.ops().resident_lines(), 0);
    }

    #[test]
    fn zero_iterations() {
        let mut p = probe(2);
        let cfg = CalibrationConfig {
            iterations: 0,
            ..CalibrationConfig::default()
        };
        let cal = calibrate(&mut p, LoadStrategy::Dependent, &cfg);
        assert_eq!((cal.min_ticks, cal.max_ticks), (0, 0));
        assert_eq!(cal.hit_threshold, 128);
    }

    #[test]
    fn strategy_display() {
        assert_eq!(LoadStrategy::Independent.to_string(), "independent");
        assert_eq!(LoadStrategy::Dependent.to_string(), "dependent");
    }
}

//! Timing primitive.
//!
//! [`measure`] turns "perform operation O" into "duration of O in clock
//! ticks". The barriers keep O from being reordered across either clock read;
//! they do nothing against interrupts or preemption, so occasional large
//! readings are expected and left to the caller's statistics.

use crate::arch::ProbeOps;

/// Duration of `op` in the native ticks of `ops.clock()`.
#[inline(always)]
pub fn measure<O, F, R>(ops: &O, op: F) -> u64
where
    O: ProbeOps + ?Sized,
    F: FnOnce() -> R,
{
    let start = ops.timestamp();
    std::hint::black_box(op());
    let end = ops.timestamp();
    end.wrapping_sub(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::NativeOps;
    use crate::arch::sim::SimulatedCache;

    #[test]
    fn empty_op_costs_nothing_in_simulation() {
        let sim = SimulatedCache::new();
        assert_eq!(measure(&sim, || ()), 0);
    }

    #[test]
    fn simulated_load_is_timed() {
        let sim = SimulatedCache::new();
        let byte = 0u8;
        let t = measure(&sim, || unsafe { sim.load(&byte) });
        assert_eq!(t, SimulatedCache::MISS_COST);
    }

    #[test]
    fn native_sleep_is_visible() {
        let ops = NativeOps::default();
        let t = measure(&ops, || std::thread::sleep(std::time::Duration::from_millis(2)));
        assert!(t >= 2_000_000, "slept 2ms but measured {t} ticks");
    }
}

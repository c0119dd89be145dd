use rand::Rng;
use tagprobe_core::{
    CalibrationConfig, CampaignConfig, CampaignResult, FaultMode, FlushReload, LeakOutcome,
    LeakTarget, LoadStrategy, MAX_TAG, Mapping, Mte, NativeOps, ProbeConfig, ProbeOps,
    SPEC_SIGNAL, SimulatedCache, TaggedRegion, leak_tag,
};

use super::{CliResult, GlobalOpts};

pub struct LeakArgs {
    pub secret: u8,
    pub max_tag: u8,
    pub rounds: u64,
    pub check_count: usize,
    pub strategy: LoadStrategy,
    pub fault_mode: FaultMode,
    pub replicas: usize,
    pub dump: bool,
}

/// A non-zero tag, like the ones the kernel hands out with `irg`.
pub fn random_secret() -> u8 {
    rand::rng().random_range(1..=MAX_TAG)
}

pub fn run(opts: &GlobalOpts, args: &LeakArgs, output: Option<&str>) -> CliResult {
    if args.secret > MAX_TAG || args.max_tag > MAX_TAG {
        return Err(format!("tags are 4 bits wide (0..={MAX_TAG})").into());
    }
    let probe = ProbeConfig {
        replicas: args.replicas,
        ..ProbeConfig::default()
    };

    let outcome = if opts.simulate {
        log::warn!("simulated cache: no speculation, the speculative signal stays at zero");
        let target = Mapping::anonymous(Mapping::page_size())?;
        sweep(FlushReload::new(SimulatedCache::new(), probe)?, &target, args)?
    } else {
        let mte = Mte::enable(args.fault_mode)?;
        let target = TaggedRegion::new(&mte, Mapping::page_size())?;
        sweep(FlushReload::new(NativeOps::default(), probe)?, &target, args)?
    };

    println!(
        "*** Leaked tag is '{}' (secret tag was '{}'), score {}.",
        outcome.leaked, outcome.secret, outcome.score
    );
    if !outcome.is_correct() {
        log::warn!("leaked tag does not match the secret");
    }

    if let Some(path) = output {
        super::write_json(path, &outcome)?;
    }
    Ok(())
}

fn sweep<O: ProbeOps, T: LeakTarget>(
    mut channel: FlushReload<O>,
    target: &T,
    args: &LeakArgs,
) -> Result<LeakOutcome, tagprobe_core::Error> {
    let cal = channel.calibrate(args.strategy, &CalibrationConfig::default());
    println!(
        "Calibration: min={} max={} threshold={}",
        cal.min_ticks, cal.max_ticks, cal.hit_threshold
    );
    println!("*** Secret tag is '{}'.", args.secret);

    let config = CampaignConfig {
        rounds: args.rounds,
        check_count: args.check_count,
        strategy: args.strategy,
        ..CampaignConfig::default()
    };
    let secret = args.secret;
    let dump = args.dump;
    leak_tag(&mut channel, target, secret, 0..=args.max_tag, &config, |c| {
        report_campaign(c, secret, dump)
    })
}

fn report_campaign(c: &CampaignResult, secret: u8, dump: bool) {
    let marker = if c.spec_tag == secret { "  <== secret" } else { "" };
    println!(
        "spec_tag={:2} arch_tag={:2} score={:6} total={:7}{}",
        c.spec_tag, c.arch_tag, c.score, c.total_hits, marker
    );
    if dump {
        super::print_histogram(&c.ranked, SPEC_SIGNAL as usize);
    }
}

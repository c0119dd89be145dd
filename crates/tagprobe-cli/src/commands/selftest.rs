use tagprobe_core::{
    CalibrationConfig, FlushReload, LoadStrategy, NativeOps, ProbeConfig, ProbeOps,
    SelfTestReport, SimulatedCache,
};

use super::{CliResult, GlobalOpts};

pub fn run(
    opts: &GlobalOpts,
    bucket: usize,
    trials: usize,
    buckets: usize,
    threshold: Option<u64>,
    output: Option<&str>,
) -> CliResult {
    if bucket >= buckets {
        return Err(format!("bucket {bucket} out of range (0..{buckets})").into());
    }
    let probe = ProbeConfig {
        buckets,
        ..ProbeConfig::default()
    };

    let report = if opts.simulate {
        execute(FlushReload::new(SimulatedCache::new(), probe)?, bucket, trials, threshold)
    } else {
        execute(FlushReload::new(NativeOps::default(), probe)?, bucket, trials, threshold)
    };

    println!(
        "Self-test: bucket {} x {} trials, threshold {} ticks",
        report.bucket, report.trials, report.hit_threshold
    );
    println!(
        "  prime  -> reload classified hit:  {:6.2}%",
        report.warm_hit_rate() * 100.0
    );
    println!(
        "  evict  -> reload classified miss: {:6.2}%",
        report.cold_miss_rate() * 100.0
    );
    if report.warm_hit_rate() < 0.95 || report.cold_miss_rate() < 0.95 {
        log::warn!("classification below 95%; machine may be loaded or threshold mistuned");
    }

    if let Some(path) = output {
        super::write_json(path, &report)?;
    }
    Ok(())
}

fn execute<O: ProbeOps>(
    mut channel: FlushReload<O>,
    bucket: usize,
    trials: usize,
    threshold: Option<u64>,
) -> SelfTestReport {
    match threshold {
        Some(t) => channel.set_hit_threshold(t),
        None => {
            channel.calibrate(LoadStrategy::Independent, &CalibrationConfig::default());
        }
    }
    channel.self_test(bucket, trials)
}

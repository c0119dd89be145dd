use tagprobe_core::{
    Calibration, CalibrationConfig, FlushReload, NativeOps, ProbeConfig, ProbeOps,
    SimulatedCache,
};

use super::{CliResult, GlobalOpts};

pub fn run(
    opts: &GlobalOpts,
    strategy: &str,
    iterations: usize,
    replicas: usize,
    output: Option<&str>,
) -> CliResult {
    let strategy = super::parse_strategy(strategy);
    let probe = ProbeConfig {
        replicas,
        ..ProbeConfig::default()
    };
    let config = CalibrationConfig {
        iterations,
        ..CalibrationConfig::default()
    };

    let cal = if opts.simulate {
        measure(FlushReload::new(SimulatedCache::new(), probe)?, strategy, &config)
    } else {
        measure(FlushReload::new(NativeOps::default(), probe)?, strategy, &config)
    };

    println!("Calibration ({} loads, {} iterations)", cal.strategy, cal.iterations);
    println!("  min resident access: {} ticks", cal.min_ticks);
    println!("  max resident access: {} ticks", cal.max_ticks);
    println!("  hit threshold:       {} ticks", cal.hit_threshold);

    if let Some(path) = output {
        super::write_json(path, &cal)?;
    }
    Ok(())
}

fn measure<O: ProbeOps>(
    mut channel: FlushReload<O>,
    strategy: tagprobe_core::LoadStrategy,
    config: &CalibrationConfig,
) -> Calibration {
    channel.calibrate(strategy, config)
}

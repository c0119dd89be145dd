//! CLI for tagprobe: calibrate a Flush+Reload channel and leak MTE tags.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tagprobe")]
#[command(about = "tagprobe: Flush+Reload cache timing and speculative MTE tag leakage")]
#[command(version = tagprobe_core::VERSION)]
struct Cli {
    /// Pin the measuring thread to this logical CPU before doing anything else
    #[arg(long, global = true)]
    cpu: Option<usize>,

    /// Use the deterministic cache model instead of real cache-control instructions
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show machine information and MTE availability
    Info,

    /// Measure resident-access timing and print the selected hit threshold
    Calibrate {
        /// Classifier load strategy the threshold is selected for: independent (indep) or dependent (dep)
        #[arg(long, default_value = "independent")]
        strategy: String,

        /// Number of timed accesses
        #[arg(long, default_value = "1000")]
        iterations: usize,

        /// Number of probe array replicas
        #[arg(long, default_value = "1")]
        replicas: usize,

        /// Write the calibration as JSON
        #[arg(long)]
        output: Option<String>,
    },

    /// Warm/cold classification rates for one bucket
    Selftest {
        /// Bucket to prime and reload
        #[arg(long, default_value = "3")]
        bucket: usize,

        /// Trials per state
        #[arg(long, default_value = "1000")]
        trials: usize,

        /// Number of buckets in the probe array
        #[arg(long, default_value = "8")]
        buckets: usize,

        /// Hit threshold in clock ticks (skips calibration)
        #[arg(long)]
        threshold: Option<u64>,

        /// Write the report as JSON
        #[arg(long)]
        output: Option<String>,
    },

    /// Leak a secret allocation tag by trying every candidate tag
    Leak {
        /// Secret tag placed on the architectural granule
        #[arg(long, default_value = "5")]
        secret: u8,

        /// Pick a random non-zero secret tag instead of --secret
        #[arg(long)]
        random_secret: bool,

        /// Highest candidate tag (candidates are 0..=max-tag)
        #[arg(long, default_value = "15")]
        max_tag: u8,

        /// Rounds per candidate
        #[arg(long, default_value = "100000")]
        rounds: u64,

        /// Tag-checked loads per mispredicted iteration
        #[arg(long, default_value = "6")]
        check_count: usize,

        /// Classifier load strategy: independent (indep) or dependent (dep)
        #[arg(long, default_value = "independent")]
        strategy: String,

        /// Tag check fault mode: sync or async
        #[arg(long, default_value = "async")]
        fault_mode: String,

        /// Number of probe array replicas
        #[arg(long, default_value = "1")]
        replicas: usize,

        /// Print the full ranked histogram of every campaign
        #[arg(long)]
        dump: bool,

        /// Write the outcome as JSON
        #[arg(long)]
        output: Option<String>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Some(cpu) = cli.cpu {
        if let Err(e) = tagprobe_core::pin_to_cpu(cpu) {
            commands::fail(&e);
        }
        log::debug!("pinned to cpu {cpu}");
    }

    let opts = commands::GlobalOpts {
        simulate: cli.simulate,
    };

    let result = match cli.command {
        Commands::Info => {
            commands::info::run();
            Ok(())
        }
        Commands::Calibrate {
            strategy,
            iterations,
            replicas,
            output,
        } => commands::calibrate::run(&opts, &strategy, iterations, replicas, output.as_deref()),
        Commands::Selftest {
            bucket,
            trials,
            buckets,
            threshold,
            output,
        } => commands::selftest::run(&opts, bucket, trials, buckets, threshold, output.as_deref()),
        Commands::Leak {
            secret,
            random_secret,
            max_tag,
            rounds,
            check_count,
            strategy,
            fault_mode,
            replicas,
            dump,
            output,
        } => commands::leak::run(
            &opts,
            &commands::leak::LeakArgs {
                secret: if random_secret {
                    commands::leak::random_secret()
                } else {
                    secret
                },
                max_tag,
                rounds,
                check_count,
                strategy: commands::parse_strategy(&strategy),
                fault_mode: commands::parse_fault_mode(&fault_mode),
                replicas,
                dump,
            },
            output.as_deref(),
        ),
    };

    if let Err(e) = result {
        commands::fail(&e);
    }
}

pub mod calibrate;
pub mod info;
pub mod leak;
pub mod selftest;

use std::fmt::Display;
use std::fs::File;
use std::io::BufWriter;

use serde::Serialize;
use tagprobe_core::{FaultMode, LoadStrategy, RankedEntry};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Options shared by every subcommand.
pub struct GlobalOpts {
    pub simulate: bool,
}

/// Report a fatal error and exit with status 1.
pub fn fail(err: &dyn Display) -> ! {
    eprintln!("error: {err}");
    std::process::exit(1);
}

/// Parse a load strategy string into the enum.
pub fn parse_strategy(s: &str) -> LoadStrategy {
    match s {
        "independent" | "indep" => LoadStrategy::Independent,
        "dependent" | "dep" => LoadStrategy::Dependent,
        _ => {
            eprintln!("Unknown load strategy '{s}', using independent");
            LoadStrategy::Independent
        }
    }
}

/// Parse a fault mode string into the enum.
pub fn parse_fault_mode(s: &str) -> FaultMode {
    match s {
        "sync" => FaultMode::Sync,
        "async" => FaultMode::Async,
        _ => {
            eprintln!("Unknown fault mode '{s}', using async");
            FaultMode::Async
        }
    }
}

/// Printable form of a bucket index: the ASCII character when it has one.
pub fn bucket_label(bucket: usize) -> char {
    match u8::try_from(bucket) {
        Ok(b) if b > 32 && b < 126 => b as char,
        _ => '?',
    }
}

/// Print a ranked histogram, marking `highlight`.
pub fn print_histogram(ranked: &[RankedEntry], highlight: usize) {
    if ranked.is_empty() {
        println!("  <empty>");
        return;
    }
    for e in ranked {
        println!(
            "  '{}' (0x{:02x}): {:5.2}% {}",
            bucket_label(e.bucket),
            e.bucket,
            e.percent,
            if e.bucket == highlight { "<----" } else { "" }
        );
    }
}

/// Write `value` as pretty JSON to `path`.
pub fn write_json<T: Serialize>(path: &str, value: &T) -> CliResult {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    log::info!("wrote {path}");
    Ok(())
}

//! # tagprobe-core
//!
//! **Flush+Reload cache timing, calibrated and tallied.**
//!
//! `tagprobe-core` measures whether a set of probe locations is cache
//! resident and uses many noisy rounds of that measurement to decide which of
//! several candidate values a (possibly speculative) access touched. The
//! shipped application recovers a hidden MTE allocation tag by letting a
//! mispredicted loop step one granule out of bounds.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tagprobe_core::{
//!     CalibrationConfig, FlushReload, LoadStrategy, NativeOps, ProbeConfig,
//! };
//!
//! let mut channel = FlushReload::new(NativeOps::default(), ProbeConfig::default())?;
//! channel.calibrate(LoadStrategy::Independent, &CalibrationConfig::default());
//!
//! channel.probe().prime(b'A' as usize);
//! channel.reload_all();
//! let hits = channel.histogram().count_for(b'A' as usize);
//! assert!(hits <= 1);
//! # Ok::<(), tagprobe_core::Error>(())
//! ```
//!
//! ## Architecture
//!
//! ProbeOps (per-arch) → ProbeArray → Calibrator / Histogram → FlushReload
//! context → leakage campaigns.
//!
//! Only setup returns errors. Timing noise is never an error: it is absorbed
//! by running many rounds.

pub mod arch;
pub mod calibrate;
pub mod channel;
pub mod error;
pub mod histogram;
pub mod leak;
pub mod mem;
pub mod mte;
pub mod platform;
pub mod probe;
pub mod timing;

pub use arch::sim::SimulatedCache;
pub use arch::{NativeOps, ProbeOps};
pub use calibrate::{Calibration, CalibrationConfig, LoadStrategy, calibrate};
pub use channel::{FlushReload, SelfTestReport};
pub use error::{Error, Result};
pub use histogram::{Histogram, MinStats, RankedEntry};
pub use leak::{
    ARCH_SIGNAL, CampaignConfig, CampaignResult, LeakOutcome, LeakTarget, SPEC_SIGNAL,
    SpecTagTest, leak_tag, select_strongest,
};
pub use mem::Mapping;
pub use mte::{FaultMode, MAX_TAG, Mte, TaggedRegion};
pub use platform::{MachineInfo, detect_machine_info, pin_to_cpu};
pub use probe::{ProbeArray, ProbeConfig};
pub use timing::measure;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

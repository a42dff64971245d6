//! Spike-train and passive-membrane statistics from intracellular
//! current-clamp recordings: extraction into pprox point-process
//! documents, CSV summary tables, and diagnostic figures.

pub mod error;
pub mod extract;
pub mod graphics;
pub mod interval;
pub mod logging;
pub mod passive;
pub mod pprox;
pub mod recording;
pub mod registry;
pub mod spikes;
pub mod stats;
pub mod steps;
pub mod table;
pub mod units;

pub use error::EphysError;
pub use extract::{extract_epoch, EpochId, ExtractParams};
pub use interval::Interval;
pub use pprox::Document;
pub use recording::Recording;
pub use registry::Registry;
pub use spikes::{detect_sweep, Detection, SpikeFinder, SpikeParams};
pub use steps::{runlength_decode, runlength_encode, StepKind, StepProtocol};

/// Crate version, logged by every tool.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

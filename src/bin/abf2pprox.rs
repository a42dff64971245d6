//! Extract spike times and other statistics from a recording epoch and
//! store them in pprox format.
//!
//! The recording is assumed to come from a current-clamp protocol in which
//! the neuron was stimulated with a single depolarizing step current
//! followed by nested hyperpolarizing steps to check input and series
//! resistance.

use std::path::PathBuf;

use anyhow::Context;
use chrono::Local;
use clap::Parser;

use patchstats::extract::{extract_epoch, EpochId, ExtractParams};
use patchstats::logging;
use patchstats::recording::Recording;
use patchstats::registry::{epoch_files, short_name, Registry};
use patchstats::spikes::SpikeParams;
use patchstats::EphysError;

#[derive(Parser, Debug)]
#[command(name = "abf2pprox", about = "Extract spike times and other statistics from a recording epoch and store in pprox format")]
struct Cli {
    /// Show verbose log messages
    #[arg(long)]
    debug: bool,

    /// Directory to store the output file
    #[arg(long = "output-dir", short = 'O', default_value = "build")]
    output_dir: PathBuf,

    /// Root of the local resource registry (default: $NBANK_REGISTRY)
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Approximate rise time for spikes (ms)
    #[arg(long = "rise-ms", default_value_t = 1.0)]
    rise_ms: f64,

    /// Minimum amplitude for the first spike (mV)
    #[arg(long = "first-spike-amplitude-min", default_value_t = 30.0)]
    first_spike_amplitude_min: f64,

    /// Minimum amplitude for subsequent spikes (mV)
    #[arg(long = "spike-amplitude-min", default_value_t = 10.0)]
    spike_amplitude_min: f64,

    /// Threshold for dynamic spike detection (fraction of first spike height)
    #[arg(long = "spike-thresh-rel", default_value_t = 0.35)]
    spike_thresh_rel: f64,

    /// Alternate minimum threshold for spike detection (mV)
    #[arg(long = "spike-thresh-min", default_value_t = -50.0, allow_negative_numbers = true)]
    spike_thresh_min: f64,

    /// The window around each spike to analyze (ms before and after)
    #[arg(
        long = "spike-analysis-window",
        num_args = 2,
        default_values_t = [-7.0, 100.0],
        allow_negative_numbers = true
    )]
    spike_analysis_window: Vec<f64>,

    /// Upsampling ratio for spike shape analysis
    #[arg(long = "spike-upsample", default_value_t = 2)]
    spike_upsample: usize,

    /// Identifier for the neuron
    neuron: String,

    /// Index of the epoch to analyze
    epoch: usize,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);
    if let Err(err) = run(&cli) {
        log::error!("  - error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    log::info!("- date: {}", Local::now());
    log::info!("- version: {}", patchstats::VERSION);
    log::info!("- analyzing: {}/{}", cli.neuron, cli.epoch);

    let registry = Registry::from_flag_or_env(cli.registry.clone())?;
    let path = registry
        .get(&cli.neuron)
        .ok_or_else(|| EphysError::MissingResource(cli.neuron.clone()))?;
    let files = epoch_files(&path)?;
    let abf = files
        .get(cli.epoch.wrapping_sub(1))
        .ok_or(EphysError::NoSuchEpoch {
            epoch: cli.epoch,
            available: files.len(),
        })?;

    log::info!("- reading {}", abf.display());
    let recording = Recording::open(abf)?;

    let params = ExtractParams {
        spikes: SpikeParams {
            rise_ms: cli.rise_ms,
            first_spike_amp_min: cli.first_spike_amplitude_min,
            spike_amp_min: cli.spike_amplitude_min,
            thresh_rel: cli.spike_thresh_rel,
            thresh_min: cli.spike_thresh_min,
            window_ms: (cli.spike_analysis_window[0], cli.spike_analysis_window[1]),
            upsample: cli.spike_upsample,
        },
        ..Default::default()
    };
    let id = EpochId {
        source: registry.full_url(&cli.neuron),
        cell: short_name(&cli.neuron).to_string(),
        epoch: cli.epoch as u32,
        abf_file: abf
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let doc = extract_epoch(&recording, &id, &params)?;

    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("cannot create `{}`", cli.output_dir.display()))?;
    let output_file = cli.output_dir.join(doc.file_name());
    doc.write(&output_file)?;
    log::info!("- wrote results to `{}`", output_file.display());
    Ok(())
}

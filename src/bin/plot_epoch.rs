//! Plot an intracellular epoch for inspection or figure generation:
//! spike raster, stacked voltage traces, and the command current, read
//! back from the pprox file and its source recording.

use std::path::PathBuf;

use chrono::Local;
use clap::Parser;

use patchstats::graphics::{render_epoch_png, save_png, EpochFigure, PlotStyle, SweepTraces};
use patchstats::logging;
use patchstats::pprox::Document;
use patchstats::recording::Recording;
use patchstats::registry::{parse_resource_id, Registry};
use patchstats::units::JUNCTION_POTENTIAL_MV;
use patchstats::EphysError;

#[derive(Parser, Debug)]
#[command(name = "plot-epoch", about = "Plot an intracellular epoch for inspection or figure generation")]
struct Cli {
    /// Show verbose log messages
    #[arg(long)]
    debug: bool,

    /// Plot width (inches)
    #[arg(long, short = 'W', default_value_t = 6.0)]
    width: f64,

    /// Plot height (inches)
    #[arg(long, short = 'H', default_value_t = 8.0)]
    height: f64,

    /// Filename or directory to save the plot
    #[arg(long, short = 'O')]
    output: Option<PathBuf>,

    /// Combine voltage plots on a shared axis
    #[arg(long)]
    combine: bool,

    /// Set xlim (ms)
    #[arg(long, short = 'x', num_args = 2, allow_negative_numbers = true)]
    xlim: Option<Vec<f64>>,

    /// Set ylim (mV)
    #[arg(
        long,
        short = 'y',
        num_args = 2,
        default_values_t = [-140.0, 30.0],
        allow_negative_numbers = true
    )]
    ylim: Vec<f64>,

    /// Root of the local resource registry (default: $NBANK_REGISTRY)
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Epoch pprox file
    epoch: PathBuf,
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
    log::info!("- pprox file: {}", cli.epoch.display());
    let pprox = Document::read(&cli.epoch)?;
    log::info!("- neuron resource: {}", pprox.source);

    let registry = Registry::from_flag_or_env(cli.registry.clone())?;
    let resource_id = parse_resource_id(&pprox.source);
    let resource_path = registry
        .get(resource_id)
        .ok_or_else(|| EphysError::MissingResource(resource_id.to_string()))?;
    let abf_path = resource_path.join(format!("{}.json", pprox.abf_file));

    log::info!("- recording file: {}", abf_path.display());
    let recording = Recording::open(&abf_path)?;

    let mut sweeps = Vec::new();
    for (sweep, trial) in recording.sweeps.iter().zip(&pprox.pprox) {
        let dt_ms = sweep.sampling_period() * 1e3;
        sweeps.push(SweepTraces {
            dt_ms,
            voltage: sweep
                .voltage_mv()?
                .into_iter()
                .map(|v| v - JUNCTION_POTENTIAL_MV)
                .collect(),
            current: sweep.command_pa()?,
            events_ms: trial.events.iter().map(|t| t * 1e3).collect(),
        });
    }
    let fig = EpochFigure {
        title: format!("{}_{:02}", pprox.cell, pprox.epoch),
        sweeps,
        combine: cli.combine,
        ylim: (cli.ylim[0], cli.ylim[1]),
        xlim: cli.xlim.as_ref().map(|x| (x[0], x[1])),
    };
    let style = PlotStyle::default().with_size(
        (cli.width * 100.0).round() as u32,
        (cli.height * 100.0).round() as u32,
    );
    let png = render_epoch_png(&fig, &style)?;

    let path = output_path(cli.output.as_deref(), &cli.epoch);
    save_png(&path, &png)?;
    Ok(())
}

/// Figures land next to the pprox file unless `--output` names a file or
/// directory.
fn output_path(output: Option<&std::path::Path>, epoch: &std::path::Path) -> PathBuf {
    match output {
        Some(path) if path.is_dir() => path
            .join(epoch.file_stem().unwrap_or_default())
            .with_extension("png"),
        Some(path) => path.to_path_buf(),
        None => epoch.with_extension("png"),
    }
}

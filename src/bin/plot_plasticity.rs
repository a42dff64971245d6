//! Plot the plasticity summary for one cell: binned I-V and f-I curves per
//! epoch, time courses of the firing and passive properties, and example
//! rasters and traces from the first and last analyzed epoch.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::Local;
use clap::Parser;
use serde::Deserialize;

use patchstats::graphics::{
    render_plasticity_png, save_png, EpochCurve, ExampleEpoch, PlasticityFigure, PlotStyle,
    SweepTraces, TimeCourse, TimePoint,
};
use patchstats::logging;
use patchstats::pprox::Document;
use patchstats::recording::Recording;
use patchstats::registry::{parse_resource_id, short_name, Registry};
use patchstats::stats::{EpochStats, IvRow, SweepStats};
use patchstats::table;
use patchstats::units::JUNCTION_POTENTIAL_MV;
use patchstats::EphysError;

/// I-V curves are averaged within current bins of this width (pA).
const IV_BIN_PA: f64 = 10.0;

#[derive(Parser, Debug)]
#[command(name = "plot-plasticity", about = "Plot epochs from a neuron for figure generation")]
struct Cli {
    /// Show verbose log messages
    #[arg(long)]
    debug: bool,

    /// Directory where response stats and pprox files are stored
    #[arg(long = "build-dir", default_value = "build")]
    build_dir: PathBuf,

    /// Filename or directory to save the plot
    #[arg(long, short = 'O')]
    output: Option<PathBuf>,

    /// File with the list of cells/epochs used to analyze plasticity
    #[arg(long = "epoch-list", default_value = "inputs/plasticity_epochs.csv")]
    epoch_list: PathBuf,

    /// List of sweeps to display
    #[arg(long, short = 's', num_args = 1.., default_values_t = [10, 14, 17])]
    sweeps: Vec<usize>,

    /// Root of the local resource registry (default: $NBANK_REGISTRY)
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Cell identifier (short)
    cell: String,
}

#[derive(Debug, Deserialize)]
struct EpochListRow {
    cell: String,
    epoch: u32,
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

    let iv: Vec<IvRow> = table::read_table(&cli.build_dir.join(table::IV_STATS))?;
    let sweep_stats: Vec<SweepStats> = table::read_table(&cli.build_dir.join(table::SWEEP_STATS))?;
    let epoch_stats: Vec<EpochStats> = table::read_table(&cli.build_dir.join(table::EPOCH_STATS))?;
    let list: Vec<EpochListRow> = table::read_table(&cli.epoch_list)
        .with_context(|| format!("cannot read `{}`", cli.epoch_list.display()))?;

    let epoch_idx: Vec<u32> = list
        .iter()
        .filter(|row| short_name(&row.cell) == cli.cell)
        .map(|row| row.epoch)
        .collect();
    if epoch_idx.is_empty() {
        bail!("no epochs listed for cell `{}`", cli.cell);
    }
    let mut epochs: Vec<&EpochStats> = epoch_stats
        .iter()
        .filter(|e| e.cell == cli.cell && epoch_idx.contains(&e.epoch))
        .collect();
    epochs.sort_by_key(|e| e.epoch);
    if epochs.is_empty() {
        bail!("no epoch statistics for cell `{}`", cli.cell);
    }

    let iv_curves = binned_iv_curves(&iv, &epochs, &cli.cell);
    let fi_curves = fi_curves(&sweep_stats, &epochs, &cli.cell);
    let courses = time_courses(&epochs);

    // show the first and last analyzed epoch side by side
    let mut display = vec![epoch_idx[0]];
    if let Some(&last) = epoch_idx.last() {
        if last != epoch_idx[0] {
            display.push(last);
        }
    }
    let mut examples = Vec::new();
    for eidx in display {
        examples.push(load_example(cli, eidx)?);
    }

    let fig = PlasticityFigure {
        title: cli.cell.clone(),
        iv: iv_curves,
        fi: fi_curves,
        courses,
        examples,
    };
    let png = render_plasticity_png(&fig, &PlotStyle::default().with_size(1125, 750))?;
    let path = match cli.output.as_deref() {
        Some(path) if path.is_dir() => path.join(format!("{}_plasticity.png", cli.cell)),
        Some(path) => path.to_path_buf(),
        None => cli.build_dir.join(format!("{}_plasticity.png", cli.cell)),
    };
    save_png(&path, &png)?;
    Ok(())
}

fn epoch_label(epoch: &EpochStats) -> String {
    format!("{:.0} s", epoch.time.unwrap_or(0.0))
}

/// Mean voltage per current bin for each epoch.
fn binned_iv_curves(iv: &[IvRow], epochs: &[&EpochStats], cell: &str) -> Vec<EpochCurve> {
    epochs
        .iter()
        .map(|epoch| {
            let mut bins: BTreeMap<i64, Vec<(f64, f64)>> = BTreeMap::new();
            for row in iv
                .iter()
                .filter(|r| r.cell == cell && r.epoch == epoch.epoch)
            {
                if let (Some(i), Some(v)) = (row.current, row.voltage) {
                    bins.entry((i / IV_BIN_PA).floor() as i64)
                        .or_default()
                        .push((i, v));
                }
            }
            let points = bins
                .values()
                .map(|points| {
                    let n = points.len() as f64;
                    let (si, sv) = points
                        .iter()
                        .fold((0.0, 0.0), |(si, sv), (i, v)| (si + i, sv + v));
                    (si / n, sv / n)
                })
                .collect();
            EpochCurve {
                label: epoch_label(epoch),
                points,
            }
        })
        .collect()
}

/// Firing rate against injected current for each epoch.
fn fi_curves(sweeps: &[SweepStats], epochs: &[&EpochStats], cell: &str) -> Vec<EpochCurve> {
    epochs
        .iter()
        .map(|epoch| {
            let mut points: Vec<(f64, f64)> = sweeps
                .iter()
                .filter(|s| s.cell == cell && s.epoch == epoch.epoch)
                .filter_map(|s| match (s.current, s.firing_rate) {
                    (Some(i), Some(r)) => Some((i, r)),
                    _ => None,
                })
                .collect();
            points.sort_by(|a, b| a.0.total_cmp(&b.0));
            EpochCurve {
                label: epoch_label(epoch),
                points,
            }
        })
        .collect()
}

fn time_courses(epochs: &[&EpochStats]) -> Vec<TimeCourse> {
    let course = |label: &str, get: &dyn Fn(&EpochStats) -> (Option<f64>, Option<f64>)| {
        TimeCourse {
            label: label.to_string(),
            points: epochs
                .iter()
                .filter_map(|e| {
                    let (value, sem) = get(e);
                    Some(TimePoint {
                        time_s: e.time?,
                        value: value?,
                        sem,
                    })
                })
                .collect(),
        }
    };
    vec![
        course("Duration (s)", &|e| {
            (e.duration_mean, sem(e.duration_sd, e.n_sweeps))
        }),
        course("f-I slope (Hz/pA)", &|e| (e.slope, None)),
        course("rheobase (pA)", &|e| (e.rheobase, None)),
        course("Vm (mV)", &|e| (e.vm, sem(e.vm_sd, e.n_sweeps))),
        course("Rm (MΩ)", &|e| (e.rm, sem(e.rm_sd, e.n_sweeps))),
    ]
}

fn sem(sd: Option<f64>, n: usize) -> Option<f64> {
    match sd {
        Some(sd) if n > 0 => Some(sd / (n as f64).sqrt()),
        _ => None,
    }
}

/// Raster for every sweep of the epoch plus traces for the display sweeps,
/// re-read from the source recording.
fn load_example(cli: &Cli, epoch: u32) -> anyhow::Result<ExampleEpoch> {
    let pprox_path = cli
        .build_dir
        .join(format!("{}_{:02}.pprox", cli.cell, epoch));
    log::debug!(" - reading {}", pprox_path.display());
    let pprox = Document::read(&pprox_path)?;
    let raster: Vec<Vec<f64>> = pprox
        .pprox
        .iter()
        .map(|t| t.events.iter().map(|e| e * 1e3).collect())
        .collect();

    let registry = Registry::from_flag_or_env(cli.registry.clone())?;
    let resource_id = parse_resource_id(&pprox.source);
    let resource_path = registry
        .get(resource_id)
        .ok_or_else(|| EphysError::MissingResource(resource_id.to_string()))?;
    let recording = Recording::open(&resource_path.join(format!("{}.json", pprox.abf_file)))?;

    let mut traces = Vec::new();
    for &sidx in &cli.sweeps {
        let Some(sweep) = recording.sweeps.get(sidx) else {
            log::debug!("  - no sweep {sidx} in epoch {epoch}");
            continue;
        };
        traces.push(SweepTraces {
            dt_ms: sweep.sampling_period() * 1e3,
            voltage: sweep
                .voltage_mv()?
                .into_iter()
                .map(|v| v - JUNCTION_POTENTIAL_MV)
                .collect(),
            current: sweep.command_pa()?,
            events_ms: Vec::new(),
        });
    }
    Ok(ExampleEpoch {
        label: format!("{}_{:02}", cli.cell, epoch),
        raster,
        traces,
    })
}

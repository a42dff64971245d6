//! Compute electrophysiology statistics from epoch pprox files.

use std::path::PathBuf;

use anyhow::Context;
use chrono::Local;
use clap::Parser;

use patchstats::logging;
use patchstats::stats::{load_epoch, response_stats, SweepRow};
use patchstats::table;

#[derive(Parser, Debug)]
#[command(name = "response-stats", about = "Compute electrophysiology stats from epoch pprox files")]
struct Cli {
    /// Show verbose log messages
    #[arg(long)]
    debug: bool,

    /// Directory where output files should be stored
    #[arg(long = "output-dir", default_value = "build")]
    output_dir: PathBuf,

    /// Exclude sweeps where Vm deviates over this value (MADs)
    #[arg(long = "max-vm-deviance", default_value_t = 10.0)]
    max_vm_deviance: f64,

    /// Epoch pprox files to process
    #[arg(required = true)]
    epochs: Vec<PathBuf>,
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

    log::info!("- loading {} pprox files", cli.epochs.len());
    let mut rows: Vec<SweepRow> = Vec::new();
    for path in &cli.epochs {
        rows.extend(
            load_epoch(path).with_context(|| format!("cannot load `{}`", path.display()))?,
        );
    }

    let tables = response_stats(&rows, cli.max_vm_deviance);
    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("cannot create `{}`", cli.output_dir.display()))?;
    table::write_all(&tables, &cli.output_dir)?;
    Ok(())
}

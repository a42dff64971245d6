//! Scan all the epochs for a cell and report which contain a usable
//! current-step protocol. Gap-free and non-current-clamp epochs are
//! logged at debug level and skipped.

use std::path::PathBuf;

use chrono::Local;
use clap::Parser;

use patchstats::logging;
use patchstats::recording::Recording;
use patchstats::registry::{epoch_files, Registry};
use patchstats::EphysError;

#[derive(Parser, Debug)]
#[command(name = "scan-epochs", about = "Scan all the epochs for a cell and output if they are gapfree or epochal")]
struct Cli {
    /// Show verbose log messages
    #[arg(long)]
    debug: bool,

    /// Root of the local resource registry (default: $NBANK_REGISTRY)
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Identifier for the neuron
    neuron: String,
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
    log::info!("- analyzing: {}", cli.neuron);

    let registry = Registry::from_flag_or_env(cli.registry.clone())?;
    let path = registry
        .get(&cli.neuron)
        .ok_or_else(|| EphysError::MissingResource(cli.neuron.clone()))?;
    for (epoch_idx, file) in epoch_files(&path)?.iter().enumerate() {
        let epoch_idx = epoch_idx + 1;
        log::debug!("- reading {}", file.display());
        let recording = Recording::open(file)?;
        let Some(sweep) = recording.sweeps.first() else {
            log::debug!("{} {}: empty", cli.neuron, epoch_idx);
            continue;
        };
        match sweep.command_pa() {
            Ok(_) => println!("{} {}", cli.neuron, epoch_idx),
            Err(EphysError::NoCommandChannel) => {
                log::debug!("{} {}: gapfree", cli.neuron, epoch_idx);
            }
            Err(EphysError::NotCurrent(_)) => {
                log::debug!("{} {}: not current clamp", cli.neuron, epoch_idx);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

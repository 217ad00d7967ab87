use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use swmr::reader::{SwmrReader, Termination};
use swmr::signal::ShmemSignal;
use swmr::storage::Hdf5Storage;
use swmr::{logging, Overrides, SwmrConfig};

/// Follows the writer's dataset and prints its shape on every notice.
#[derive(clap::Parser)]
#[clap(name = "swmr-reader")]
struct Opts {
    #[clap(short = 'c', long = "config")]
    config: Option<PathBuf>,
    #[clap(short = 'f', long = "filename")]
    filename: Option<String>,
    #[clap(short = 'd', long = "dataset-name")]
    dataset_name: Option<String>,
    #[clap(short = 'l', long = "length")]
    length: Option<usize>,
    #[clap(short = 'b', long = "batch-size")]
    batch_size: Option<usize>,
    #[clap(long = "ready-timeout-ms")]
    ready_timeout_ms: Option<u64>,
    /// Gives up once no notice arrives for this long.
    #[clap(long = "observe-timeout-ms")]
    observe_timeout_ms: Option<u64>,
    #[clap(long = "log-level")]
    log_level: Option<String>,
    #[clap(long = "signal-dir")]
    signal_dir: Option<String>,
    #[clap(long = "signal-name")]
    signal_name: Option<String>,
}

impl Opts {
    fn overrides(&self) -> Overrides {
        Overrides {
            filename: self.filename.clone(),
            dataset_name: self.dataset_name.clone(),
            length: self.length,
            batch_size: self.batch_size,
            ready_timeout_ms: self.ready_timeout_ms,
            observe_timeout_ms: self.observe_timeout_ms,
            data_dir: self.signal_dir.clone(),
            link_name: self.signal_name.clone(),
            log_level: self.log_level.clone(),
            ..Default::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opts: Opts = Opts::parse();
    let cfg = SwmrConfig::resolve(opts.config.as_deref(), opts.overrides()).context("loading configuration")?;
    logging::init(&cfg.log_level);

    let channel = ShmemSignal::attach(&cfg.signal)
        .with_context(|| format!("attaching to signal {}", cfg.signal.link_path().display()))?;
    let mut reader = SwmrReader::new(Hdf5Storage::from_config(&cfg), channel);
    let report = reader
        .run(cfg.ready_timeout(), cfg.observe_timeout(), |extent, width| {
            println!("new shape: ({}, {})", extent, width)
        })
        .with_context(|| format!("reading {}", cfg.storage.filename))?;

    match report.termination {
        Termination::EndOfStream => info!(final_extent = ?report.final_extent(), "writer finished"),
        Termination::TimedOut => info!(final_extent = ?report.final_extent(), "stopped waiting for the writer"),
    }
    Ok(())
}

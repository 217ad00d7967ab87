use std::env;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::Ordering;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use swmr::signal::{self, ShmemSignal};
use swmr::storage::Hdf5Storage;
use swmr::{logging, Overrides, SwmrConfig};

const CONFIG_FILE_NAME: &str = "swmr-launch.toml";

/// Runs one writer and one reader against the same file, then checks the result.
#[derive(clap::Parser)]
#[clap(name = "swmr-launcher")]
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
    #[clap(long = "width")]
    width: Option<usize>,
    #[clap(long = "seed")]
    seed: Option<u64>,
    #[clap(long = "ready-timeout-ms")]
    ready_timeout_ms: Option<u64>,
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
            width: self.width,
            seed: self.seed,
            ready_timeout_ms: self.ready_timeout_ms,
            observe_timeout_ms: self.observe_timeout_ms,
            data_dir: self.signal_dir.clone(),
            link_name: self.signal_name.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

// Sibling binaries live next to the launcher in the target directory.
fn spawn(name: &str, config: &Path) -> anyhow::Result<Child> {
    let exe = env::current_exe()?.with_file_name(format!("{}{}", name, env::consts::EXE_SUFFIX));
    let child = Command::new(&exe)
        .arg("--config")
        .arg(config)
        .spawn()
        .with_context(|| format!("spawning {}", exe.display()))?;
    info!(binary = name, pid = child.id(), "spawned");
    Ok(child)
}

fn main() -> anyhow::Result<()> {
    let opts: Opts = Opts::parse();
    let cfg = SwmrConfig::resolve(opts.config.as_deref(), opts.overrides()).context("loading configuration")?;
    logging::init(&cfg.log_level);

    // Ctrl-C reaches the children too; keep waiting for them instead of exiting first.
    let shutdown = signal::shutdown_flag().context("installing signal handlers")?;

    // The channel exists before either side starts, so neither can miss the ready notice.
    let _channel = ShmemSignal::create(&cfg.signal)
        .with_context(|| format!("creating signal {}", cfg.signal.link_path().display()))?;

    let scratch = tempfile::tempdir()?;
    let config_path = scratch.path().join(CONFIG_FILE_NAME);
    cfg.store(&config_path).context("writing child configuration")?;

    let mut reader = spawn("swmr-reader", &config_path)?;
    let mut writer = match spawn("swmr-writer", &config_path) {
        Ok(writer) => writer,
        Err(e) => {
            let _ = reader.kill();
            let _ = reader.wait();
            return Err(e);
        }
    };

    let writer_status = writer.wait().context("waiting for the writer")?;
    let reader_status = reader.wait().context("waiting for the reader")?;
    info!(%writer_status, %reader_status, "children exited");
    if !writer_status.success() {
        bail!("writer failed: {}", writer_status);
    }
    if !reader_status.success() {
        bail!("reader failed: {}", reader_status);
    }

    let storage = Hdf5Storage::from_config(&cfg);
    let shape = storage
        .shape()
        .with_context(|| format!("reopening {}", storage.path().display()))?;
    let (length, width) = match shape.as_slice() {
        [length, width] => (*length, *width),
        other => bail!("dataset has shape {:?}, expected two dimensions", other),
    };
    println!("final shape: ({}, {})", length, width);

    if shutdown.load(Ordering::Relaxed) {
        warn!("interrupted, skipping the length check");
    } else if (length, width) != (cfg.protocol.length, cfg.storage.width) {
        bail!(
            "expected shape ({}, {}), found ({}, {})",
            cfg.protocol.length,
            cfg.storage.width,
            length,
            width
        );
    }
    Ok(())
}

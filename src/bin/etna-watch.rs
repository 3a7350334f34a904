//! Live debug-counter watcher.
//!
//! Samples every module's performance counters once per interval through
//! select-then-read command streams and redraws the grid, highlighting
//! values that changed since the previous pass. Runs until interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use etna_exerciser::config::Config;
use etna_exerciser::device::{Device, DeviceError, Gpu, Pipe, PipeId};
use etna_exerciser::sampler::CounterSampler;
use etna_exerciser::stream::{CommandStream, StreamError, DEFAULT_CAPACITY_WORDS};
use etna_exerciser::uapi;

#[derive(Parser, Debug)]
#[command(name = "etna-watch", version, about = "Live GPU debug-counter grid")]
struct Cli {
    /// DRM device node, e.g. /dev/dri/renderD128.
    device: PathBuf,

    /// GPU core index.
    #[arg(default_value_t = 0)]
    core: u32,

    /// Sampling interval in microseconds (overrides the config file).
    #[arg(long)]
    interval_us: Option<u64>,

    /// Also read the counter-clearing slot 15 each iteration.
    #[arg(long)]
    reset: bool,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(interval_us) = cli.interval_us {
        config.interval_us = interval_us;
    }
    config.reset_after_read |= cli.reset;

    // Setup chain; each stage maps onto its own exit code via DeviceError.
    let device = Device::open(&cli.device)?;
    let version = device.version()?;
    println!("Version: {}.{}.{}", version.major, version.minor, version.patchlevel);
    println!("  Name: {}", version.name);
    println!("  Date: {}", version.date);
    println!("  Description: {}", version.desc);

    let gpu = Gpu::new(&device, cli.core)?;
    let pipe = Pipe::new(&gpu, PipeId::Pipe3D)?;

    // 4-byte uncached scratch every readback lands in.
    let dest = device.alloc_buffer(4, uapi::BO_UNCACHED)?;
    dest.clear();

    let mut stream = CommandStream::new(pipe, DEFAULT_CAPACITY_WORDS)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::Relaxed);
    })?;

    info!(
        core = cli.core,
        interval_us = config.interval_us,
        reset = config.reset_after_read,
        "entering sampling loop"
    );
    let mut sampler = CounterSampler::new(&mut stream, dest, config.reset_after_read);
    sampler.run(Duration::from_micros(config.interval_us), &stop, None)?;
    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(device_err) = err.downcast_ref::<DeviceError>() {
        return device_err.exit_code();
    }
    if err.downcast_ref::<StreamError>().is_some() {
        return 6;
    }
    1
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("etna-watch: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

//! Resolve-engine YUV verification harness.
//!
//! Converts a fixed 4x4 test image from NV12, YUV420 and YVU420 into
//! packed RGBA on the resolve engine, writes one BMP per format, and
//! compares every output byte against the known-correct reference.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use etna_exerciser::device::{Device, DeviceError, Gpu, Pipe, PipeId};
use etna_exerciser::formats::{EXPECTED, HEIGHT, OUTPUT_SIZE, WIDTH};
use etna_exerciser::resolve::run_verification;
use etna_exerciser::stream::{CommandStream, StreamError, DEFAULT_CAPACITY_WORDS};
use etna_exerciser::uapi;

#[derive(Parser, Debug)]
#[command(name = "etna-yuv-test", version, about = "Resolve-engine YUV conversion check")]
struct Cli {
    /// DRM device node, e.g. /dev/dri/renderD128.
    device: PathBuf,
}

fn run(cli: Cli) -> Result<()> {
    let device = Device::open(&cli.device)?;
    let version = device.version()?;
    println!("Version: {}.{}.{}", version.major, version.minor, version.patchlevel);
    println!("  Name: {}", version.name);
    println!("  Date: {}", version.date);
    println!("  Description: {}", version.desc);

    // The resolve engine lives on the 3D front-end of core 0.
    let gpu = Gpu::new(&device, 0)?;
    let pipe = Pipe::new(&gpu, PipeId::Pipe3D)?;

    let planes = [
        device.alloc_buffer(OUTPUT_SIZE, uapi::BO_UNCACHED)?,
        device.alloc_buffer(OUTPUT_SIZE, uapi::BO_UNCACHED)?,
        device.alloc_buffer(OUTPUT_SIZE, uapi::BO_UNCACHED)?,
    ];
    let dest = device.alloc_buffer(OUTPUT_SIZE, uapi::BO_UNCACHED)?;

    let mut stream = CommandStream::new(pipe, DEFAULT_CAPACITY_WORDS)?;

    let reports = run_verification(&mut stream, &planes, &dest, &std::env::temp_dir())?;
    for report in &reports {
        println!("{}", report.bmp_path.display());
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let idx = ((y * WIDTH + x) * 4) as usize;
                println!(
                    "  ({x},{y}) expected {:?} got {:?}",
                    &EXPECTED[idx..idx + 4],
                    &report.pixels[idx..idx + 4]
                );
            }
        }
        for m in &report.mismatches {
            println!(
                "  MISMATCH ({},{}) channel {}: expected {} got {}",
                m.x, m.y, m.channel, m.expected, m.actual
            );
        }
    }
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
        eprintln!("etna-yuv-test: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

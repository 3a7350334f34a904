//! Resolve-engine configuration and verification
//!
//! Programs the resolve engine for one YUV-to-RGBA conversion, runs it to
//! completion, and compares the packed output against the reference table
//! in [`crate::formats`].

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::device::{BoAccess, BufferObject, DeviceError};
use crate::formats::{YuvFormat, EXPECTED, FORMATS, HEIGHT, OUTPUT_SIZE, WIDTH};
use crate::protocol::{regs, YUV_CONFIG_ENABLE};
use crate::stream::{CommandStream, SubmitBackend};

/// Row stride the engine requires for the source planes.
pub const SOURCE_STRIDE: u32 = 0xa0;
/// Row stride of the packed RGBA destination.
pub const DEST_STRIDE: u32 = 0x140;

/// Copy the format's test image into the source planes, program the
/// engine, kick the conversion, and block until it completes.
///
/// The trigger is the last operational write: the hardware starts the
/// moment it processes the kicker value, so every address and stride
/// load precedes it in the same stream.
pub fn resolve<B: SubmitBackend>(
    stream: &mut CommandStream<B>,
    format: &YuvFormat,
    planes: &[BufferObject; 3],
    dest: &BufferObject,
) -> Result<(), DeviceError> {
    planes[0].write_bytes(0, format.plane0);
    planes[1].write_bytes(0, format.plane1);
    if let Some(plane2) = format.plane2 {
        planes[2].write_bytes(0, plane2);
    }

    stream.set_state(regs::YUV_CONFIG, format.selector_bits() | YUV_CONFIG_ENABLE);
    stream.set_state(regs::YUV_WINDOW_SIZE, HEIGHT << 16 | WIDTH);

    stream.set_state_from_bo(regs::YUV_PLANE0_ADDRESS, &planes[0], BoAccess::Read);
    stream.set_state(regs::YUV_PLANE0_STRIDE, SOURCE_STRIDE);
    stream.set_state_from_bo(regs::YUV_PLANE1_ADDRESS, &planes[1], BoAccess::Read);
    stream.set_state(regs::YUV_PLANE1_STRIDE, SOURCE_STRIDE);

    // A 2-plane source disables plane 2 explicitly; skipping the writes
    // would leave a stale address armed in the engine.
    if format.plane2.is_some() {
        stream.set_state_from_bo(regs::YUV_PLANE2_ADDRESS, &planes[2], BoAccess::Read);
        stream.set_state(regs::YUV_PLANE2_STRIDE, SOURCE_STRIDE);
    } else {
        stream.set_state(regs::YUV_PLANE2_ADDRESS, 0);
        stream.set_state(regs::YUV_PLANE2_STRIDE, 0);
    }

    stream.set_state_from_bo(regs::YUV_DEST_ADDRESS, dest, BoAccess::Write);
    stream.set_state(regs::YUV_DEST_STRIDE, DEST_STRIDE);

    // Plain linear resolve, no tiling or dithering variants.
    stream.set_state(regs::RS_TILING_CONFIG, 0);
    stream.set_state(regs::RS_DITHER_CONFIG, 0);

    stream.trigger_resolve();

    // Restore the engine to a known state for the next run.
    stream.set_state(regs::YUV_CONFIG, 0);

    stream.finish()
}

/// One byte-level difference between resolved output and the reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub x: u32,
    pub y: u32,
    /// RGBA channel index 0..4.
    pub channel: u32,
    pub expected: u8,
    pub actual: u8,
}

/// Byte-for-byte comparison of a resolved frame against the reference.
pub fn compare_output(actual: &[u8]) -> Vec<Mismatch> {
    assert!(actual.len() >= OUTPUT_SIZE, "output shorter than one frame");
    let mut mismatches = Vec::new();
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            for channel in 0..4 {
                let idx = ((y * WIDTH + x) * 4 + channel) as usize;
                if actual[idx] != EXPECTED[idx] {
                    mismatches.push(Mismatch {
                        x,
                        y,
                        channel,
                        expected: EXPECTED[idx],
                        actual: actual[idx],
                    });
                }
            }
        }
    }
    mismatches
}

/// Outcome of one format's configure/resolve/compare pass.
pub struct FormatReport {
    pub name: &'static str,
    pub bmp_path: PathBuf,
    pub pixels: Vec<u8>,
    pub mismatches: Vec<Mismatch>,
}

impl FormatReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Run all three formats through the engine. A format that converts
/// incorrectly is reported and does not stop the remaining formats; only
/// a device failure aborts the harness.
pub fn run_verification<B: SubmitBackend>(
    stream: &mut CommandStream<B>,
    planes: &[BufferObject; 3],
    dest: &BufferObject,
    out_dir: &Path,
) -> Result<Vec<FormatReport>, DeviceError> {
    dest.clear();

    let mut reports = Vec::with_capacity(FORMATS.len());
    for format in &FORMATS {
        info!("resolving {}", format.name);
        resolve(stream, format, planes, dest)?;

        let mut pixels = vec![0u8; OUTPUT_SIZE];
        dest.read_bytes(0, &mut pixels);

        let bmp_path = out_dir.join(format!("etna_yuv_{}.bmp", format.name));
        if let Err(err) = image::save_buffer_with_format(
            &bmp_path,
            &pixels,
            WIDTH,
            HEIGHT,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Bmp,
        ) {
            warn!("failed to write {}: {}", bmp_path.display(), err);
        }

        let mismatches = compare_output(&pixels);
        if !mismatches.is_empty() {
            warn!("{}: {} bytes differ from reference", format.name, mismatches.len());
        }
        reports.push(FormatReport {
            name: format.name,
            bmp_path,
            pixels,
            mismatches,
        });
    }
    Ok(reports)
}

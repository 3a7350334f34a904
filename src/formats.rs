//! YUV source formats and reference data
//!
//! Read-only tables: the three chroma-subsampled layouts the resolve
//! engine converts, a fixed 4x4 test image expressed in each layout, and
//! the packed-RGBA output a correct conversion must produce.

use crate::protocol::{
    FOURCC_NV12, FOURCC_YUV420, FOURCC_YVU420, YUV_CONFIG_SOURCE_NV12, YUV_CONFIG_SOURCE_YUV420,
    YUV_CONFIG_SOURCE_YVU420,
};

/// Test image dimensions.
pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 4;
/// Bytes of packed RGBA the resolve produces.
pub const OUTPUT_SIZE: usize = (WIDTH * HEIGHT * 4) as usize;

/// One source layout: identity plus the raw plane bytes of the test
/// image. `plane2` is absent for the 2-plane layout.
pub struct YuvFormat {
    pub name: &'static str,
    pub fourcc: u32,
    pub plane0: &'static [u8],
    pub plane1: &'static [u8],
    pub plane2: Option<&'static [u8]>,
}

impl YuvFormat {
    /// Resolve-engine source-layout selector bits for this format.
    pub fn selector_bits(&self) -> u32 {
        match self.fourcc {
            FOURCC_NV12 => YUV_CONFIG_SOURCE_NV12,
            FOURCC_YUV420 => YUV_CONFIG_SOURCE_YUV420,
            FOURCC_YVU420 => YUV_CONFIG_SOURCE_YVU420,
            other => unreachable!("no selector encoding for fourcc 0x{other:08x}"),
        }
    }
}

const NV12_Y: &[u8] = &[
    50, 70, 90, 110, //
    50, 70, 90, 110, //
    50, 70, 90, 110, //
    50, 70, 90, 110,
];
const NV12_UV: &[u8] = &[
    120, 130, 140, 130, //
    120, 160, 140, 160,
];

const YUV420_Y: &[u8] = NV12_Y;
const YUV420_U: &[u8] = &[
    120, 140, //
    120, 140,
];
const YUV420_V: &[u8] = &[
    130, 130, //
    160, 160,
];

const YVU420_Y: &[u8] = NV12_Y;
const YVU420_V: &[u8] = YUV420_V;
const YVU420_U: &[u8] = YUV420_U;

/// The three layouts exercised by the verification harness.
pub const FORMATS: [YuvFormat; 3] = [
    // 2 plane YCbCr
    YuvFormat {
        name: "NV12",
        fourcc: FOURCC_NV12,
        plane0: NV12_Y,
        plane1: NV12_UV,
        plane2: None,
    },
    // 3 plane YCbCr
    YuvFormat {
        name: "YUV420",
        fourcc: FOURCC_YUV420,
        plane0: YUV420_Y,
        plane1: YUV420_U,
        plane2: Some(YUV420_V),
    },
    YuvFormat {
        name: "YVU420",
        fourcc: FOURCC_YVU420,
        plane0: YVU420_Y,
        plane1: YVU420_U,
        plane2: Some(YVU420_V),
    },
];

/// Known-correct packed RGBA output, shared by all three layouts: the U/V
/// reordering between them is consistent, so the converted image is
/// identical.
pub const EXPECTED: [u8; OUTPUT_SIZE] = [
    44, 41, 25, 255, //
    67, 64, 48, 255, //
    90, 79, 111, 255, //
    114, 103, 135, 255, //
    //
    44, 41, 25, 255, //
    67, 64, 48, 255, //
    90, 79, 111, 255, //
    114, 103, 135, 255, //
    //
    92, 16, 25, 255, //
    115, 39, 48, 255, //
    138, 55, 111, 255, //
    161, 78, 135, 255, //
    //
    92, 16, 25, 255, //
    115, 39, 48, 255, //
    138, 55, 111, 255, //
    161, 78, 135, 255,
];

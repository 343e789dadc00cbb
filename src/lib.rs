// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register generation and dispatch for fixed-function video decoder hardware.
//!
//! The crate takes pictures already parsed by a software parser (see [`codec`]), picks a hardware
//! backend able to decode them on the running SoC (see [`decoder::registry`]), turns their syntax
//! into the register image and side tables that backend expects, submits them through a
//! [`device::DeviceChannel`] and reports completion status back to the caller.

pub mod bitstream_utils;
pub mod buffer;
pub mod codec;
pub mod decoder;
pub mod device;
pub mod frame;

use std::fmt;
use std::str::FromStr;

use enumn::N;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Number of `block`x`block` units covering the picture horizontally and vertically.
    pub fn blocks(&self, block: u32) -> (u32, u32) {
        (self.width.div_ceil(block), self.height.div_ceil(block))
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Chroma subsampling of a picture, numbered like `chroma_format_idc`.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChromaFormat {
    Monochrome = 0,
    #[default]
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

impl ChromaFormat {
    /// Ratio of total samples to luma samples, as `(numerator, denominator)`.
    pub fn sample_ratio(&self) -> (usize, usize) {
        match self {
            ChromaFormat::Monochrome => (1, 1),
            ChromaFormat::Yuv420 => (3, 2),
            ChromaFormat::Yuv422 => (2, 1),
            ChromaFormat::Yuv444 => (3, 1),
        }
    }
}

#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum CodingStandard {
    H264 = 7,
    H265 = 16777220,
}

impl FromStr for CodingStandard {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" | "avc" => Ok(CodingStandard::H264),
            "h265" | "H265" | "hevc" => Ok(CodingStandard::H265),
            _ => Err("unrecognized coding standard. Valid values: h264, h265"),
        }
    }
}

impl fmt::Display for CodingStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodingStandard::H264 => f.write_str("h264"),
            CodingStandard::H265 => f.write_str("h265"),
        }
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
pub const fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(2881, 64), 2944);
    }

    #[test]
    fn resolution_blocks() {
        let res = Resolution::from((1920, 1080));
        assert_eq!(res.blocks(16), (120, 68));
        assert_eq!(res.blocks(64), (30, 17));
        assert!(res.can_contain(Resolution::from((1280, 720))));
        assert!(!res.can_contain(Resolution::from((1920, 1088))));
    }

    #[test]
    fn standard_from_str() {
        assert_eq!("hevc".parse(), Ok(CodingStandard::H265));
        assert_eq!("h264".parse(), Ok(CodingStandard::H264));
        assert!("vp9".parse::<CodingStandard>().is_err());
        assert_eq!(CodingStandard::n(7), Some(CodingStandard::H264));
    }
}

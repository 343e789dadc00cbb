// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the pool owning decoded frames and bitstream packets.
//!
//! The pool itself lives outside this crate; backends only look slots up by index and, once at
//! initialization, tell the pool how frame strides must be aligned.

use std::cell::RefCell;
use std::rc::Rc;

use crate::align_up;
use crate::ChromaFormat;
use crate::Resolution;

/// Memory layout of a decoded frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameLayout {
    /// Semi-planar raster, luma followed by interleaved chroma.
    #[default]
    Raster,
    /// Frame buffer compression: a header region followed by the compressed payload.
    Compressed,
}

/// Secondary downscaled output written next to the main picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ThumbnailMode {
    #[default]
    None,
    /// Half-resolution copy stored after the main picture.
    Downscale,
}

/// Horizontal stride alignment requested by a backend.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AlignmentClass {
    #[default]
    Align16,
    /// Odd multiple of 256 bytes, avoiding cache set conflicts on wide pictures.
    Odd256,
    /// 64-byte alignment expected by compressed outputs.
    Align64,
}

impl AlignmentClass {
    /// Horizontal stride, in bytes, for a row of `width_bytes` bytes.
    pub fn hor_stride(&self, width_bytes: usize) -> usize {
        match self {
            AlignmentClass::Align16 => align_up(width_bytes, 16),
            AlignmentClass::Odd256 => align_up(width_bytes, 256) | 256,
            AlignmentClass::Align64 => align_up(width_bytes, 64),
        }
    }
}

/// Decoded-frame slot as seen by a backend.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Device handle of the frame memory.
    pub handle: u32,
    pub resolution: Resolution,
    /// Luma row pitch, in bytes.
    pub hor_stride: usize,
    /// Number of luma rows allocated.
    pub ver_stride: usize,
    pub bit_depth: u8,
    pub chroma: ChromaFormat,
    pub layout: FrameLayout,
    pub thumbnail: ThumbnailMode,
}

impl FrameInfo {
    /// Size of the luma plane.
    pub fn luma_size(&self) -> usize {
        self.hor_stride * self.ver_stride
    }

    /// Size of luma plus chroma planes.
    pub fn picture_size(&self) -> usize {
        let (num, den) = self.chroma.sample_ratio();
        self.luma_size() * num / den
    }
}

/// Bitstream packet slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub handle: u32,
    pub capacity: usize,
}

/// Lookup interface of the frame/packet slot pool.
pub trait FrameSlots {
    fn frame(&self, index: usize) -> Option<FrameInfo>;
    fn packet(&self, index: usize) -> Option<PacketInfo>;
    /// Number of frame slots currently allocated.
    fn buffer_count(&self) -> usize;
    /// Stride alignment applied to frames allocated from now on.
    fn alignment(&self) -> AlignmentClass;
    fn set_alignment(&mut self, class: AlignmentClass);
}

pub type SharedFrameSlots = Rc<RefCell<dyn FrameSlots>>;

/// Plain table of frame and packet slots.
#[derive(Default)]
pub struct SlotTable {
    frames: Vec<Option<FrameInfo>>,
    packets: Vec<Option<PacketInfo>>,
    alignment: AlignmentClass,
}

impl SlotTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Stores `frame` at `index`, recomputing its horizontal stride with the current alignment.
    pub fn insert_frame(&mut self, index: usize, mut frame: FrameInfo) {
        let bytes_per_sample = if frame.bit_depth > 8 { 2 } else { 1 };
        frame.hor_stride = self
            .alignment
            .hor_stride(frame.resolution.width as usize * bytes_per_sample);
        frame.ver_stride = align_up(frame.resolution.height as usize, 16);

        if self.frames.len() <= index {
            self.frames.resize(index + 1, None);
        }
        self.frames[index] = Some(frame);
    }

    pub fn remove_frame(&mut self, index: usize) -> Option<FrameInfo> {
        self.frames.get_mut(index).and_then(Option::take)
    }

    pub fn insert_packet(&mut self, index: usize, packet: PacketInfo) {
        if self.packets.len() <= index {
            self.packets.resize(index + 1, None);
        }
        self.packets[index] = Some(packet);
    }
}

impl FrameSlots for SlotTable {
    fn frame(&self, index: usize) -> Option<FrameInfo> {
        self.frames.get(index).copied().flatten()
    }

    fn packet(&self, index: usize) -> Option<PacketInfo> {
        self.packets.get(index).copied().flatten()
    }

    fn buffer_count(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }

    fn alignment(&self) -> AlignmentClass {
        self.alignment
    }

    fn set_alignment(&mut self, class: AlignmentClass) {
        self.alignment = class;
    }
}

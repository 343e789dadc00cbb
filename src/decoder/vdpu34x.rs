// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register file of the second generation decoder block.
//!
//! The configuration is split into four blocks written separately: common control, picture
//! parameters, addresses and statistics. The common block holds the start bit and is written
//! last. Unlike the first generation, this block needs external row and column buffers sized by
//! [`crate::decoder::layout`] and a dedicated motion vector store per frame slot.

use crate::align_up;
use crate::decoder::regs::Field;
use crate::decoder::regs::RegisterBlock;
use crate::decoder::regs::RegisterImage;
use crate::decoder::transcoder::Binding;
use crate::decoder::transcoder::Emit;
use crate::decoder::transcoder::HwStatus;
use crate::device::RegBatch;
use crate::device::RegOp;
use crate::frame::AlignmentClass;
use crate::frame::FrameLayout;
use crate::frame::ThumbnailMode;

pub const NUM_REF_REGS: usize = 16;

// Common block.
pub const COMMON_FIRST: u32 = 8;
pub const COMMON_LAST: u32 = 31;
pub const ENDIAN: u32 = 8;
pub const DEC_MODE: u32 = 9;
pub const DEC_EN: u32 = 10;
pub const IMPORTANT_EN: u32 = 11;
pub const SEC_EN: u32 = 12;
pub const TIMEOUT_THRESHOLD: u32 = 13;
pub const STREAM_LEN: u32 = 14;
pub const Y_HOR_VIRSTRIDE: u32 = 16;
pub const UV_HOR_VIRSTRIDE: u32 = 17;
pub const Y_VIRSTRIDE: u32 = 18;
pub const FBC_HDR_STRIDE: u32 = 19;

pub const DEC_MODE_HEVC: u32 = 0;
pub const DEC_MODE_H264: u32 = 1;
pub const DEC_E: Field = Field::bit(0);
pub const BUF_EMPTY_EN: Field = Field::bit(0);
pub const TIMEOUT_E: Field = Field::bit(1);
pub const FBC_E: Field = Field::bit(4);
pub const SCALE_DOWN_EN: Field = Field::bit(5);
pub const ERROR_PROC: Field = Field::bit(8);
pub const DEFAULT_TIMEOUT: u32 = 0x3ffff;

// Parameter block.
pub const PARAMS_FIRST: u32 = 64;
pub const PARAMS_LAST: u32 = 111;
pub const CUR_POC: u32 = 64;
pub const CUR_POC_BOTTOM: u32 = 65;
/// 32 registers. H.264 interleaves top and bottom field POCs.
pub const REF_POC: u32 = 66;
/// Four registers holding one byte of [`RefInfo`] per reference.
pub const REF_INFO: u32 = 98;
pub const REF_VALID_MASK: u32 = 102;
pub const REF_SAME_AS_CUR_MASK: u32 = 103;
pub const REF_LONG_TERM_MASK: u32 = 104;

// Address block.
pub const ADDR_FIRST: u32 = 128;
pub const ADDR_LAST: u32 = 199;
pub const STRM_BASE: u32 = 128;
pub const PARAM_BASE: u32 = 129;
pub const RPS_BASE: u32 = 130;
pub const SCALING_BASE: u32 = 131;
pub const DECOUT_BASE: u32 = 132;
pub const COLMV_CUR_BASE: u32 = 133;
pub const FBC_PAYLOAD_BASE: u32 = 134;
pub const THUMBNAIL_BASE: u32 = 135;
/// One register per [`RegionId`](crate::decoder::layout::RegionId).
pub const RCB_BASE: u32 = 140;
/// One register per region, in 16-byte units.
pub const RCB_SIZE: u32 = 151;
pub const REF_BASE: u32 = 164;
pub const COLMV_REF_BASE: u32 = 180;

// Interrupt status, read only.
pub const IRQ_STA: u32 = 224;
pub const IRQ_RDY: Field = Field::bit(1);
pub const IRQ_BUS_ERR: Field = Field::bit(2);
pub const IRQ_ERROR: Field = Field::bit(3);
pub const IRQ_TIMEOUT: Field = Field::bit(4);
pub const IRQ_BUF_EMPTY: Field = Field::bit(5);
pub const IRQ_COLMV_REF_ERR: Field = Field::bit(6);

// Statistics block.
pub const STATS_FIRST: u32 = 256;
pub const STATS_LAST: u32 = 271;
pub const PERF_CTRL: u32 = 256;
pub const REF_USED: u32 = 260;
pub const ERR_STA: u32 = 262;
pub const PERF_ENABLE: u32 = 0x7;
pub const STRM_ERR: Field = Field::bit(0);
pub const ERR_DETECTED: Field = Field::bit(1);

/// Per-reference flags of the `REF_INFO` registers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RefInfo {
    pub used: bool,
    /// Field reference (H.264 only).
    pub field: bool,
    pub long_term: bool,
    /// The entry is bound to a substitute picture.
    pub invalid: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vdpu34xRegs {
    pub common: RegisterBlock,
    pub params: RegisterBlock,
    pub addr: RegisterBlock,
    pub stats: RegisterBlock,
}

impl Default for Vdpu34xRegs {
    fn default() -> Self {
        let block = |first: u32, last: u32| RegisterBlock::new(first, (last - first + 1) as usize);
        Self {
            common: block(COMMON_FIRST, COMMON_LAST),
            params: block(PARAMS_FIRST, PARAMS_LAST),
            addr: block(ADDR_FIRST, ADDR_LAST),
            stats: block(STATS_FIRST, STATS_LAST),
        }
    }
}

impl Vdpu34xRegs {
    /// Sets the flags and mask bits of reference `index`.
    pub fn set_ref_info(&mut self, index: usize, info: RefInfo) {
        let bits = info.used as u32
            | (info.field as u32) << 1
            | (info.long_term as u32) << 2
            | (info.invalid as u32) << 3;
        let reg = REF_INFO + (index / 4) as u32;
        self.params
            .set_field(reg, Field::new((index % 4) as u32 * 8, 8), bits);

        let bit = Field::bit(index as u32);
        self.params
            .set_flag(REF_VALID_MASK, bit, info.used && !info.invalid);
        self.params.set_flag(REF_LONG_TERM_MASK, bit, info.long_term);
    }

    /// Marks reference `index` as bound to the output picture itself.
    pub fn set_same_as_current(&mut self, index: usize, same: bool) {
        self.params
            .set_flag(REF_SAME_AS_CUR_MASK, Field::bit(index as u32), same);
    }
}

impl RegisterImage for Vdpu34xRegs {
    fn blocks(&self) -> Vec<&RegisterBlock> {
        vec![&self.stats, &self.params, &self.addr, &self.common]
    }

    fn clear_status(&mut self) {
        for reg in (PERF_CTRL + 1)..=STATS_LAST {
            self.stats.set(reg, 0);
        }
    }
}

/// Binds stream, tables, output, references, motion vectors and auxiliary regions.
///
/// `tables` lists the table base registers with their offset in the table buffer.
pub fn bind_addresses(out: &mut Emit<Vdpu34xRegs>, bind: &Binding, tables: &[(u32, usize)]) {
    let addr = &mut out.regs.addr;
    addr.set(STRM_BASE, bind.stream.handle);
    addr.set(DECOUT_BASE, bind.output.handle);
    for (i, r) in bind.refs.iter().take(NUM_REF_REGS).enumerate() {
        addr.set(REF_BASE + i as u32, r.frame.handle);
    }

    if let Some(colmv) = &bind.colmv {
        addr.set(COLMV_CUR_BASE, colmv.current);
        for (i, handle) in colmv.refs.iter().take(NUM_REF_REGS).enumerate() {
            addr.set(COLMV_REF_BASE + i as u32, *handle);
        }
    }

    for &(reg, offset) in tables {
        out.regs.addr.set(reg, bind.tables);
        out.patch(reg, offset);
    }

    if let Some(aux) = &bind.aux {
        for (id, region) in aux.layout.regions() {
            let Some((handle, offset)) = aux.locate(id) else {
                continue;
            };
            let index = id as u32;
            out.regs.addr.set(RCB_BASE + index, handle);
            out.regs
                .addr
                .set(RCB_SIZE + index, (region.size / 16) as u32);
            out.patch(RCB_BASE + index, offset);
        }
    }
}

/// Size of the compressed output header: one 16-byte entry per 64x16 block.
fn fbc_header_size(bind: &Binding) -> (u32, usize) {
    let stride = (align_up(bind.output.resolution.width as usize, 64) / 64 * 16) as u32;
    let rows = (bind.output.resolution.height as usize).div_ceil(16);
    (stride, align_up(stride as usize * rows, 4096))
}

/// Programs the output geometry, the frame layout and the start bits.
pub fn program_geometry(out: &mut Emit<Vdpu34xRegs>, bind: &Binding, dec_mode: u32) {
    let output = &bind.output;
    let common = &mut out.regs.common;
    common.set(DEC_MODE, dec_mode);
    common.set(STREAM_LEN, bind.stream_len as u32);
    common.set(TIMEOUT_THRESHOLD, DEFAULT_TIMEOUT);
    common.set(Y_HOR_VIRSTRIDE, (output.hor_stride / 16) as u32);
    common.set(UV_HOR_VIRSTRIDE, (output.hor_stride / 16) as u32);
    common.set(Y_VIRSTRIDE, (output.luma_size() / 16) as u32);
    common.set_flag(IMPORTANT_EN, BUF_EMPTY_EN, true);
    common.set_flag(IMPORTANT_EN, TIMEOUT_E, true);
    common.set_flag(IMPORTANT_EN, ERROR_PROC, true);

    if output.layout == FrameLayout::Compressed {
        let (stride, header_size) = fbc_header_size(bind);
        common.set_flag(IMPORTANT_EN, FBC_E, true);
        common.set(FBC_HDR_STRIDE, stride);
        out.regs.addr.set(FBC_PAYLOAD_BASE, output.handle);
        out.patch(FBC_PAYLOAD_BASE, header_size);
    }

    if output.thumbnail == ThumbnailMode::Downscale {
        out.regs.common.set_flag(IMPORTANT_EN, SCALE_DOWN_EN, true);
        out.regs.addr.set(THUMBNAIL_BASE, output.handle);
        out.patch(THUMBNAIL_BASE, output.picture_size());
    }

    out.regs.stats.set(PERF_CTRL, PERF_ENABLE);
    out.regs.common.set_flag(DEC_EN, DEC_E, true);
}

/// Queues statistics, parameters and addresses, then the common block holding the start bit,
/// followed by the status reads.
pub fn queue(regs: &Vdpu34xRegs, patches: &[RegOp], batch: &mut RegBatch) {
    for block in regs.blocks() {
        batch.write(block.offset(), block.words());
    }
    for op in patches {
        if let RegOp::AddrOffset { reg, offset } = op {
            batch.addr_offset(*reg, *offset);
        }
    }
    batch.read(IRQ_STA * 4, 1);
    batch.read(STATS_FIRST * 4, (STATS_LAST - STATS_FIRST + 1) as usize);
}

pub fn decode_status(readback: &[Vec<u32>]) -> HwStatus {
    let irq = readback.first().and_then(|b| b.first()).copied().unwrap_or(0);
    let mut stats = Vdpu34xRegs::default().stats;
    if let Some(words) = readback.get(1) {
        for (i, word) in words.iter().take(stats.words().len()).enumerate() {
            stats.set(STATS_FIRST + i as u32, *word);
        }
    }

    let irq_field = |field: Field| (irq >> field.shift) & 1 != 0;
    let ready = irq_field(IRQ_RDY);
    let failed = [
        IRQ_BUS_ERR,
        IRQ_ERROR,
        IRQ_TIMEOUT,
        IRQ_BUF_EMPTY,
        IRQ_COLMV_REF_ERR,
    ]
    .into_iter()
    .any(irq_field);
    let stream_error =
        stats.field(ERR_STA, STRM_ERR) != 0 || stats.field(ERR_STA, ERR_DETECTED) != 0;

    HwStatus {
        hard_error: !ready || failed || stream_error,
        ref_used: Some(stats.get(REF_USED) & 0xffff),
    }
}

pub fn alignment_for(width: u32, layout: FrameLayout) -> AlignmentClass {
    match layout {
        FrameLayout::Compressed => AlignmentClass::Align64,
        FrameLayout::Raster if width > 1920 => AlignmentClass::Odd256,
        FrameLayout::Raster => AlignmentClass::Align16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::layout::RegionId;

    #[test]
    fn block_order() {
        let regs = Vdpu34xRegs::default();
        let mut batch = RegBatch::new();
        queue(&regs, &[], &mut batch);

        let offsets: Vec<_> = batch
            .ops()
            .iter()
            .filter_map(|op| match op {
                RegOp::Write { offset, .. } => Some(*offset / 4),
                _ => None,
            })
            .collect();
        assert_eq!(
            offsets,
            vec![STATS_FIRST, PARAMS_FIRST, ADDR_FIRST, COMMON_FIRST]
        );
        assert_eq!(
            batch.reads().collect::<Vec<_>>(),
            vec![(IRQ_STA * 4, 1), (STATS_FIRST * 4, 16)]
        );
    }

    #[test]
    fn status_decoding() {
        let mut stats = vec![0; 16];
        stats[4] = 0x1_0005;
        let status = decode_status(&[vec![1 << 1], stats.clone()]);
        assert!(!status.hard_error);
        assert_eq!(status.ref_used, Some(5));

        // Not ready, nothing else flagged.
        assert!(decode_status(&[vec![0], stats.clone()]).hard_error);
        assert!(decode_status(&[vec![1 << 1 | 1 << 6], stats.clone()]).hard_error);

        stats[6] = 1 << 1;
        assert!(decode_status(&[vec![1 << 1], stats]).hard_error);
    }

    #[test]
    fn reference_masks() {
        let mut regs = Vdpu34xRegs::default();
        regs.set_ref_info(
            1,
            RefInfo {
                used: true,
                long_term: true,
                ..Default::default()
            },
        );
        regs.set_ref_info(
            2,
            RefInfo {
                used: true,
                invalid: true,
                ..Default::default()
            },
        );
        regs.set_same_as_current(2, true);

        assert_eq!(regs.params.get(REF_INFO), (0b101 << 8) | (0b1001 << 16));
        assert_eq!(regs.params.get(REF_VALID_MASK), 0b010);
        assert_eq!(regs.params.get(REF_LONG_TERM_MASK), 0b010);
        assert_eq!(regs.params.get(REF_SAME_AS_CUR_MASK), 0b100);
    }

    #[test]
    fn every_region_has_registers() {
        let last = RegionId::FiltCol as u32;
        assert_eq!(last as usize + 1, crate::decoder::layout::NUM_REGIONS);
        assert!(RCB_BASE + last < RCB_SIZE);
        assert!(RCB_SIZE + last < REF_BASE);
    }
}

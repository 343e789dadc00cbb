// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register file of the first generation decoder block.
//!
//! The whole configuration lives in one flat file of [`NUM_REGS`] registers, shared by the H.264
//! and H.265 modes. Co-located motion vectors are stored right after each picture, so this
//! generation needs neither auxiliary buffers nor a motion vector pool.

use crate::decoder::regs::Field;
use crate::decoder::regs::RegisterBlock;
use crate::decoder::regs::RegisterImage;
use crate::decoder::transcoder::Binding;
use crate::decoder::transcoder::Emit;
use crate::decoder::transcoder::HwStatus;
use crate::device::RegBatch;
use crate::device::RegOp;
use crate::frame::AlignmentClass;

pub const NUM_REGS: usize = 96;

/// Number of reference address registers.
pub const NUM_REF_REGS: usize = 16;

pub const INT: u32 = 1;
pub const SYSCTRL: u32 = 2;
pub const STRIDES: u32 = 3;
pub const STRM_BASE: u32 = 4;
pub const STRM_LEN: u32 = 5;
pub const PARAM_BASE: u32 = 6;
pub const DECOUT_BASE: u32 = 7;
pub const Y_VIRSTRIDE: u32 = 8;
pub const YUV_VIRSTRIDE: u32 = 9;
pub const REF_BASE: u32 = 10;
pub const REF_POC_TOP: u32 = 26;
pub const REF_POC_BOTTOM: u32 = 42;
pub const CUR_POC_TOP: u32 = 58;
pub const CUR_POC_BOTTOM: u32 = 59;
pub const RPS_BASE: u32 = 60;
pub const SCALING_BASE: u32 = 61;
/// Four registers holding one byte of [`RefInfo`] per reference.
pub const REF_INFO: u32 = 62;
/// Eight registers holding one 16-bit `FrameNumWrap` per reference.
pub const FRAME_NUM_WRAP: u32 = 66;
pub const ERR_E: u32 = 74;
pub const STRMD_ERR_STA: u32 = 75;
pub const ERR_CTU: u32 = 76;
pub const STRMD_DETECT: u32 = 77;
pub const PERF_CYCLES: u32 = 78;
pub const PERF_LAST: u32 = 79;

/// Last register written before the start register.
const LAST_CONFIG: u32 = STRMD_DETECT;

pub const DEC_E: Field = Field::bit(0);
pub const CLKGATE_E: Field = Field::bit(1);
pub const IRQ_RDY: Field = Field::bit(8);
pub const IRQ_BUS_ERR: Field = Field::bit(9);
pub const IRQ_ERROR: Field = Field::bit(10);
pub const IRQ_TIMEOUT: Field = Field::bit(11);
pub const IRQ_BUF_EMPTY: Field = Field::bit(12);
pub const IRQ_COLMV_REF_ERR: Field = Field::bit(13);
const IRQ_STATUS: Field = Field::new(8, 6);

pub const DEC_MODE: Field = Field::new(20, 2);
pub const DEC_MODE_HEVC: u32 = 0;
pub const DEC_MODE_H264: u32 = 1;

pub const Y_HOR_STRIDE: Field = Field::new(0, 10);
pub const UV_HOR_STRIDE: Field = Field::new(10, 10);

pub const STRMD_ERR: Field = Field::bit(0);
pub const STRMD_DETECTED: Field = Field::bit(0);

/// Per-reference flags of the `REF_INFO` registers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RefInfo {
    pub top_used: bool,
    pub bottom_used: bool,
    pub long_term: bool,
    /// The entry is bound to a substitute picture.
    pub invalid: bool,
}

impl RefInfo {
    fn bits(&self) -> u32 {
        self.top_used as u32
            | (self.bottom_used as u32) << 1
            | (self.long_term as u32) << 2
            | (self.invalid as u32) << 3
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RkvRegs {
    pub file: RegisterBlock,
}

impl Default for RkvRegs {
    fn default() -> Self {
        Self {
            file: RegisterBlock::new(0, NUM_REGS),
        }
    }
}

impl RkvRegs {
    pub fn set_ref_info(&mut self, index: usize, info: RefInfo) {
        let reg = REF_INFO + (index / 4) as u32;
        let field = Field::new((index % 4) as u32 * 8, 8);
        self.file.set_field(reg, field, info.bits());
    }

    pub fn set_frame_num_wrap(&mut self, index: usize, value: i32) {
        let reg = FRAME_NUM_WRAP + (index / 2) as u32;
        let field = Field::new((index % 2) as u32 * 16, 16);
        self.file.set_field(reg, field, value as u32 & 0xffff);
    }
}

impl RegisterImage for RkvRegs {
    fn blocks(&self) -> Vec<&RegisterBlock> {
        vec![&self.file]
    }

    fn clear_status(&mut self) {
        self.file.set_field(INT, IRQ_STATUS, 0);
        for reg in ERR_E..=PERF_LAST {
            self.file.set(reg, 0);
        }
    }
}

/// Binds the stream, output and reference pictures and the table buffer.
///
/// `tables` lists the table base registers with their offset in the table buffer.
pub fn bind_pictures(out: &mut Emit<RkvRegs>, bind: &Binding, tables: &[(u32, usize)]) {
    let file = &mut out.regs.file;
    file.set(STRM_BASE, bind.stream.handle);
    file.set(STRM_LEN, bind.stream_len as u32);
    file.set(DECOUT_BASE, bind.output.handle);
    for (i, r) in bind.refs.iter().take(NUM_REF_REGS).enumerate() {
        file.set(REF_BASE + i as u32, r.frame.handle);
    }

    for &(reg, offset) in tables {
        out.regs.file.set(reg, bind.tables);
        out.patch(reg, offset);
    }
}

/// Programs the output geometry and the start bits.
pub fn program_geometry(regs: &mut RkvRegs, bind: &Binding, dec_mode: u32) {
    let file = &mut regs.file;
    let stride = (bind.output.hor_stride / 16) as u32;
    file.set_field(SYSCTRL, DEC_MODE, dec_mode);
    file.set_field(STRIDES, Y_HOR_STRIDE, stride);
    file.set_field(STRIDES, UV_HOR_STRIDE, stride);
    file.set(Y_VIRSTRIDE, (bind.output.luma_size() / 16) as u32);
    file.set(YUV_VIRSTRIDE, (bind.output.picture_size() / 16) as u32);
    file.set_flag(INT, DEC_E, true);
    file.set_flag(INT, CLKGATE_E, true);
}

/// Queues the register file with the start register last, followed by the status reads.
pub fn queue(regs: &RkvRegs, patches: &[RegOp], batch: &mut RegBatch) {
    batch.write(SYSCTRL * 4, regs.file.range(SYSCTRL, LAST_CONFIG));
    for op in patches {
        if let RegOp::AddrOffset { reg, offset } = op {
            batch.addr_offset(*reg, *offset);
        }
    }
    batch.write(INT * 4, regs.file.range(INT, INT));
    batch.read(INT * 4, 1);
    batch.read(ERR_E * 4, (PERF_LAST - ERR_E + 1) as usize);
}

pub fn decode_status(readback: &[Vec<u32>]) -> HwStatus {
    let word = |block: usize, index: usize| {
        readback
            .get(block)
            .and_then(|b| b.get(index))
            .copied()
            .unwrap_or(0)
    };

    let mut status = RegisterBlock::new(0, NUM_REGS);
    status.set(INT, word(0, 0));
    status.set(STRMD_ERR_STA, word(1, (STRMD_ERR_STA - ERR_E) as usize));
    status.set(STRMD_DETECT, word(1, (STRMD_DETECT - ERR_E) as usize));

    let ready = status.field(INT, IRQ_RDY) != 0;
    let failed = [
        IRQ_BUS_ERR,
        IRQ_ERROR,
        IRQ_TIMEOUT,
        IRQ_BUF_EMPTY,
        IRQ_COLMV_REF_ERR,
    ]
    .iter()
    .any(|f| status.field(INT, *f) != 0);
    let stream_error = status.field(STRMD_ERR_STA, STRMD_ERR) != 0
        || status.field(STRMD_DETECT, STRMD_DETECTED) != 0;

    HwStatus {
        hard_error: !ready || failed || stream_error,
        ref_used: None,
    }
}

pub fn alignment_for(width: u32) -> AlignmentClass {
    if width > 1920 {
        AlignmentClass::Odd256
    } else {
        AlignmentClass::Align16
    }
}

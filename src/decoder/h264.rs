// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 register generation, shared between hardware generations.
//!
//! Both generations read the parameter sets from a bit-packed header in the per-slot table
//! buffer, laid out as follows:
//!
//! | Offset             | Content                               |
//! |--------------------|---------------------------------------|
//! | [`PARAM_OFFSET`]   | SPS, PPS and current picture fields   |
//! | [`RPS_OFFSET`]     | Reference frame bookkeeping           |
//! | [`SCALING_OFFSET`] | Scaling matrices, if the stream has any |

pub mod rkv;
pub mod vdpu34x;

use anyhow::anyhow;
use bytes::BufMut;

use crate::bitstream_utils::BitPutResult;
use crate::bitstream_utils::BitPutter;
use crate::codec::h264::PictureParams;
use crate::codec::h264::ScalingLists;
use crate::codec::h264::Syntax as H264Syntax;
use crate::decoder::transcoder::Binding;
use crate::decoder::Syntax;
use crate::ChromaFormat;
use crate::Resolution;

pub const PARAM_OFFSET: usize = 0;
pub const RPS_OFFSET: usize = 0x100;
pub const SCALING_OFFSET: usize = 0x200;

/// Size of the scaling matrices in the table buffer.
pub const SCALING_SIZE: usize = 6 * 16 + 6 * 64;

pub(crate) fn syntax(task: &Syntax) -> Option<&H264Syntax> {
    match task {
        Syntax::H264(syntax) => Some(&**syntax),
        _ => None,
    }
}

pub(crate) fn picture_format(syntax: &H264Syntax) -> (Resolution, u8, ChromaFormat) {
    let pic = &syntax.pic;
    (pic.resolution(), pic.bit_depth(), pic.chroma_format())
}

/// Frame slots of the 16 reference entries. Frames inferred for gaps in `frame_num` have no
/// content and count as missing.
pub(crate) fn reference_slots(syntax: &H264Syntax) -> Vec<Option<usize>> {
    syntax
        .pic
        .refs
        .iter()
        .map(|r| if r.non_existing { None } else { r.slot })
        .collect()
}

/// Packs the SPS fields common to both generations, picture size excluded.
pub(crate) fn put_sps(bp: &mut BitPutter, pic: &PictureParams, bind: &Binding) -> BitPutResult<()> {
    let (luma_minus8, chroma_minus8) =
        bind.bit_depths_minus8(pic.bit_depth_luma_minus8, pic.bit_depth_chroma_minus8);

    bp.put_u(8, pic.profile_idc)?;
    bp.put_flag(pic.constraint_set3_flag)?;
    bp.put_u(2, pic.chroma_format_idc)?;
    bp.put_u(3, luma_minus8)?;
    bp.put_u(3, chroma_minus8)?;
    bp.put_flag(pic.qpprime_y_zero_transform_bypass_flag)?;
    bp.put_u(4, pic.log2_max_frame_num_minus4)?;
    bp.put_u(5, pic.max_num_ref_frames)?;
    bp.put_u(2, pic.pic_order_cnt_type)?;
    bp.put_u(4, pic.log2_max_pic_order_cnt_lsb_minus4)?;
    bp.put_flag(pic.delta_pic_order_always_zero_flag)?;
    bp.put_flag(pic.frame_mbs_only_flag)?;
    bp.put_flag(pic.mb_adaptive_frame_field_flag)?;
    bp.put_flag(pic.direct_8x8_inference_flag)
}

/// Packs the PPS fields common to both generations.
pub(crate) fn put_pps(bp: &mut BitPutter, syntax: &H264Syntax) -> BitPutResult<()> {
    let pic = &syntax.pic;

    bp.put_flag(pic.entropy_coding_mode_flag)?;
    bp.put_flag(pic.bottom_field_pic_order_in_frame_present_flag)?;
    bp.put_u(5, pic.num_ref_idx_l0_default_active_minus1)?;
    bp.put_u(5, pic.num_ref_idx_l1_default_active_minus1)?;
    bp.put_flag(pic.weighted_pred_flag)?;
    bp.put_u(2, pic.weighted_bipred_idc)?;
    bp.put_s(7, pic.pic_init_qp_minus26)?;
    bp.put_s(6, pic.pic_init_qs_minus26)?;
    bp.put_s(5, pic.chroma_qp_index_offset)?;
    bp.put_s(5, pic.second_chroma_qp_index_offset)?;
    bp.put_flag(pic.deblocking_filter_control_present_flag)?;
    bp.put_flag(pic.constrained_intra_pred_flag)?;
    bp.put_flag(pic.redundant_pic_cnt_present_flag)?;
    bp.put_flag(pic.transform_8x8_mode_flag)?;
    bp.put_flag(syntax.scaling.is_some())
}

/// Packs the fields of the picture being decoded.
pub(crate) fn put_current_picture(bp: &mut BitPutter, pic: &PictureParams) -> BitPutResult<()> {
    bp.put_flag(pic.field_pic_flag)?;
    bp.put_flag(pic.bottom_field_flag)?;
    bp.put_flag(pic.mbaff_frame_flag())?;
    bp.put_flag(pic.is_reference)?;
    bp.put_flag(pic.idr_pic_flag)?;
    bp.put_u(16, pic.frame_num)?;
    bp.put_s(32, pic.top_poc)?;
    bp.put_s(32, pic.bottom_poc)
}

/// Copies the scaling matrices to their place in the table buffer.
pub(crate) fn write_scaling_lists(lists: &ScalingLists, tables: &mut [u8]) -> anyhow::Result<()> {
    let mut dst = tables
        .get_mut(SCALING_OFFSET..)
        .filter(|dst| dst.len() >= SCALING_SIZE)
        .ok_or_else(|| anyhow!("table buffer too small for scaling lists"))?;

    for list in &lists.list4x4 {
        dst.put_slice(list);
    }
    for list in &lists.list8x8 {
        dst.put_slice(list);
    }

    Ok(())
}

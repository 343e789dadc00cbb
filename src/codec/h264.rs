// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 picture syntax, as produced by the parser for one picture.
//!
//! Sequence and picture parameter set fields keep the names and meaning they have in the
//! H.264 specification (7.4.2.1.1 and 7.4.2.2).

use crate::ChromaFormat;
use crate::Resolution;

/// Maximum number of reference frames in the DPB.
pub const MAX_REFS: usize = 16;

/// One entry of the reference frame list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefFrame {
    /// Frame slot holding the reference, `None` if the entry is missing.
    pub slot: Option<usize>,
    pub long_term: bool,
    /// `FrameNum` for short-term references, `LongTermFrameIdx` for long-term ones.
    pub frame_idx: u16,
    pub top_poc: i32,
    pub bottom_poc: i32,
    pub top_used: bool,
    pub bottom_used: bool,
    /// Frame inferred by the gaps-in-frame_num process.
    pub non_existing: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureParams {
    pub profile_idc: u8,
    pub constraint_set3_flag: bool,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub log2_max_frame_num_minus4: u8,
    pub max_num_ref_frames: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub pic_width_in_mbs_minus1: u16,
    /// Height of the frame in macroblocks minus 1, i.e. already accounting for
    /// `frame_mbs_only_flag`.
    pub frame_height_in_mbs_minus1: u16,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,

    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    /// `nal_ref_idc != 0`.
    pub is_reference: bool,
    pub idr_pic_flag: bool,
    pub frame_num: u16,
    pub top_poc: i32,
    pub bottom_poc: i32,

    pub refs: [RefFrame; MAX_REFS],
}

impl Default for PictureParams {
    fn default() -> Self {
        Self {
            profile_idc: 100,
            constraint_set3_flag: false,
            chroma_format_idc: 1,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            qpprime_y_zero_transform_bypass_flag: false,
            log2_max_frame_num_minus4: 0,
            max_num_ref_frames: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            pic_width_in_mbs_minus1: 0,
            frame_height_in_mbs_minus1: 0,
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: false,
            direct_8x8_inference_flag: true,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            second_chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            field_pic_flag: false,
            bottom_field_flag: false,
            is_reference: true,
            idr_pic_flag: false,
            frame_num: 0,
            top_poc: 0,
            bottom_poc: 0,
            refs: Default::default(),
        }
    }
}

impl PictureParams {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: (u32::from(self.pic_width_in_mbs_minus1) + 1) * 16,
            height: (u32::from(self.frame_height_in_mbs_minus1) + 1) * 16,
        }
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth_luma_minus8.max(self.bit_depth_chroma_minus8) + 8
    }

    pub fn chroma_format(&self) -> ChromaFormat {
        ChromaFormat::n(self.chroma_format_idc).unwrap_or_default()
    }

    /// `MaxFrameNum`, see 7-10.
    pub fn max_frame_num(&self) -> u32 {
        1 << (u32::from(self.log2_max_frame_num_minus4) + 4)
    }

    pub fn mbaff_frame_flag(&self) -> bool {
        self.mb_adaptive_frame_field_flag && !self.field_pic_flag
    }

    /// `FrameNumWrap` of a short-term reference, see 8-27.
    pub fn frame_num_wrap(&self, reference: &RefFrame) -> i32 {
        let frame_num = i32::from(reference.frame_idx);
        if reference.long_term {
            frame_num
        } else if frame_num > i32::from(self.frame_num) {
            frame_num - self.max_frame_num() as i32
        } else {
            frame_num
        }
    }
}

/// Scaling matrices in the order they appear in the bitstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub list4x4: [[u8; 16]; 6],
    pub list8x8: [[u8; 64]; 6],
}

impl Default for ScalingLists {
    fn default() -> Self {
        Self {
            list4x4: [[16; 16]; 6],
            list8x8: [[16; 64]; 6],
        }
    }
}

/// Everything the hardware needs to know about one picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Syntax {
    pub pic: PictureParams,
    /// Scaling matrices if `seq_scaling_matrix_present_flag` or `pic_scaling_matrix_present_flag`
    /// was set.
    pub scaling: Option<ScalingLists>,
}

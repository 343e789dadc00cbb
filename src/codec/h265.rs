// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 picture syntax, as produced by the parser for one picture.
//!
//! Parameter set fields keep the names and meaning they have in the H.265 specification
//! (7.4.3.2 and 7.4.3.3).

use crate::ChromaFormat;
use crate::Resolution;

/// Maximum number of pictures in the reference picture set.
pub const MAX_REFS: usize = 15;
/// Maximum number of entries in each of the `RefPicSetStCurrBefore`, `RefPicSetStCurrAfter` and
/// `RefPicSetLtCurr` lists.
pub const MAX_RPS_ENTRIES: usize = 8;
pub const MAX_TILE_COLUMNS: usize = 20;
pub const MAX_TILE_ROWS: usize = 22;

/// One reference picture of the current picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefPicture {
    /// Frame slot holding the reference, `None` if the picture is missing.
    pub slot: Option<usize>,
    pub poc: i32,
    pub long_term: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureParams {
    pub chroma_format_idc: u8,
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_transform_block_size_minus2: u8,
    pub log2_diff_max_min_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,
    pub scaling_list_enabled_flag: bool,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_sample_bit_depth_luma_minus1: u8,
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    pub log2_min_pcm_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u8,
    pub pcm_loop_filter_disabled_flag: bool,
    pub num_short_term_ref_pic_sets: u8,
    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u8,
    pub sps_temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,

    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub init_qp_minus26: i8,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u8,
    pub pps_cb_qp_offset: i8,
    pub pps_cr_qp_offset: i8,
    pub pps_slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub pps_loop_filter_across_slices_enabled_flag: bool,
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub pps_deblocking_filter_disabled_flag: bool,
    pub pps_beta_offset_div2: i8,
    pub pps_tc_offset_div2: i8,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level_minus2: u8,
    pub slice_segment_header_extension_present_flag: bool,
    pub num_tile_columns_minus1: u8,
    pub num_tile_rows_minus1: u8,
    pub uniform_spacing_flag: bool,
    /// Explicit tile column widths in CTBs minus 1, used when `uniform_spacing_flag` is unset.
    /// The last column is implied.
    pub column_width_minus1: [u16; MAX_TILE_COLUMNS],
    pub row_height_minus1: [u16; MAX_TILE_ROWS],

    pub irap_pic: bool,
    pub idr_pic: bool,
    pub current_poc: i32,
    pub refs: [RefPicture; MAX_REFS],
    /// Indices into `refs`.
    pub st_curr_before: [Option<u8>; MAX_RPS_ENTRIES],
    pub st_curr_after: [Option<u8>; MAX_RPS_ENTRIES],
    pub lt_curr: [Option<u8>; MAX_RPS_ENTRIES],
}

impl Default for PictureParams {
    fn default() -> Self {
        Self {
            chroma_format_idc: 1,
            pic_width_in_luma_samples: 0,
            pic_height_in_luma_samples: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            log2_max_pic_order_cnt_lsb_minus4: 4,
            log2_min_luma_coding_block_size_minus3: 0,
            log2_diff_max_min_luma_coding_block_size: 3,
            log2_min_transform_block_size_minus2: 0,
            log2_diff_max_min_transform_block_size: 3,
            max_transform_hierarchy_depth_inter: 0,
            max_transform_hierarchy_depth_intra: 0,
            scaling_list_enabled_flag: false,
            amp_enabled_flag: false,
            sample_adaptive_offset_enabled_flag: false,
            pcm_enabled_flag: false,
            pcm_sample_bit_depth_luma_minus1: 7,
            pcm_sample_bit_depth_chroma_minus1: 7,
            log2_min_pcm_luma_coding_block_size_minus3: 0,
            log2_diff_max_min_pcm_luma_coding_block_size: 0,
            pcm_loop_filter_disabled_flag: false,
            num_short_term_ref_pic_sets: 0,
            long_term_ref_pics_present_flag: false,
            num_long_term_ref_pics_sps: 0,
            sps_temporal_mvp_enabled_flag: false,
            strong_intra_smoothing_enabled_flag: false,
            dependent_slice_segments_enabled_flag: false,
            output_flag_present_flag: false,
            num_extra_slice_header_bits: 0,
            sign_data_hiding_enabled_flag: false,
            cabac_init_present_flag: false,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            init_qp_minus26: 0,
            constrained_intra_pred_flag: false,
            transform_skip_enabled_flag: false,
            cu_qp_delta_enabled_flag: false,
            diff_cu_qp_delta_depth: 0,
            pps_cb_qp_offset: 0,
            pps_cr_qp_offset: 0,
            pps_slice_chroma_qp_offsets_present_flag: false,
            weighted_pred_flag: false,
            weighted_bipred_flag: false,
            transquant_bypass_enabled_flag: false,
            tiles_enabled_flag: false,
            entropy_coding_sync_enabled_flag: false,
            pps_loop_filter_across_slices_enabled_flag: false,
            loop_filter_across_tiles_enabled_flag: false,
            deblocking_filter_override_enabled_flag: false,
            pps_deblocking_filter_disabled_flag: false,
            pps_beta_offset_div2: 0,
            pps_tc_offset_div2: 0,
            lists_modification_present_flag: false,
            log2_parallel_merge_level_minus2: 0,
            slice_segment_header_extension_present_flag: false,
            num_tile_columns_minus1: 0,
            num_tile_rows_minus1: 0,
            uniform_spacing_flag: true,
            column_width_minus1: [0; MAX_TILE_COLUMNS],
            row_height_minus1: [0; MAX_TILE_ROWS],
            irap_pic: false,
            idr_pic: false,
            current_poc: 0,
            refs: Default::default(),
            st_curr_before: [None; MAX_RPS_ENTRIES],
            st_curr_after: [None; MAX_RPS_ENTRIES],
            lt_curr: [None; MAX_RPS_ENTRIES],
        }
    }
}

impl PictureParams {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: u32::from(self.pic_width_in_luma_samples),
            height: u32::from(self.pic_height_in_luma_samples),
        }
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth_luma_minus8.max(self.bit_depth_chroma_minus8) + 8
    }

    pub fn chroma_format(&self) -> ChromaFormat {
        ChromaFormat::n(self.chroma_format_idc).unwrap_or_default()
    }

    /// `CtbLog2SizeY`.
    pub fn ctb_log2_size(&self) -> u32 {
        u32::from(self.log2_min_luma_coding_block_size_minus3)
            + 3
            + u32::from(self.log2_diff_max_min_luma_coding_block_size)
    }

    /// `PicWidthInCtbsY` and `PicHeightInCtbsY`.
    pub fn size_in_ctbs(&self) -> (u32, u32) {
        self.resolution().blocks(1 << self.ctb_log2_size())
    }

    /// Tile column widths in CTBs, see 6-3.
    pub fn tile_column_widths(&self) -> Vec<u32> {
        let (width, _) = self.size_in_ctbs();
        tile_sizes(
            width,
            usize::from(self.num_tile_columns_minus1) + 1,
            self.uniform_spacing_flag,
            &self.column_width_minus1,
        )
    }

    /// Tile row heights in CTBs, see 6-4.
    pub fn tile_row_heights(&self) -> Vec<u32> {
        let (_, height) = self.size_in_ctbs();
        tile_sizes(
            height,
            usize::from(self.num_tile_rows_minus1) + 1,
            self.uniform_spacing_flag,
            &self.row_height_minus1,
        )
    }
}

fn tile_sizes(total: u32, count: usize, uniform: bool, explicit_minus1: &[u16]) -> Vec<u32> {
    let n = count as u32;
    if uniform {
        return (0..n)
            .map(|i| ((i + 1) * total) / n - (i * total) / n)
            .collect();
    }

    let mut sizes: Vec<u32> = explicit_minus1
        .iter()
        .take(count - 1)
        .map(|&s| u32::from(s) + 1)
        .collect();
    let used: u32 = sizes.iter().sum();
    sizes.push(total.saturating_sub(used));
    sizes
}

/// Scaling lists in coefficient scan order, see 7.3.4.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub list4x4: [[u8; 16]; 6],
    pub list8x8: [[u8; 64]; 6],
    pub list16x16: [[u8; 64]; 6],
    pub list32x32: [[u8; 64]; 2],
    pub dc16x16: [u8; 6],
    pub dc32x32: [u8; 2],
}

impl Default for ScalingLists {
    fn default() -> Self {
        Self {
            list4x4: [[16; 16]; 6],
            list8x8: [[16; 64]; 6],
            list16x16: [[16; 64]; 6],
            list32x32: [[16; 64]; 2],
            dc16x16: [16; 6],
            dc32x32: [16; 2],
        }
    }
}

/// Everything the hardware needs to know about one picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Syntax {
    pub pic: PictureParams,
    pub scaling: Option<ScalingLists>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_tiles() {
        let pic = PictureParams {
            pic_width_in_luma_samples: 1920,
            pic_height_in_luma_samples: 1080,
            tiles_enabled_flag: true,
            num_tile_columns_minus1: 3,
            num_tile_rows_minus1: 2,
            ..Default::default()
        };
        assert_eq!(pic.ctb_log2_size(), 6);
        assert_eq!(pic.size_in_ctbs(), (30, 17));
        assert_eq!(pic.tile_column_widths(), vec![7, 8, 7, 8]);
        assert_eq!(pic.tile_row_heights(), vec![5, 6, 6]);
    }

    #[test]
    fn explicit_tiles() {
        let mut pic = PictureParams {
            pic_width_in_luma_samples: 1920,
            pic_height_in_luma_samples: 1080,
            num_tile_columns_minus1: 2,
            uniform_spacing_flag: false,
            ..Default::default()
        };
        pic.column_width_minus1[0] = 9;
        pic.column_width_minus1[1] = 4;
        assert_eq!(pic.tile_column_widths(), vec![10, 5, 15]);
        assert_eq!(pic.tile_row_heights(), vec![17]);
    }
}

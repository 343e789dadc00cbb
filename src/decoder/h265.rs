// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 register generation, shared between hardware generations.
//!
//! The per-slot table buffer holds a 1024-bit header with the parameter sets and the derived tile
//! sizes at [`PARAM_OFFSET`], the reference picture set of the current picture at [`RPS_OFFSET`]
//! and the scaling lists at [`SCALING_OFFSET`].

pub mod rkv;
pub mod vdpu34x;

use anyhow::anyhow;
use bytes::BufMut;

use crate::bitstream_utils::BitPutResult;
use crate::bitstream_utils::BitPutter;
use crate::codec::h265::PictureParams;
use crate::codec::h265::ScalingLists;
use crate::codec::h265::Syntax as H265Syntax;
use crate::codec::h265::MAX_REFS;
use crate::codec::h265::MAX_RPS_ENTRIES;
use crate::codec::h265::MAX_TILE_COLUMNS;
use crate::codec::h265::MAX_TILE_ROWS;
use crate::decoder::transcoder::Binding;
use crate::decoder::Syntax;
use crate::ChromaFormat;
use crate::Resolution;

pub const PARAM_OFFSET: usize = 0;
pub const RPS_OFFSET: usize = 0x100;
pub const SCALING_OFFSET: usize = 0x200;

pub const HEADER_BITS: usize = 1024;
const RPS_BITS: usize = 192;
const TILE_SIZE_BITS: u32 = 12;
/// Index value of unused RPS entries.
const NO_REF: u8 = 0xf;

pub const SCALING_SIZE: usize = 6 * 16 + 6 * 64 + 6 * 64 + 2 * 64 + 6 + 2;

pub(crate) fn syntax(task: &Syntax) -> Option<&H265Syntax> {
    match task {
        Syntax::H265(syntax) => Some(&**syntax),
        _ => None,
    }
}

pub(crate) fn picture_format(syntax: &H265Syntax) -> (Resolution, u8, ChromaFormat) {
    let pic = &syntax.pic;
    (pic.resolution(), pic.bit_depth(), pic.chroma_format())
}

pub(crate) fn reference_slots(syntax: &H265Syntax) -> Vec<Option<usize>> {
    syntax.pic.refs.iter().map(|r| r.slot).collect()
}

pub(crate) fn put_sps(bp: &mut BitPutter, pic: &PictureParams, bind: &Binding) -> BitPutResult<()> {
    let (luma_minus8, chroma_minus8) =
        bind.bit_depths_minus8(pic.bit_depth_luma_minus8, pic.bit_depth_chroma_minus8);

    bp.put_u(2, pic.chroma_format_idc)?;
    bp.put_u(16, pic.pic_width_in_luma_samples)?;
    bp.put_u(16, pic.pic_height_in_luma_samples)?;
    bp.put_u(3, luma_minus8)?;
    bp.put_u(3, chroma_minus8)?;
    bp.put_u(4, pic.log2_max_pic_order_cnt_lsb_minus4)?;
    bp.put_u(2, pic.log2_min_luma_coding_block_size_minus3)?;
    bp.put_u(2, pic.log2_diff_max_min_luma_coding_block_size)?;
    bp.put_u(2, pic.log2_min_transform_block_size_minus2)?;
    bp.put_u(2, pic.log2_diff_max_min_transform_block_size)?;
    bp.put_u(3, pic.max_transform_hierarchy_depth_inter)?;
    bp.put_u(3, pic.max_transform_hierarchy_depth_intra)?;
    bp.put_flag(pic.scaling_list_enabled_flag)?;
    bp.put_flag(pic.amp_enabled_flag)?;
    bp.put_flag(pic.sample_adaptive_offset_enabled_flag)?;
    bp.put_flag(pic.pcm_enabled_flag)?;
    bp.put_u(4, pic.pcm_sample_bit_depth_luma_minus1)?;
    bp.put_u(4, pic.pcm_sample_bit_depth_chroma_minus1)?;
    bp.put_u(2, pic.log2_min_pcm_luma_coding_block_size_minus3)?;
    bp.put_u(2, pic.log2_diff_max_min_pcm_luma_coding_block_size)?;
    bp.put_flag(pic.pcm_loop_filter_disabled_flag)?;
    bp.put_u(7, pic.num_short_term_ref_pic_sets)?;
    bp.put_flag(pic.long_term_ref_pics_present_flag)?;
    bp.put_u(6, pic.num_long_term_ref_pics_sps)?;
    bp.put_flag(pic.sps_temporal_mvp_enabled_flag)?;
    bp.put_flag(pic.strong_intra_smoothing_enabled_flag)
}

pub(crate) fn put_pps(bp: &mut BitPutter, pic: &PictureParams) -> BitPutResult<()> {
    bp.put_flag(pic.dependent_slice_segments_enabled_flag)?;
    bp.put_flag(pic.output_flag_present_flag)?;
    bp.put_u(3, pic.num_extra_slice_header_bits)?;
    bp.put_flag(pic.sign_data_hiding_enabled_flag)?;
    bp.put_flag(pic.cabac_init_present_flag)?;
    bp.put_u(4, pic.num_ref_idx_l0_default_active_minus1)?;
    bp.put_u(4, pic.num_ref_idx_l1_default_active_minus1)?;
    bp.put_s(7, pic.init_qp_minus26)?;
    bp.put_flag(pic.constrained_intra_pred_flag)?;
    bp.put_flag(pic.transform_skip_enabled_flag)?;
    bp.put_flag(pic.cu_qp_delta_enabled_flag)?;
    bp.put_u(2, pic.diff_cu_qp_delta_depth)?;
    bp.put_s(5, pic.pps_cb_qp_offset)?;
    bp.put_s(5, pic.pps_cr_qp_offset)?;
    bp.put_flag(pic.pps_slice_chroma_qp_offsets_present_flag)?;
    bp.put_flag(pic.weighted_pred_flag)?;
    bp.put_flag(pic.weighted_bipred_flag)?;
    bp.put_flag(pic.transquant_bypass_enabled_flag)?;
    bp.put_flag(pic.tiles_enabled_flag)?;
    bp.put_flag(pic.entropy_coding_sync_enabled_flag)?;
    bp.put_flag(pic.pps_loop_filter_across_slices_enabled_flag)?;
    bp.put_flag(pic.loop_filter_across_tiles_enabled_flag)?;
    bp.put_flag(pic.deblocking_filter_override_enabled_flag)?;
    bp.put_flag(pic.pps_deblocking_filter_disabled_flag)?;
    bp.put_s(4, pic.pps_beta_offset_div2)?;
    bp.put_s(4, pic.pps_tc_offset_div2)?;
    bp.put_flag(pic.lists_modification_present_flag)?;
    bp.put_u(3, pic.log2_parallel_merge_level_minus2)?;
    bp.put_flag(pic.slice_segment_header_extension_present_flag)?;
    bp.put_u(5, pic.num_tile_columns_minus1)?;
    bp.put_u(5, pic.num_tile_rows_minus1)
}

/// Packs every tile column width then every tile row height, in CTBs. Unused entries are zero.
///
/// Without tiles, the picture is a single tile.
pub(crate) fn put_tiles(bp: &mut BitPutter, pic: &PictureParams) -> anyhow::Result<()> {
    let (columns, rows) = if pic.tiles_enabled_flag {
        (pic.tile_column_widths(), pic.tile_row_heights())
    } else {
        let (width, height) = pic.size_in_ctbs();
        (vec![width], vec![height])
    };

    if columns.len() > MAX_TILE_COLUMNS || rows.len() > MAX_TILE_ROWS {
        return Err(anyhow!(
            "{}x{} tiles exceed the hardware limit",
            columns.len(),
            rows.len()
        ));
    }

    for (sizes, max) in [(columns, MAX_TILE_COLUMNS), (rows, MAX_TILE_ROWS)] {
        for i in 0..max {
            bp.put_u(TILE_SIZE_BITS, sizes.get(i).copied().unwrap_or(0))?;
        }
    }

    Ok(())
}

pub(crate) fn put_current_picture(bp: &mut BitPutter, pic: &PictureParams) -> BitPutResult<()> {
    bp.put_flag(pic.irap_pic)?;
    bp.put_flag(pic.idr_pic)?;
    bp.put_s(32, pic.current_poc)
}

/// Writes the reference picture set: the length of the three lists, their indices into the
/// reference entries, then one long-term flag and one missing flag per entry.
///
/// An entry is missing when a list names it but it is bound to a substitute picture.
pub(crate) fn write_rps(
    pic: &PictureParams,
    bind: &Binding,
    tables: &mut [u8],
) -> anyhow::Result<()> {
    let lists = [&pic.st_curr_before, &pic.st_curr_after, &pic.lt_curr];
    let mut bp = BitPutter::new(RPS_BITS);

    for list in lists {
        bp.put_u(4, list.iter().take_while(|e| e.is_some()).count() as u8)?;
    }
    for list in lists {
        for entry in list.iter().take(MAX_RPS_ENTRIES) {
            bp.put_u(4, entry.unwrap_or(NO_REF))?;
        }
    }

    let mut missing = 0u16;
    for list in lists {
        for index in list.iter().flatten() {
            let index = usize::from(*index);
            let valid = bind.refs.get(index).is_some_and(|r| r.valid);
            if !valid && index < MAX_REFS {
                missing |= 1 << index;
            }
        }
    }
    if missing != 0 {
        log::warn!("Reference picture set entries {:#06x} are missing", missing);
    }

    for r in &pic.refs {
        bp.put_flag(r.long_term)?;
    }
    bp.put_u(15, missing)?;

    bp.write_to(&mut tables[RPS_OFFSET..])?;
    Ok(())
}

pub(crate) fn write_scaling_lists(lists: &ScalingLists, tables: &mut [u8]) -> anyhow::Result<()> {
    let mut dst = tables
        .get_mut(SCALING_OFFSET..)
        .filter(|dst| dst.len() >= SCALING_SIZE)
        .ok_or_else(|| anyhow!("table buffer too small for scaling lists"))?;

    for list in &lists.list4x4 {
        dst.put_slice(list);
    }
    for list in lists.list8x8.iter().chain(&lists.list16x16).chain(&lists.list32x32) {
        dst.put_slice(list);
    }
    dst.put_slice(&lists.dc16x16);
    dst.put_slice(&lists.dc32x32);

    Ok(())
}

/// Whether the stream enables scaling lists and the parser provided them.
pub(crate) fn has_scaling_lists(syntax: &H265Syntax) -> bool {
    syntax.pic.scaling_list_enabled_flag && syntax.scaling.is_some()
}

/// Copies the scaling lists if the stream enables them.
pub(crate) fn copy_scaling_lists(syntax: &H265Syntax, tables: &mut [u8]) -> anyhow::Result<bool> {
    match &syntax.scaling {
        Some(lists) if syntax.pic.scaling_list_enabled_flag => {
            write_scaling_lists(lists, tables)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::align_up;
use crate::bitstream_utils::BitPutter;
use crate::codec::h264::Syntax as H264Syntax;
use crate::decoder::h264;
use crate::decoder::h264::PARAM_OFFSET;
use crate::decoder::h264::RPS_OFFSET;
use crate::decoder::h264::SCALING_OFFSET;
use crate::decoder::layout::Axis;
use crate::decoder::layout::RegionFormula;
use crate::decoder::layout::RegionId;
use crate::decoder::layout::ScratchPolicy;
use crate::decoder::registry::AcceleratorDescriptor;
use crate::decoder::transcoder::Binding;
use crate::decoder::transcoder::Emit;
use crate::decoder::transcoder::GenerationStrategy;
use crate::decoder::transcoder::HwBackend;
use crate::decoder::transcoder::HwStatus;
use crate::decoder::vdpu34x;
use crate::decoder::vdpu34x::RefInfo;
use crate::decoder::vdpu34x::Vdpu34xRegs;
use crate::decoder::HwGeneration;
use crate::decoder::SocVariant;
use crate::decoder::Syntax;
use crate::device::ClientType;
use crate::device::RegBatch;
use crate::device::RegOp;
use crate::frame::AlignmentClass;
use crate::frame::FrameLayout;
use crate::ChromaFormat;
use crate::CodingStandard;
use crate::Resolution;

pub static DESCRIPTOR: AcceleratorDescriptor = AcceleratorDescriptor {
    name: "vdpu34x-h264",
    standard: CodingStandard::H264,
    generation: HwGeneration::Vdpu34x,
    client: ClientType::RkvDec,
    socs: &[SocVariant::Rk3568, SocVariant::Rk3588],
    create: HwBackend::<Vdpu34xH264>::create,
};

/// Row buffers, per 16-pixel macroblock column.
const FORMULAS: &[RegionFormula] = &[
    RegionFormula::new(RegionId::StrmdRow, Axis::Row, 16, 8).packed(),
    RegionFormula::new(RegionId::TransdRow, Axis::Row, 16, 4).packed(),
    RegionFormula::new(RegionId::InterRow, Axis::Row, 16, 32),
    RegionFormula::new(RegionId::IntraRow, Axis::Row, 16, 24),
    RegionFormula::new(RegionId::DblkRow, Axis::Row, 16, 32).scaled(),
    RegionFormula::new(RegionId::FbcRow, Axis::Row, 16, 4).scaled(),
];

const PARAM_BITS: usize = 256;
/// Per reference: FrameNumWrap, long term, top used, bottom used, valid.
const RPS_ENTRY_BITS: usize = 20;

/// Motion vectors stored per macroblock.
const COLMV_BYTES_PER_MB: usize = 16;

/// H.264 on the second generation block.
#[derive(Default)]
pub struct Vdpu34xH264;

impl GenerationStrategy for Vdpu34xH264 {
    type Regs = Vdpu34xRegs;
    type Syntax = H264Syntax;

    const STANDARD: CodingStandard = CodingStandard::H264;
    const GENERATION: HwGeneration = HwGeneration::Vdpu34x;

    fn syntax(task: &Syntax) -> Option<&H264Syntax> {
        h264::syntax(task)
    }

    fn picture_format(&self, syntax: &H264Syntax) -> (Resolution, u8, ChromaFormat) {
        h264::picture_format(syntax)
    }

    fn reference_slots(&self, syntax: &H264Syntax) -> Vec<Option<usize>> {
        h264::reference_slots(syntax)
    }

    fn region_formulas(&self) -> &'static [RegionFormula] {
        FORMULAS
    }

    fn scratch_policy(&self) -> Option<ScratchPolicy> {
        Some(ScratchPolicy::LargestFirst)
    }

    fn colmv_size(&self, syntax: &H264Syntax) -> Option<usize> {
        let (width, height) = syntax.pic.resolution().blocks(16);
        Some(align_up(
            width as usize * height as usize * COLMV_BYTES_PER_MB,
            4096,
        ))
    }

    fn supports_layout(&self, _layout: FrameLayout) -> bool {
        true
    }

    fn default_alignment(&self) -> AlignmentClass {
        AlignmentClass::Align16
    }

    fn alignment_for(&self, width: u32, _bit_depth: u8, layout: FrameLayout) -> AlignmentClass {
        vdpu34x::alignment_for(width, layout)
    }

    fn pack_parameter_sets(
        &self,
        syntax: &H264Syntax,
        bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        let pic = &syntax.pic;
        let mut bp = BitPutter::new(PARAM_BITS);

        bp.put_u(16, pic.pic_width_in_mbs_minus1)?;
        bp.put_u(16, pic.frame_height_in_mbs_minus1)?;
        h264::put_sps(&mut bp, pic, bind)?;
        h264::put_pps(&mut bp, syntax)?;
        h264::put_current_picture(&mut bp, pic)?;

        bp.write_to(&mut out.tables[PARAM_OFFSET..])?;
        Ok(())
    }

    fn pack_references(
        &self,
        syntax: &H264Syntax,
        bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        let pic = &syntax.pic;
        let mut rps = BitPutter::new(RPS_ENTRY_BITS * pic.refs.len());

        for (i, (entry, resolved)) in pic.refs.iter().zip(&bind.refs).enumerate() {
            let (top_poc, bottom_poc) = if resolved.valid {
                (entry.top_poc, entry.bottom_poc)
            } else {
                (pic.top_poc, pic.bottom_poc)
            };
            let poc = vdpu34x::REF_POC + 2 * i as u32;
            out.regs.params.set(poc, top_poc as u32);
            out.regs.params.set(poc + 1, bottom_poc as u32);

            let used = resolved.valid && (entry.top_used || entry.bottom_used);
            out.regs.set_ref_info(
                i,
                RefInfo {
                    used,
                    field: entry.top_used != entry.bottom_used,
                    long_term: entry.long_term,
                    invalid: !resolved.valid,
                },
            );
            out.regs
                .set_same_as_current(i, resolved.slot == bind.output_slot);

            // Two's complement, wrapped references are negative.
            rps.put_u(16, (pic.frame_num_wrap(entry) as u32) & 0xffff)?;
            rps.put_flag(entry.long_term)?;
            rps.put_flag(entry.top_used)?;
            rps.put_flag(entry.bottom_used)?;
            rps.put_flag(resolved.valid)?;
        }

        out.regs.params.set(vdpu34x::CUR_POC, pic.top_poc as u32);
        out.regs
            .params
            .set(vdpu34x::CUR_POC_BOTTOM, pic.bottom_poc as u32);

        rps.write_to(&mut out.tables[RPS_OFFSET..])?;
        Ok(())
    }

    fn copy_tables(
        &self,
        syntax: &H264Syntax,
        _bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        match &syntax.scaling {
            Some(lists) => h264::write_scaling_lists(lists, out.tables),
            None => Ok(()),
        }
    }

    fn bind_addresses(
        &self,
        syntax: &H264Syntax,
        bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        let mut tables = vec![
            (vdpu34x::PARAM_BASE, PARAM_OFFSET),
            (vdpu34x::RPS_BASE, RPS_OFFSET),
        ];
        if syntax.scaling.is_some() {
            tables.push((vdpu34x::SCALING_BASE, SCALING_OFFSET));
        }
        vdpu34x::bind_addresses(out, bind, &tables);
        Ok(())
    }

    fn derive_geometry(
        &self,
        _syntax: &H264Syntax,
        bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        vdpu34x::program_geometry(out, bind, vdpu34x::DEC_MODE_H264);
        Ok(())
    }

    fn queue(&self, regs: &Vdpu34xRegs, patches: &[RegOp], batch: &mut RegBatch) {
        vdpu34x::queue(regs, patches, batch)
    }

    fn decode_status(&self, readback: &[Vec<u32>]) -> HwStatus {
        vdpu34x::decode_status(readback)
    }
}

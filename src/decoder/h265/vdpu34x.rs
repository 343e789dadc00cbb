// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::align_up;
use crate::bitstream_utils::BitPutter;
use crate::codec::h265::Syntax as H265Syntax;
use crate::decoder::h265;
use crate::decoder::h265::HEADER_BITS;
use crate::decoder::h265::PARAM_OFFSET;
use crate::decoder::h265::RPS_OFFSET;
use crate::decoder::h265::SCALING_OFFSET;
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
    name: "vdpu34x-h265",
    standard: CodingStandard::H265,
    generation: HwGeneration::Vdpu34x,
    client: ClientType::RkvDec,
    socs: &[SocVariant::Rk3568, SocVariant::Rk3588],
    create: HwBackend::<Vdpu34xH265>::create,
};

/// Row and column buffers, per 16 pixels of the picture.
const FORMULAS: &[RegionFormula] = &[
    RegionFormula::new(RegionId::StrmdRow, Axis::Row, 16, 8).packed(),
    RegionFormula::new(RegionId::TransdRow, Axis::Row, 16, 6).packed(),
    RegionFormula::new(RegionId::TransdCol, Axis::Column, 16, 6),
    RegionFormula::new(RegionId::InterRow, Axis::Row, 16, 24),
    RegionFormula::new(RegionId::InterCol, Axis::Column, 16, 24),
    RegionFormula::new(RegionId::IntraRow, Axis::Row, 16, 32),
    RegionFormula::new(RegionId::DblkRow, Axis::Row, 16, 48).scaled(),
    RegionFormula::new(RegionId::SaoRow, Axis::Row, 16, 24).scaled(),
    RegionFormula::new(RegionId::FbcRow, Axis::Row, 16, 8).scaled(),
    RegionFormula::new(RegionId::FiltCol, Axis::Column, 16, 48).scaled(),
];

/// Regions moved to scratch memory, most bandwidth-hungry first.
const SCRATCH_ORDER: &[RegionId] = &[
    RegionId::IntraRow,
    RegionId::TransdRow,
    RegionId::StrmdRow,
    RegionId::InterRow,
    RegionId::DblkRow,
    RegionId::SaoRow,
    RegionId::FbcRow,
    RegionId::TransdCol,
    RegionId::InterCol,
    RegionId::FiltCol,
];

/// Motion vectors are stored per 16x16 block of the 64-aligned picture.
const COLMV_BYTES_PER_BLOCK: usize = 16;

/// H.265 on the second generation block.
#[derive(Default)]
pub struct Vdpu34xH265;

impl GenerationStrategy for Vdpu34xH265 {
    type Regs = Vdpu34xRegs;
    type Syntax = H265Syntax;

    const STANDARD: CodingStandard = CodingStandard::H265;
    const GENERATION: HwGeneration = HwGeneration::Vdpu34x;

    fn syntax(task: &Syntax) -> Option<&H265Syntax> {
        h265::syntax(task)
    }

    fn picture_format(&self, syntax: &H265Syntax) -> (Resolution, u8, ChromaFormat) {
        h265::picture_format(syntax)
    }

    fn reference_slots(&self, syntax: &H265Syntax) -> Vec<Option<usize>> {
        h265::reference_slots(syntax)
    }

    fn region_formulas(&self) -> &'static [RegionFormula] {
        FORMULAS
    }

    fn scratch_policy(&self) -> Option<ScratchPolicy> {
        Some(ScratchPolicy::PriorityOrder(SCRATCH_ORDER))
    }

    fn colmv_size(&self, syntax: &H265Syntax) -> Option<usize> {
        let resolution = syntax.pic.resolution();
        let width = align_up(resolution.width as usize, 64) / 16;
        let height = align_up(resolution.height as usize, 64) / 16;
        Some(width * height * COLMV_BYTES_PER_BLOCK)
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
        syntax: &H265Syntax,
        bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        let pic = &syntax.pic;
        let mut bp = BitPutter::new(HEADER_BITS);

        h265::put_current_picture(&mut bp, pic)?;
        h265::put_sps(&mut bp, pic, bind)?;
        h265::put_pps(&mut bp, pic)?;
        h265::put_tiles(&mut bp, pic)?;

        bp.write_to(&mut out.tables[PARAM_OFFSET..])?;
        Ok(())
    }

    fn pack_references(
        &self,
        syntax: &H265Syntax,
        bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        let pic = &syntax.pic;

        for (i, (entry, resolved)) in pic.refs.iter().zip(&bind.refs).enumerate() {
            let poc = if resolved.valid {
                entry.poc
            } else {
                pic.current_poc
            };
            out.regs
                .params
                .set(vdpu34x::REF_POC + i as u32, poc as u32);
            out.regs.set_ref_info(
                i,
                RefInfo {
                    used: resolved.valid,
                    field: false,
                    long_term: entry.long_term,
                    invalid: !resolved.valid,
                },
            );
            out.regs
                .set_same_as_current(i, resolved.slot == bind.output_slot);
        }
        out.regs
            .params
            .set(vdpu34x::CUR_POC, pic.current_poc as u32);

        h265::write_rps(pic, bind, out.tables)
    }

    fn copy_tables(
        &self,
        syntax: &H265Syntax,
        _bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        h265::copy_scaling_lists(syntax, out.tables)?;
        Ok(())
    }

    fn bind_addresses(
        &self,
        syntax: &H265Syntax,
        bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        let mut tables = vec![
            (vdpu34x::PARAM_BASE, PARAM_OFFSET),
            (vdpu34x::RPS_BASE, RPS_OFFSET),
        ];
        if h265::has_scaling_lists(syntax) {
            tables.push((vdpu34x::SCALING_BASE, SCALING_OFFSET));
        }
        vdpu34x::bind_addresses(out, bind, &tables);
        Ok(())
    }

    fn derive_geometry(
        &self,
        _syntax: &H265Syntax,
        bind: &Binding,
        out: &mut Emit<Vdpu34xRegs>,
    ) -> anyhow::Result<()> {
        vdpu34x::program_geometry(out, bind, vdpu34x::DEC_MODE_HEVC);
        Ok(())
    }

    fn queue(&self, regs: &Vdpu34xRegs, patches: &[RegOp], batch: &mut RegBatch) {
        vdpu34x::queue(regs, patches, batch)
    }

    fn decode_status(&self, readback: &[Vec<u32>]) -> HwStatus {
        vdpu34x::decode_status(readback)
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::bitstream_utils::BitPutter;
use crate::codec::h265::Syntax as H265Syntax;
use crate::decoder::h265;
use crate::decoder::h265::HEADER_BITS;
use crate::decoder::h265::PARAM_OFFSET;
use crate::decoder::h265::RPS_OFFSET;
use crate::decoder::h265::SCALING_OFFSET;
use crate::decoder::registry::AcceleratorDescriptor;
use crate::decoder::rkv;
use crate::decoder::rkv::RefInfo;
use crate::decoder::rkv::RkvRegs;
use crate::decoder::transcoder::Binding;
use crate::decoder::transcoder::Emit;
use crate::decoder::transcoder::GenerationStrategy;
use crate::decoder::transcoder::HwBackend;
use crate::decoder::transcoder::HwStatus;
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
    name: "rkv-h265",
    standard: CodingStandard::H265,
    generation: HwGeneration::Rkv,
    client: ClientType::HevcDec,
    socs: &[
        SocVariant::Rk3288,
        SocVariant::Rk3328,
        SocVariant::Rk3399,
        SocVariant::Rk3588,
    ],
    create: HwBackend::<RkvH265>::create,
};

/// H.265 on the first generation block.
#[derive(Default)]
pub struct RkvH265;

impl GenerationStrategy for RkvH265 {
    type Regs = RkvRegs;
    type Syntax = H265Syntax;

    const STANDARD: CodingStandard = CodingStandard::H265;
    const GENERATION: HwGeneration = HwGeneration::Rkv;

    fn syntax(task: &Syntax) -> Option<&H265Syntax> {
        h265::syntax(task)
    }

    fn picture_format(&self, syntax: &H265Syntax) -> (Resolution, u8, ChromaFormat) {
        h265::picture_format(syntax)
    }

    fn reference_slots(&self, syntax: &H265Syntax) -> Vec<Option<usize>> {
        h265::reference_slots(syntax)
    }

    fn default_alignment(&self) -> AlignmentClass {
        AlignmentClass::Align16
    }

    fn alignment_for(&self, width: u32, _bit_depth: u8, _layout: FrameLayout) -> AlignmentClass {
        rkv::alignment_for(width)
    }

    fn pack_parameter_sets(
        &self,
        syntax: &H265Syntax,
        bind: &Binding,
        out: &mut Emit<RkvRegs>,
    ) -> anyhow::Result<()> {
        let pic = &syntax.pic;
        let mut bp = BitPutter::new(HEADER_BITS);

        h265::put_sps(&mut bp, pic, bind)?;
        h265::put_pps(&mut bp, pic)?;
        h265::put_tiles(&mut bp, pic)?;
        h265::put_current_picture(&mut bp, pic)?;

        bp.write_to(&mut out.tables[PARAM_OFFSET..])?;
        Ok(())
    }

    fn pack_references(
        &self,
        syntax: &H265Syntax,
        bind: &Binding,
        out: &mut Emit<RkvRegs>,
    ) -> anyhow::Result<()> {
        let pic = &syntax.pic;

        for (i, (entry, resolved)) in pic.refs.iter().zip(&bind.refs).enumerate() {
            let poc = if resolved.valid {
                entry.poc
            } else {
                pic.current_poc
            };
            out.regs.file.set(rkv::REF_POC_TOP + i as u32, poc as u32);
            out.regs.set_ref_info(
                i,
                RefInfo {
                    top_used: resolved.valid,
                    bottom_used: resolved.valid,
                    long_term: entry.long_term,
                    invalid: !resolved.valid,
                },
            );
        }
        out.regs.file.set(rkv::CUR_POC_TOP, pic.current_poc as u32);

        h265::write_rps(pic, bind, out.tables)
    }

    fn copy_tables(
        &self,
        syntax: &H265Syntax,
        _bind: &Binding,
        out: &mut Emit<RkvRegs>,
    ) -> anyhow::Result<()> {
        h265::copy_scaling_lists(syntax, out.tables)?;
        Ok(())
    }

    fn bind_addresses(
        &self,
        syntax: &H265Syntax,
        bind: &Binding,
        out: &mut Emit<RkvRegs>,
    ) -> anyhow::Result<()> {
        let mut tables = vec![
            (rkv::PARAM_BASE, PARAM_OFFSET),
            (rkv::RPS_BASE, RPS_OFFSET),
        ];
        if h265::has_scaling_lists(syntax) {
            tables.push((rkv::SCALING_BASE, SCALING_OFFSET));
        }
        rkv::bind_pictures(out, bind, &tables);
        Ok(())
    }

    fn derive_geometry(
        &self,
        _syntax: &H265Syntax,
        bind: &Binding,
        out: &mut Emit<RkvRegs>,
    ) -> anyhow::Result<()> {
        rkv::program_geometry(out.regs, bind, rkv::DEC_MODE_HEVC);
        Ok(())
    }

    fn queue(&self, regs: &RkvRegs, patches: &[RegOp], batch: &mut RegBatch) {
        rkv::queue(regs, patches, batch)
    }

    fn decode_status(&self, readback: &[Vec<u32>]) -> HwStatus {
        rkv::decode_status(readback)
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::bitstream_utils::BitPutter;
use crate::codec::h264::Syntax as H264Syntax;
use crate::decoder::h264;
use crate::decoder::h264::PARAM_OFFSET;
use crate::decoder::h264::SCALING_OFFSET;
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
    name: "rkv-h264",
    standard: CodingStandard::H264,
    generation: HwGeneration::Rkv,
    client: ClientType::RkvDec,
    socs: &[SocVariant::Rk3328, SocVariant::Rk3399, SocVariant::Rk3588],
    create: HwBackend::<RkvH264>::create,
};

/// Size of the parameter header, in bits.
const PARAM_BITS: usize = 256;
/// Position of the per-reference flags at the end of the header.
const REF_FLAGS_POS: usize = 192;

/// H.264 on the first generation block.
#[derive(Default)]
pub struct RkvH264;

impl GenerationStrategy for RkvH264 {
    type Regs = RkvRegs;
    type Syntax = H264Syntax;

    const STANDARD: CodingStandard = CodingStandard::H264;
    const GENERATION: HwGeneration = HwGeneration::Rkv;

    fn syntax(task: &Syntax) -> Option<&H264Syntax> {
        h264::syntax(task)
    }

    fn picture_format(&self, syntax: &H264Syntax) -> (Resolution, u8, ChromaFormat) {
        h264::picture_format(syntax)
    }

    fn reference_slots(&self, syntax: &H264Syntax) -> Vec<Option<usize>> {
        h264::reference_slots(syntax)
    }

    fn default_alignment(&self) -> AlignmentClass {
        AlignmentClass::Align16
    }

    fn alignment_for(&self, width: u32, _bit_depth: u8, _layout: FrameLayout) -> AlignmentClass {
        rkv::alignment_for(width)
    }

    fn pack_parameter_sets(
        &self,
        syntax: &H264Syntax,
        bind: &Binding,
        out: &mut Emit<RkvRegs>,
    ) -> anyhow::Result<()> {
        let pic = &syntax.pic;
        let mut bp = BitPutter::new(REF_FLAGS_POS);

        h264::put_sps(&mut bp, pic, bind)?;
        bp.put_u(9, pic.pic_width_in_mbs_minus1)?;
        bp.put_u(9, pic.frame_height_in_mbs_minus1)?;
        h264::put_pps(&mut bp, syntax)?;
        h264::put_current_picture(&mut bp, pic)?;

        bp.write_to(&mut out.tables[PARAM_OFFSET..])?;
        Ok(())
    }

    fn pack_references(
        &self,
        syntax: &H264Syntax,
        bind: &Binding,
        out: &mut Emit<RkvRegs>,
    ) -> anyhow::Result<()> {
        let pic = &syntax.pic;
        let mut flags = BitPutter::new(PARAM_BITS - REF_FLAGS_POS);
        let mut field_flags = 0u16;

        for (i, (entry, resolved)) in pic.refs.iter().zip(&bind.refs).enumerate() {
            let index = i as u32;
            let (top_poc, bottom_poc) = if resolved.valid {
                (entry.top_poc, entry.bottom_poc)
            } else {
                (pic.top_poc, pic.bottom_poc)
            };
            out.regs.file.set(rkv::REF_POC_TOP + index, top_poc as u32);
            out.regs
                .file
                .set(rkv::REF_POC_BOTTOM + index, bottom_poc as u32);

            out.regs.set_ref_info(
                i,
                RefInfo {
                    top_used: resolved.valid && entry.top_used,
                    bottom_used: resolved.valid && entry.bottom_used,
                    long_term: entry.long_term,
                    invalid: !resolved.valid,
                },
            );
            out.regs.set_frame_num_wrap(i, pic.frame_num_wrap(entry));

            flags.put_flag(entry.long_term)?;
            if entry.top_used != entry.bottom_used {
                field_flags |= 1 << i;
            }
        }
        flags.put_u(16, field_flags)?;

        out.regs.file.set(rkv::CUR_POC_TOP, pic.top_poc as u32);
        out.regs.file.set(rkv::CUR_POC_BOTTOM, pic.bottom_poc as u32);

        flags.write_to(&mut out.tables[PARAM_OFFSET + REF_FLAGS_POS / 8..])?;
        Ok(())
    }

    fn copy_tables(
        &self,
        syntax: &H264Syntax,
        _bind: &Binding,
        out: &mut Emit<RkvRegs>,
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
        out: &mut Emit<RkvRegs>,
    ) -> anyhow::Result<()> {
        let mut tables = vec![(rkv::PARAM_BASE, PARAM_OFFSET)];
        if syntax.scaling.is_some() {
            tables.push((rkv::SCALING_BASE, SCALING_OFFSET));
        }
        rkv::bind_pictures(out, bind, &tables);
        Ok(())
    }

    fn derive_geometry(
        &self,
        _syntax: &H264Syntax,
        bind: &Binding,
        out: &mut Emit<RkvRegs>,
    ) -> anyhow::Result<()> {
        rkv::program_geometry(out.regs, bind, rkv::DEC_MODE_H264);
        Ok(())
    }

    fn queue(&self, regs: &RkvRegs, patches: &[RegOp], batch: &mut RegBatch) {
        rkv::queue(regs, patches, batch)
    }

    fn decode_status(&self, readback: &[Vec<u32>]) -> HwStatus {
        rkv::decode_status(readback)
    }
}

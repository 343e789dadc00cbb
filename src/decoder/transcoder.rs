// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Generic backend turning parsed syntax into register sets.
//!
//! [`HwBackend`] implements the [`Backend`] task state machine once for every hardware generation
//! and coding standard. What differs between them is supplied by a [`GenerationStrategy`]: the
//! register image type, the five register generation steps, the sizing of auxiliary buffers, the
//! submission order of register blocks and the decoding of completion status.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::buffer::BufferPurpose;
use crate::decoder::layout::AuxBuffers;
use crate::decoder::layout::AuxLayout;
use crate::decoder::layout::LayoutKey;
use crate::decoder::layout::RegionFormula;
use crate::decoder::layout::RegionId;
use crate::decoder::layout::ScratchPolicy;
use crate::decoder::mv_pool::MvPool;
use crate::decoder::regs::RegisterImage;
use crate::decoder::slots::RegisterSet;
use crate::decoder::slots::RegisterSetSlots;
use crate::decoder::Backend;
use crate::decoder::BackendEnv;
use crate::decoder::BackendError;
use crate::decoder::BackendResult;
use crate::decoder::CompletionReport;
use crate::decoder::ControlCmd;
use crate::decoder::HwGeneration;
use crate::decoder::Syntax;
use crate::decoder::Task;
use crate::decoder::TaskState;
use crate::device::ChannelError;
use crate::device::RegBatch;
use crate::device::RegOp;
use crate::frame::AlignmentClass;
use crate::frame::FrameInfo;
use crate::frame::FrameLayout;
use crate::frame::FrameSlots;
use crate::frame::PacketInfo;
use crate::ChromaFormat;
use crate::CodingStandard;
use crate::Resolution;

/// Size of the per-slot parameter table buffer.
pub const TABLES_SIZE: usize = 4096;

/// Reference picture after substitution of missing entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRef {
    pub frame: FrameInfo,
    /// Frame slot actually bound, which is the substitute's for missing entries.
    pub slot: usize,
    /// Whether the entry refers to its own picture.
    pub valid: bool,
}

/// Auxiliary buffer bound to a register set.
pub struct AuxBinding {
    pub handle: u32,
    pub layout: Rc<AuxLayout>,
    /// Regions placed in on-chip scratch memory instead, with their offset there.
    pub scratch: Vec<(RegionId, usize)>,
    pub scratch_handle: u32,
}

impl AuxBinding {
    /// Handle and offset of region `id`, if the layout has it.
    pub fn locate(&self, id: RegionId) -> Option<(u32, usize)> {
        if let Some((_, offset)) = self.scratch.iter().find(|(r, _)| *r == id) {
            return Some((self.scratch_handle, *offset));
        }
        self.layout.region(id).map(|r| (self.handle, r.offset))
    }
}

/// Motion vector stores bound to a register set.
pub struct ColmvBinding {
    pub current: u32,
    /// One per resolved reference.
    pub refs: Vec<u32>,
}

/// Frames and buffers bound to a task, gathered before its register set is filled.
pub struct Binding {
    pub output: FrameInfo,
    pub output_slot: usize,
    pub stream: PacketInfo,
    pub stream_len: usize,
    /// One per entry of the strategy's reference list.
    pub refs: Vec<ResolvedRef>,
    pub tables: u32,
    pub aux: Option<AuxBinding>,
    pub colmv: Option<ColmvBinding>,
    /// Bit depth after configuration overrides.
    pub bit_depth: u8,
}

impl Binding {
    /// Coded bit depths minus 8 to program, honoring a configured override of the stream's.
    pub fn bit_depths_minus8(&self, luma_minus8: u8, chroma_minus8: u8) -> (u8, u8) {
        if luma_minus8.max(chroma_minus8) + 8 == self.bit_depth {
            (luma_minus8, chroma_minus8)
        } else {
            let depth = self.bit_depth.saturating_sub(8);
            (depth, depth)
        }
    }
}

/// Destination of the register generation steps.
pub struct Emit<'a, R> {
    pub regs: &'a mut R,
    /// The register set's parameter table buffer.
    pub tables: &'a mut [u8],
    pub patches: &'a mut Vec<RegOp>,
}

impl<'a, R> Emit<'a, R> {
    /// Requests `offset` to be added to the buffer address programmed in `reg`.
    pub fn patch(&mut self, reg: u32, offset: usize) {
        if offset != 0 {
            self.patches.push(RegOp::AddrOffset {
                reg,
                offset: offset as u32,
            });
        }
    }
}

/// Completion status decoded from the registers read back after a run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HwStatus {
    pub hard_error: bool,
    pub ref_used: Option<u32>,
}

/// What makes a hardware generation decode a given coding standard.
pub trait GenerationStrategy: Default + 'static {
    type Regs: RegisterImage + 'static;
    type Syntax;

    const STANDARD: CodingStandard;
    const GENERATION: HwGeneration;

    fn syntax(task: &Syntax) -> Option<&Self::Syntax>;

    /// Geometry, bit depth and chroma format of the picture.
    fn picture_format(&self, syntax: &Self::Syntax) -> (Resolution, u8, ChromaFormat);

    /// Frame slots of every reference entry the hardware addresses, `None` for unused or
    /// missing entries.
    fn reference_slots(&self, syntax: &Self::Syntax) -> Vec<Option<usize>>;

    fn region_formulas(&self) -> &'static [RegionFormula] {
        &[]
    }

    fn scratch_policy(&self) -> Option<ScratchPolicy> {
        None
    }

    /// Size of one motion vector store, if the hardware uses a dedicated pool.
    fn colmv_size(&self, _syntax: &Self::Syntax) -> Option<usize> {
        None
    }

    fn supports_layout(&self, layout: FrameLayout) -> bool {
        layout == FrameLayout::Raster
    }

    /// Alignment set on the frame slots at initialization.
    fn default_alignment(&self) -> AlignmentClass;

    /// Alignment for output frames of the given properties.
    fn alignment_for(&self, width: u32, bit_depth: u8, layout: FrameLayout) -> AlignmentClass;

    /// Packs sequence and picture parameter set fields.
    fn pack_parameter_sets(
        &self,
        syntax: &Self::Syntax,
        bind: &Binding,
        out: &mut Emit<Self::Regs>,
    ) -> anyhow::Result<()>;

    /// Packs reference picture bookkeeping.
    fn pack_references(
        &self,
        syntax: &Self::Syntax,
        bind: &Binding,
        out: &mut Emit<Self::Regs>,
    ) -> anyhow::Result<()>;

    /// Copies scaling and entropy tables supplied by the stream.
    fn copy_tables(
        &self,
        syntax: &Self::Syntax,
        bind: &Binding,
        out: &mut Emit<Self::Regs>,
    ) -> anyhow::Result<()>;

    /// Programs device addresses.
    fn bind_addresses(
        &self,
        syntax: &Self::Syntax,
        bind: &Binding,
        out: &mut Emit<Self::Regs>,
    ) -> anyhow::Result<()>;

    /// Programs strides and sizes derived from the output frame.
    fn derive_geometry(
        &self,
        syntax: &Self::Syntax,
        bind: &Binding,
        out: &mut Emit<Self::Regs>,
    ) -> anyhow::Result<()>;

    /// Queues the register set and status reads in hardware order.
    fn queue(&self, regs: &Self::Regs, patches: &[RegOp], batch: &mut RegBatch);

    fn decode_status(&self, readback: &[Vec<u32>]) -> HwStatus;
}

/// Binds every reference entry to a frame.
///
/// Entries without a usable frame take the nearest earlier valid entry, or the nearest later one
/// if there is none before, or the output frame if no entry is valid at all.
pub fn resolve_references(
    slots: &[Option<usize>],
    frames: &dyn FrameSlots,
    output: FrameInfo,
    output_slot: usize,
) -> Vec<ResolvedRef> {
    let own: Vec<Option<ResolvedRef>> = slots
        .iter()
        .map(|slot| {
            let slot = (*slot)?;
            match frames.frame(slot) {
                Some(frame) => Some(ResolvedRef {
                    frame,
                    slot,
                    valid: true,
                }),
                None => {
                    log::warn!("Reference frame slot {} is empty", slot);
                    None
                }
            }
        })
        .collect();

    let fallback = ResolvedRef {
        frame: output,
        slot: output_slot,
        valid: false,
    };

    (0..own.len())
        .map(|i| {
            if let Some(r) = own[i] {
                return r;
            }
            let substitute = own[..i]
                .iter()
                .rev()
                .chain(own[i + 1..].iter())
                .flatten()
                .next()
                .copied()
                .unwrap_or(fallback);
            ResolvedRef {
                valid: false,
                ..substitute
            }
        })
        .collect()
}

/// [`Backend`] driven by a [`GenerationStrategy`].
pub struct HwBackend<S: GenerationStrategy> {
    strategy: S,
    slots: RegisterSetSlots<S::Regs>,
    aux: AuxBuffers,
    mv_pool: MvPool,
    /// Register sets handed to the channel, in submission order.
    submitted: VecDeque<usize>,
}

impl<S: GenerationStrategy> HwBackend<S> {
    pub fn new() -> Self {
        Self {
            strategy: Default::default(),
            slots: RegisterSetSlots::new(0),
            aux: Default::default(),
            mv_pool: Default::default(),
            submitted: VecDeque::new(),
        }
    }

    /// Creates a boxed backend, as stored in accelerator descriptors.
    pub fn create() -> Box<dyn Backend> {
        Box::new(Self::new())
    }

    fn bound_slot(task: &Task) -> BackendResult<usize> {
        task.slot
            .ok_or_else(|| anyhow::anyhow!("task has no register set").into())
    }

    fn fill(
        &mut self,
        slot: usize,
        task: &Task,
        syntax: &S::Syntax,
        env: &mut BackendEnv,
    ) -> BackendResult<()> {
        let frames = env.frames.borrow();
        let output = frames
            .frame(task.output)
            .ok_or(BackendError::MissingFrame(task.output))?;
        if !self.strategy.supports_layout(output.layout) {
            return Err(BackendError::UnsupportedLayout(output.layout));
        }
        let stream = frames
            .packet(task.input)
            .ok_or(BackendError::MissingPacket(task.input))?;

        let (resolution, stream_bit_depth, chroma) = self.strategy.picture_format(syntax);
        let bit_depth = env.config.bit_depth_override.unwrap_or(stream_bit_depth);
        let others_in_flight = self.slots.num_valid() > 1;

        let formulas = self.strategy.region_formulas();
        let aux = if formulas.is_empty() {
            None
        } else {
            let key = LayoutKey {
                resolution,
                bit_depth,
                chroma,
                pipeline_depth: self.slots.len(),
            };
            if others_in_flight && self.aux.needs_refresh(&key) {
                return Err(BackendError::LayoutBusy);
            }
            self.aux.refresh(formulas, key, &env.buffers)?;

            match (self.aux.layout(), self.aux.buffer(slot)) {
                (Some(layout), Some(buffer)) => {
                    let (scratch, scratch_handle) =
                        match (env.scratch, self.strategy.scratch_policy()) {
                            (Some(mem), Some(policy)) => {
                                (policy.select(&layout, mem.size), mem.handle)
                            }
                            _ => (Vec::new(), 0),
                        };
                    Some(AuxBinding {
                        handle: buffer.handle(),
                        layout,
                        scratch,
                        scratch_handle,
                    })
                }
                _ => None,
            }
        };

        let ref_slots = self.strategy.reference_slots(syntax);
        let refs = resolve_references(&ref_slots, &*frames, output, task.output);

        let colmv = match self.strategy.colmv_size(syntax) {
            None => None,
            Some(size) => {
                let highest = refs.iter().map(|r| r.slot).fold(task.output, usize::max);
                let count = frames.buffer_count().max(highest + 1);
                let resized = count > self.mv_pool.len() || size != self.mv_pool.store_size();
                if others_in_flight && resized {
                    return Err(BackendError::LayoutBusy);
                }
                self.mv_pool.ensure(count, size, &env.buffers)?;

                let handle = |slot: usize| self.mv_pool.handle(slot).unwrap_or_default();
                Some(ColmvBinding {
                    current: handle(task.output),
                    refs: refs.iter().map(|r| handle(r.slot)).collect(),
                })
            }
        };
        drop(frames);

        let RegisterSet {
            regs,
            tables,
            patches,
            ..
        } = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| anyhow::anyhow!("register set {} does not exist", slot))?;
        let tables = tables
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("register set {} has no table buffer", slot))?;

        let bind = Binding {
            output,
            output_slot: task.output,
            stream,
            stream_len: task.stream_len,
            refs,
            tables: tables.handle(),
            aux,
            colmv,
            bit_depth,
        };

        *regs = Default::default();
        let tables = tables.map_mut();
        tables.fill(0);
        let mut out = Emit {
            regs,
            tables,
            patches,
        };

        self.strategy.pack_parameter_sets(syntax, &bind, &mut out)?;
        self.strategy.pack_references(syntax, &bind, &mut out)?;
        self.strategy.copy_tables(syntax, &bind, &mut out)?;
        self.strategy.bind_addresses(syntax, &bind, &mut out)?;
        self.strategy.derive_geometry(syntax, &bind, &mut out)?;

        Ok(())
    }
}

impl<S: GenerationStrategy> Default for HwBackend<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: GenerationStrategy> Backend for HwBackend<S> {
    fn standard(&self) -> CodingStandard {
        S::STANDARD
    }

    fn generation(&self) -> HwGeneration {
        S::GENERATION
    }

    fn init(&mut self, env: &mut BackendEnv) -> BackendResult<()> {
        let depth = env.config.pipeline_depth();
        self.slots = RegisterSetSlots::new(depth);
        for set in self.slots.iter_mut() {
            set.tables = Some(env.buffers.get(BufferPurpose::Tables, TABLES_SIZE)?);
        }
        env.frames
            .borrow_mut()
            .set_alignment(self.strategy.default_alignment());

        log::debug!(
            "Initialized {} {} backend with {} register sets",
            S::GENERATION,
            S::STANDARD,
            depth
        );
        Ok(())
    }

    fn generate_registers(&mut self, task: &mut Task, env: &mut BackendEnv) -> BackendResult<()> {
        task.expect_state(TaskState::Idle)?;
        let syntax = S::syntax(&task.syntax)
            .ok_or_else(|| BackendError::WrongStandard(task.syntax.standard()))?;
        let slot = self.slots.acquire().ok_or(BackendError::NoFreeSlot)?;

        if task.must_skip(&env.config) {
            log::debug!(
                "Task with flags {:?} bypasses the hardware in slot {}",
                task.flags,
                slot
            );
            if let Some(set) = self.slots.get_mut(slot) {
                set.skip = true;
            }
            task.slot = Some(slot);
            task.state = TaskState::RegistersGenerated;
            return Ok(());
        }

        if let Err(e) = self.fill(slot, task, syntax, env) {
            self.slots.release(slot);
            return Err(e);
        }

        task.slot = Some(slot);
        task.state = TaskState::RegistersGenerated;
        Ok(())
    }

    fn start(&mut self, task: &mut Task, env: &mut BackendEnv) -> BackendResult<()> {
        task.expect_state(TaskState::RegistersGenerated)?;
        let slot = Self::bound_slot(task)?;
        let set = self
            .slots
            .get(slot)
            .ok_or_else(|| anyhow::anyhow!("register set {} does not exist", slot))?;

        if set.skip {
            task.state = TaskState::Submitted;
            return Ok(());
        }

        let mut batch = RegBatch::new();
        self.strategy.queue(&set.regs, &set.patches, &mut batch);
        set.regs.dump();
        log::debug!(
            "Submitting register set {} ({} ops, crc {:08x})",
            slot,
            batch.ops().len(),
            set.regs.checksum()
        );

        if let Err(e) = env.channel.submit(batch) {
            self.slots.release(slot);
            task.slot = None;
            task.state = TaskState::Completed;
            return Err(BackendError::SubmitFailed(e));
        }

        self.submitted.push_back(slot);
        task.state = TaskState::Submitted;
        Ok(())
    }

    fn wait(
        &mut self,
        task: &mut Task,
        env: &mut BackendEnv,
        callback: &mut dyn FnMut(&CompletionReport),
    ) -> BackendResult<()> {
        task.expect_state(TaskState::Submitted)?;
        let slot = Self::bound_slot(task)?;
        let skipped = self.slots.get(slot).is_some_and(|s| s.skip);

        // The channel completes batches in submission order.
        if let Some(pos) = self.submitted.iter().position(|&s| s == slot) {
            if pos > 0 {
                return Err(anyhow::anyhow!(
                    "register set {} must complete before register set {}",
                    self.submitted[0],
                    slot
                )
                .into());
            }
            self.submitted.pop_front();
        }

        let (raw, status, timed_out) = if skipped {
            (Vec::new(), HwStatus::default(), false)
        } else {
            match env.channel.poll() {
                Ok(readback) => {
                    let status = self.strategy.decode_status(&readback);
                    (readback.concat(), status, false)
                }
                Err(ChannelError::Timeout) => {
                    log::error!("Timed out waiting for register set {}", slot);
                    (
                        Vec::new(),
                        HwStatus {
                            hard_error: true,
                            ref_used: None,
                        },
                        true,
                    )
                }
                Err(e) => {
                    log::error!("Failed to poll register set {}: {}", slot, e);
                    (
                        Vec::new(),
                        HwStatus {
                            hard_error: true,
                            ref_used: None,
                        },
                        false,
                    )
                }
            }
        };

        if status.hard_error && !timed_out {
            log::error!(
                "Hardware error decoding into frame {} (status {:08x?})",
                task.output,
                raw
            );
        }

        task.ref_used = status.ref_used;
        task.state = TaskState::Completed;
        callback(&CompletionReport {
            task: &*task,
            status: &raw,
            hard_error: status.hard_error,
            ref_used: status.ref_used,
            skipped,
            timed_out,
        });

        if let Some(set) = self.slots.get_mut(slot) {
            set.regs.clear_status();
        }
        self.slots.release(slot);
        task.slot = None;

        Ok(())
    }

    fn reset(&mut self, env: &mut BackendEnv) -> BackendResult<()> {
        self.submitted.clear();
        Ok(env.channel.reset()?)
    }

    fn flush(&mut self, env: &mut BackendEnv) -> BackendResult<()> {
        Ok(env.channel.flush()?)
    }

    fn control(&mut self, cmd: ControlCmd, env: &mut BackendEnv) -> BackendResult<()> {
        match cmd {
            ControlCmd::SetFrameInfo {
                width,
                bit_depth,
                layout,
                ..
            } => {
                if !self.strategy.supports_layout(layout) {
                    return Err(BackendError::UnsupportedLayout(layout));
                }
                let class = self.strategy.alignment_for(width, bit_depth, layout);
                log::debug!("Frame alignment set to {:?}", class);
                env.frames.borrow_mut().set_alignment(class);
            }
            ControlCmd::SetErrorTolerance(enabled) => env.config.error_tolerance = enabled,
        }
        Ok(())
    }

    fn tasks_in_flight(&self) -> usize {
        self.slots.num_valid()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::buffer::heap::HeapAllocator;
    use crate::buffer::BufferGroup;
    use crate::decoder::layout::Axis;
    use crate::decoder::regs::RegisterBlock;
    use crate::decoder::HalConfig;
    use crate::decoder::TaskFlags;
    use crate::device::dummy::DummyChannel;
    use crate::device::dummy::PollScript;
    use crate::device::dummy::SharedLog;
    use crate::frame::PacketInfo;
    use crate::frame::SlotTable;

    /// Frame table with `count` 1080p frames in slots `0..count` and one packet in slot 0.
    pub(crate) fn frame_table(count: usize) -> Rc<RefCell<SlotTable>> {
        let mut table = SlotTable::new();
        for i in 0..count {
            table.insert_frame(
                i,
                FrameInfo {
                    handle: 100 + i as u32,
                    resolution: Resolution::from((1920, 1080)),
                    bit_depth: 8,
                    ..Default::default()
                },
            );
        }
        table.insert_packet(
            0,
            PacketInfo {
                handle: 50,
                capacity: 1 << 20,
            },
        );
        Rc::new(RefCell::new(table))
    }

    pub(crate) fn test_env(
        log: &SharedLog,
        frames: Rc<RefCell<SlotTable>>,
        config: HalConfig,
    ) -> BackendEnv {
        BackendEnv {
            channel: Box::new(DummyChannel::new(Rc::clone(log))),
            buffers: BufferGroup::new(Box::new(HeapAllocator::new())),
            frames,
            config,
            scratch: None,
        }
    }

    /// Binding of frame 0 with references in `ref_slots` of a 4-frame table.
    pub(crate) fn test_binding(ref_slots: &[Option<usize>]) -> Binding {
        let frames = frame_table(4);
        let table = frames.borrow();
        let output = table.frame(0).unwrap();
        Binding {
            output,
            output_slot: 0,
            stream: table.packet(0).unwrap(),
            stream_len: 1000,
            refs: resolve_references(ref_slots, &*table, output, 0),
            tables: 7,
            aux: None,
            colmv: None,
            bit_depth: 8,
        }
    }

    struct TestRegs {
        block: RegisterBlock,
    }

    impl Default for TestRegs {
        fn default() -> Self {
            Self {
                block: RegisterBlock::new(0, 8),
            }
        }
    }

    impl RegisterImage for TestRegs {
        fn blocks(&self) -> Vec<&RegisterBlock> {
            vec![&self.block]
        }

        fn clear_status(&mut self) {
            self.block.set(7, 0);
        }
    }

    /// H.264 strategy with a toy register layout: reg0 = POC, reg1 = output, reg2..=5 = four
    /// references, reg6 = stream, reg7 = status.
    #[derive(Default)]
    struct TestStrategy;

    impl GenerationStrategy for TestStrategy {
        type Regs = TestRegs;
        type Syntax = crate::codec::h264::Syntax;

        const STANDARD: CodingStandard = CodingStandard::H264;
        const GENERATION: HwGeneration = HwGeneration::Rkv;

        fn syntax(task: &Syntax) -> Option<&Self::Syntax> {
            match task {
                Syntax::H264(s) => Some(&**s),
                _ => None,
            }
        }

        fn picture_format(&self, syntax: &Self::Syntax) -> (Resolution, u8, ChromaFormat) {
            (
                syntax.pic.resolution(),
                syntax.pic.bit_depth(),
                syntax.pic.chroma_format(),
            )
        }

        fn reference_slots(&self, syntax: &Self::Syntax) -> Vec<Option<usize>> {
            syntax.pic.refs[..4].iter().map(|r| r.slot).collect()
        }

        fn region_formulas(&self) -> &'static [RegionFormula] {
            &[RegionFormula {
                id: RegionId::IntraRow,
                axis: Axis::Row,
                unit: 16,
                bytes_per_unit: 24,
                sample_scaled: false,
                independent: true,
            }]
        }

        fn colmv_size(&self, _syntax: &Self::Syntax) -> Option<usize> {
            Some(4096)
        }

        fn default_alignment(&self) -> AlignmentClass {
            AlignmentClass::Align16
        }

        fn alignment_for(&self, width: u32, _: u8, _: FrameLayout) -> AlignmentClass {
            if width > 1920 {
                AlignmentClass::Odd256
            } else {
                AlignmentClass::Align16
            }
        }

        fn pack_parameter_sets(
            &self,
            syntax: &Self::Syntax,
            _: &Binding,
            out: &mut Emit<TestRegs>,
        ) -> anyhow::Result<()> {
            out.regs.block.set(0, syntax.pic.top_poc as u32);
            out.tables[0] = 0x5a;
            Ok(())
        }

        fn pack_references(
            &self,
            _: &Self::Syntax,
            _: &Binding,
            _: &mut Emit<TestRegs>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn copy_tables(
            &self,
            _: &Self::Syntax,
            _: &Binding,
            _: &mut Emit<TestRegs>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn bind_addresses(
            &self,
            _: &Self::Syntax,
            bind: &Binding,
            out: &mut Emit<TestRegs>,
        ) -> anyhow::Result<()> {
            out.regs.block.set(1, bind.output.handle);
            for (i, r) in bind.refs.iter().enumerate() {
                out.regs.block.set(2 + i as u32, r.frame.handle);
            }
            out.regs.block.set(6, bind.stream.handle);
            out.patch(6, 0);
            out.patch(1, 0x40);
            Ok(())
        }

        fn derive_geometry(
            &self,
            _: &Self::Syntax,
            _: &Binding,
            _: &mut Emit<TestRegs>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn queue(&self, regs: &TestRegs, patches: &[RegOp], batch: &mut RegBatch) {
            batch.write(regs.block.offset(), regs.block.range(0, 6));
            for patch in patches {
                if let RegOp::AddrOffset { reg, offset } = patch {
                    batch.addr_offset(*reg, *offset);
                }
            }
            batch.read(28, 1);
        }

        fn decode_status(&self, readback: &[Vec<u32>]) -> HwStatus {
            let status = readback.first().and_then(|b| b.first()).copied().unwrap_or(0);
            HwStatus {
                hard_error: status & 1 == 0,
                ref_used: None,
            }
        }
    }

    fn h264_task(refs: &[Option<usize>]) -> Task {
        let mut syntax = crate::codec::h264::Syntax::default();
        syntax.pic.pic_width_in_mbs_minus1 = 119;
        syntax.pic.frame_height_in_mbs_minus1 = 67;
        syntax.pic.top_poc = 8;
        for (entry, slot) in syntax.pic.refs.iter_mut().zip(refs) {
            entry.slot = *slot;
        }
        Task::new(Syntax::H264(Box::new(syntax)), 0, 1000, 0)
    }

    fn run(
        backend: &mut HwBackend<TestStrategy>,
        task: &mut Task,
        env: &mut BackendEnv,
    ) -> Vec<(bool, bool, bool)> {
        let mut reports = Vec::new();
        backend.generate_registers(task, env).unwrap();
        backend.start(task, env).unwrap();
        backend
            .wait(task, env, &mut |r| {
                reports.push((r.hard_error, r.skipped, r.timed_out))
            })
            .unwrap();
        reports
    }

    fn setup(config: HalConfig) -> (SharedLog, BackendEnv, HwBackend<TestStrategy>) {
        let _ = env_logger::try_init();
        let log = SharedLog::default();
        log.borrow_mut().default_reads.insert(28, vec![1]);
        let mut env = test_env(&log, frame_table(4), config);
        let mut backend = HwBackend::<TestStrategy>::new();
        backend.init(&mut env).unwrap();
        (log, env, backend)
    }

    #[test]
    fn full_cycle() {
        let (log, mut env, mut backend) = setup(HalConfig::default());
        let mut task = h264_task(&[Some(1), Some(2)]);

        let reports = run(&mut backend, &mut task, &mut env);
        assert_eq!(reports, vec![(false, false, false)]);
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.slot(), None);
        assert_eq!(backend.tasks_in_flight(), 0);

        let log = log.borrow();
        assert_eq!(log.submitted.len(), 1);
        assert_eq!(log.polls, 1);
        let ops = log.submitted[0].ops();
        match &ops[0] {
            RegOp::Write { offset, words } => {
                assert_eq!(*offset, 0);
                // POC, output, refs 1 and 2, then missing refs substituted with ref 2, stream.
                assert_eq!(words, &vec![8, 100, 101, 102, 102, 102, 50]);
            }
            op => panic!("unexpected op {:?}", op),
        }
        assert_eq!(ops[1], RegOp::AddrOffset { reg: 1, offset: 0x40 });
        assert_eq!(ops[2], RegOp::Read { offset: 28, count: 1 });
    }

    #[test]
    fn skipped_task_never_reaches_hardware() {
        let (log, mut env, mut backend) = setup(HalConfig::default());
        let mut task = h264_task(&[Some(1)]);
        task.flags = TaskFlags::REF_ERROR;

        let reports = run(&mut backend, &mut task, &mut env);
        assert_eq!(reports, vec![(false, true, false)]);
        assert_eq!(backend.tasks_in_flight(), 0);
        let log = log.borrow();
        assert!(log.submitted.is_empty());
        assert_eq!(log.polls, 0);
    }

    #[test]
    fn error_tolerance_submits_broken_references() {
        let (log, mut env, mut backend) = setup(HalConfig::default());
        backend
            .control(ControlCmd::SetErrorTolerance(true), &mut env)
            .unwrap();
        let mut task = h264_task(&[Some(1)]);
        task.flags = TaskFlags::REF_ERROR;

        let reports = run(&mut backend, &mut task, &mut env);
        assert_eq!(reports, vec![(false, false, false)]);
        assert_eq!(log.borrow().submitted.len(), 1);
    }

    #[test]
    fn hard_errors_and_timeouts_are_reported() {
        let (log, mut env, mut backend) = setup(HalConfig::default());

        log.borrow_mut()
            .script
            .push_back(PollScript::Status(vec![vec![0]]));
        let mut task = h264_task(&[]);
        assert_eq!(
            run(&mut backend, &mut task, &mut env),
            vec![(true, false, false)]
        );

        log.borrow_mut().script.push_back(PollScript::Timeout);
        task.recycle();
        assert_eq!(
            run(&mut backend, &mut task, &mut env),
            vec![(true, false, true)]
        );
        assert_eq!(backend.tasks_in_flight(), 0);
    }

    #[test]
    fn rejected_submission_releases_the_slot() {
        let (log, mut env, mut backend) = setup(HalConfig::default());
        log.borrow_mut().reject_submits = true;

        let mut task = h264_task(&[]);
        backend.generate_registers(&mut task, &mut env).unwrap();
        assert_eq!(backend.tasks_in_flight(), 1);
        assert!(matches!(
            backend.start(&mut task, &mut env),
            Err(BackendError::SubmitFailed(_))
        ));
        assert_eq!(backend.tasks_in_flight(), 0);
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn state_machine_is_enforced() {
        let (_log, mut env, mut backend) = setup(HalConfig::default());
        let mut task = h264_task(&[]);

        assert!(matches!(
            backend.start(&mut task, &mut env),
            Err(BackendError::InvalidState { .. })
        ));
        backend.generate_registers(&mut task, &mut env).unwrap();
        assert!(matches!(
            backend.generate_registers(&mut task, &mut env),
            Err(BackendError::InvalidState { .. })
        ));
        assert!(matches!(
            backend.wait(&mut task, &mut env, &mut |_| ()),
            Err(BackendError::InvalidState { .. })
        ));

        let mut other = Task::new(Syntax::H265(Default::default()), 0, 0, 0);
        assert!(matches!(
            backend.generate_registers(&mut other, &mut env),
            Err(BackendError::WrongStandard(CodingStandard::H265))
        ));
    }

    #[test]
    fn single_slot_without_fast_mode() {
        let (_log, mut env, mut backend) = setup(HalConfig::default());
        let mut first = h264_task(&[]);
        let mut second = h264_task(&[]);
        backend.generate_registers(&mut first, &mut env).unwrap();
        assert!(matches!(
            backend.generate_registers(&mut second, &mut env),
            Err(BackendError::NoFreeSlot)
        ));
        assert_eq!(second.state(), TaskState::Idle);
    }

    #[test]
    fn pipelined_tasks_use_distinct_slots() {
        let (log, mut env, mut backend) = setup(HalConfig {
            fast_mode: true,
            ..Default::default()
        });
        let mut tasks: Vec<Task> = (0..3).map(|_| h264_task(&[Some(1)])).collect();
        for task in tasks.iter_mut() {
            backend.generate_registers(task, &mut env).unwrap();
        }
        let slots: Vec<_> = tasks.iter().map(|t| t.slot().unwrap()).collect();
        assert_eq!(slots, vec![0, 1, 2]);

        // Only the second run fails on the hardware.
        for status in [1, 0, 1] {
            log.borrow_mut()
                .script
                .push_back(PollScript::Status(vec![vec![status]]));
        }
        for task in tasks.iter_mut() {
            backend.start(task, &mut env).unwrap();
        }
        assert_eq!(log.borrow().submitted.len(), 3);
        assert_eq!(backend.tasks_in_flight(), 3);

        let mut errors = Vec::new();
        for task in tasks.iter_mut() {
            backend
                .wait(task, &mut env, &mut |r| errors.push(r.hard_error))
                .unwrap();
            assert_eq!(task.state(), TaskState::Completed);
        }
        assert_eq!(errors, vec![false, true, false]);
        assert_eq!(log.borrow().polls, 3);
        assert_eq!(backend.tasks_in_flight(), 0);
        assert_eq!(backend.aux.num_buffers(), 3);
    }

    #[test]
    fn tasks_complete_in_submission_order() {
        let (log, mut env, mut backend) = setup(HalConfig {
            fast_mode: true,
            ..Default::default()
        });
        let mut first = h264_task(&[]);
        let mut second = h264_task(&[]);
        for task in [&mut first, &mut second] {
            backend.generate_registers(task, &mut env).unwrap();
            backend.start(task, &mut env).unwrap();
        }

        assert!(matches!(
            backend.wait(&mut second, &mut env, &mut |_| ()),
            Err(BackendError::Other(_))
        ));
        assert_eq!(second.state(), TaskState::Submitted);
        assert_eq!(log.borrow().polls, 0);

        backend.wait(&mut first, &mut env, &mut |_| ()).unwrap();
        backend.wait(&mut second, &mut env, &mut |_| ()).unwrap();
        assert_eq!(log.borrow().polls, 2);
    }

    #[test]
    fn geometry_change_with_tasks_in_flight_is_refused() {
        let (_log, mut env, mut backend) = setup(HalConfig {
            fast_mode: true,
            ..Default::default()
        });
        let mut first = h264_task(&[]);
        backend.generate_registers(&mut first, &mut env).unwrap();

        let mut second = h264_task(&[]);
        if let Syntax::H264(s) = &mut second.syntax {
            s.pic.pic_width_in_mbs_minus1 = 79;
        }
        assert!(matches!(
            backend.generate_registers(&mut second, &mut env),
            Err(BackendError::LayoutBusy)
        ));
        assert_eq!(backend.tasks_in_flight(), 1);

        backend.start(&mut first, &mut env).unwrap();
        backend.wait(&mut first, &mut env, &mut |_| ()).unwrap();
        backend.generate_registers(&mut second, &mut env).unwrap();
    }

    #[test]
    fn identical_geometry_does_not_reallocate() {
        let (_log, mut env, mut backend) = setup(HalConfig::default());
        let mut task = h264_task(&[]);
        run(&mut backend, &mut task, &mut env);
        task.recycle();
        run(&mut backend, &mut task, &mut env);
        assert_eq!(backend.aux.allocations(), 1);
    }

    #[test]
    fn missing_frames_fail_cleanly() {
        let (_log, mut env, mut backend) = setup(HalConfig::default());
        let mut task = h264_task(&[]);
        task.output = 9;
        assert!(matches!(
            backend.generate_registers(&mut task, &mut env),
            Err(BackendError::MissingFrame(9))
        ));
        task.output = 0;
        task.input = 3;
        assert!(matches!(
            backend.generate_registers(&mut task, &mut env),
            Err(BackendError::MissingPacket(3))
        ));
        assert_eq!(backend.tasks_in_flight(), 0);
    }

    #[test]
    fn reference_substitution() {
        let frames = frame_table(4);
        let table = frames.borrow();
        let output = table.frame(0).unwrap();

        let ref_slots = [None, Some(2), None, Some(7), Some(3)];
        let resolved = resolve_references(&ref_slots, &*table, output, 0);
        let slots: Vec<_> = resolved.iter().map(|r| (r.slot, r.valid)).collect();
        assert_eq!(
            slots,
            vec![(2, false), (2, true), (2, false), (2, false), (3, true)]
        );

        let resolved = resolve_references(&[None, None], &*table, output, 0);
        assert!(resolved.iter().all(|r| r.slot == 0 && !r.valid));
    }

    #[test]
    fn frame_alignment_control() {
        let frames = frame_table(1);
        let log = SharedLog::default();
        let mut env = test_env(&log, Rc::clone(&frames), HalConfig::default());
        let mut backend = HwBackend::<TestStrategy>::new();
        backend.init(&mut env).unwrap();
        assert_eq!(frames.borrow().alignment(), AlignmentClass::Align16);

        backend
            .control(
                ControlCmd::SetFrameInfo {
                    width: 3840,
                    height: 2160,
                    bit_depth: 8,
                    layout: FrameLayout::Raster,
                },
                &mut env,
            )
            .unwrap();
        assert_eq!(frames.borrow().alignment(), AlignmentClass::Odd256);

        assert!(matches!(
            backend.control(
                ControlCmd::SetFrameInfo {
                    width: 3840,
                    height: 2160,
                    bit_depth: 8,
                    layout: FrameLayout::Compressed,
                },
                &mut env,
            ),
            Err(BackendError::UnsupportedLayout(FrameLayout::Compressed))
        ));
    }
}

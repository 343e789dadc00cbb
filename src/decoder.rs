// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding tasks and the backends executing them.
//!
//! A [`Backend`] drives one generation of decoder hardware for one coding standard. Every picture
//! goes through it as a [`Task`], in four steps:
//!
//! 1. [`Backend::generate_registers`] reserves a register-set slot and fills it from the task's
//!    syntax,
//! 2. [`Backend::start`] submits the slot to the device channel,
//! 3. [`Backend::wait`] blocks until the hardware is done, reports the outcome through a
//!    [`CompletionReport`] and frees the slot.
//!
//! In fast mode, several tasks can be generated and started before the first one is waited on.
//! Backends are normally not used directly but through a [`session::Session`] opened from a
//! [`registry::Registry`].

pub mod h264;
pub mod h265;
pub mod layout;
pub mod mv_pool;
pub mod registry;
pub mod regs;
pub mod rkv;
pub mod session;
pub mod slots;
pub mod transcoder;
pub mod vdpu34x;

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use enumn::N;
use thiserror::Error;

use crate::buffer::AllocError;
use crate::buffer::BufferGroup;
use crate::codec;
use crate::device::ChannelError;
use crate::device::DeviceChannel;
use crate::device::ScratchMemory;
use crate::frame::FrameLayout;
use crate::frame::SharedFrameSlots;
use crate::CodingStandard;

/// Number of register sets kept in flight in fast mode.
pub const PIPELINE_DEPTH: usize = 3;

/// Generation of decoder hardware, i.e. one register layout.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum HwGeneration {
    /// First generation block: one flat register file, no external row buffers.
    Rkv = 0,
    /// Second generation block: split register file, external row/column buffers.
    Vdpu34x = 1,
}

/// Hardware blocks sharing a register layout and able to switch coding standards in place.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HwFamily {
    Rkvdec,
    Rkvdec2,
}

impl HwGeneration {
    pub fn family(&self) -> HwFamily {
        match self {
            HwGeneration::Rkv => HwFamily::Rkvdec,
            HwGeneration::Vdpu34x => HwFamily::Rkvdec2,
        }
    }

    pub fn caps(&self) -> HwCaps {
        match self {
            HwGeneration::Rkv => HwCaps::RKV,
            HwGeneration::Vdpu34x => HwCaps::VDPU34X,
        }
    }
}

impl FromStr for HwGeneration {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rkv" | "rkvdec" => Ok(HwGeneration::Rkv),
            "vdpu34x" | "rkvdec2" => Ok(HwGeneration::Vdpu34x),
            _ => Err("unrecognized hardware generation. Valid values: rkv, vdpu34x"),
        }
    }
}

impl fmt::Display for HwGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwGeneration::Rkv => f.write_str("rkv"),
            HwGeneration::Vdpu34x => f.write_str("vdpu34x"),
        }
    }
}

bitflags! {
    /// Decoder hardware present on the running SoC.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct HwCaps: u32 {
        const RKV = 1 << 0;
        const VDPU34X = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocVariant {
    Rk3288,
    Rk3328,
    Rk3399,
    Rk3568,
    Rk3588,
}

impl SocVariant {
    pub fn caps(&self) -> HwCaps {
        match self {
            SocVariant::Rk3288 | SocVariant::Rk3328 | SocVariant::Rk3399 => HwCaps::RKV,
            SocVariant::Rk3568 => HwCaps::VDPU34X,
            SocVariant::Rk3588 => HwCaps::RKV | HwCaps::VDPU34X,
        }
    }
}

/// Session configuration, fixed at open time except for what [`ControlCmd`] changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HalConfig {
    /// Bit depth used instead of the one signalled by the stream.
    pub bit_depth_override: Option<u8>,
    /// Decode pictures whose references are known to be broken instead of skipping them.
    pub error_tolerance: bool,
    /// Generation to try before the default order.
    pub forced_generation: Option<HwGeneration>,
    /// Keep up to [`PIPELINE_DEPTH`] tasks in flight.
    pub fast_mode: bool,
}

impl HalConfig {
    pub fn pipeline_depth(&self) -> usize {
        if self.fast_mode {
            PIPELINE_DEPTH
        } else {
            1
        }
    }
}

bitflags! {
    /// Errors inherited from the parser.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct TaskFlags: u32 {
        const PARSE_ERROR = 1 << 0;
        const REF_ERROR = 1 << 1;
    }
}

/// Parsed syntax of one picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Syntax {
    H264(Box<codec::h264::Syntax>),
    H265(Box<codec::h265::Syntax>),
}

impl Syntax {
    pub fn standard(&self) -> CodingStandard {
        match self {
            Syntax::H264(_) => CodingStandard::H264,
            Syntax::H265(_) => CodingStandard::H265,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskState {
    #[default]
    Idle,
    RegistersGenerated,
    Submitted,
    Completed,
}

/// One picture to decode.
#[derive(Clone, Debug)]
pub struct Task {
    pub syntax: Syntax,
    /// Packet slot holding the bitstream.
    pub input: usize,
    /// Number of valid bytes in the packet.
    pub stream_len: usize,
    /// Frame slot receiving the decoded picture.
    pub output: usize,
    pub flags: TaskFlags,
    /// References the hardware actually read, when it reports them.
    pub ref_used: Option<u32>,
    slot: Option<usize>,
    state: TaskState,
}

impl Task {
    pub fn new(syntax: Syntax, input: usize, stream_len: usize, output: usize) -> Self {
        Self {
            syntax,
            input,
            stream_len,
            output,
            flags: Default::default(),
            ref_used: None,
            slot: None,
            state: Default::default(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Register-set slot bound to the task, between register generation and completion.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Prepares a completed task to go through the pipeline again.
    pub fn recycle(&mut self) {
        self.flags = Default::default();
        self.ref_used = None;
        self.slot = None;
        self.state = TaskState::Idle;
    }

    /// Whether the task must not reach the hardware.
    pub(crate) fn must_skip(&self, config: &HalConfig) -> bool {
        self.flags.contains(TaskFlags::PARSE_ERROR)
            || (self.flags.contains(TaskFlags::REF_ERROR) && !config.error_tolerance)
    }

    fn expect_state(&self, expected: TaskState) -> BackendResult<()> {
        if self.state != expected {
            return Err(BackendError::InvalidState {
                state: self.state,
                expected,
            });
        }
        Ok(())
    }
}

/// Outcome of a task, passed to the completion callback.
#[derive(Debug)]
pub struct CompletionReport<'a> {
    pub task: &'a Task,
    /// Raw status and statistics registers, in the order the backend read them. Empty if the
    /// hardware was not run.
    pub status: &'a [u32],
    /// The hardware reported the picture as not properly decoded.
    pub hard_error: bool,
    /// Bitmap of the references read by the hardware, if it reports them.
    pub ref_used: Option<u32>,
    /// The task carried inherited errors and was never submitted.
    pub skipped: bool,
    /// The channel gave up waiting for the hardware.
    pub timed_out: bool,
}

/// Runtime commands accepted by [`Backend::control`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCmd {
    /// Output frame properties, used to pick the stride alignment of frame slots.
    SetFrameInfo {
        width: u32,
        height: u32,
        bit_depth: u8,
        layout: FrameLayout,
    },
    SetErrorTolerance(bool),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no free register set")]
    NoFreeSlot,
    #[error("task is {state:?}, expected {expected:?}")]
    InvalidState { state: TaskState, expected: TaskState },
    #[error("task syntax is {0}, which this backend does not decode")]
    WrongStandard(CodingStandard),
    #[error("picture geometry changed while other tasks are in flight")]
    LayoutBusy,
    #[error("no frame in slot {0}")]
    MissingFrame(usize),
    #[error("no packet in slot {0}")]
    MissingPacket(usize),
    #[error("frame layout {0:?} is not supported by this hardware")]
    UnsupportedLayout(FrameLayout),
    #[error("failed to submit task: {0}")]
    SubmitFailed(#[source] ChannelError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Resources owned by a session and lent to its backend on every call.
pub struct BackendEnv {
    pub channel: Box<dyn DeviceChannel>,
    pub buffers: BufferGroup,
    pub frames: SharedFrameSlots,
    pub config: HalConfig,
    pub scratch: Option<ScratchMemory>,
}

/// Completion callback of a session.
pub type CompletionCallback = Box<dyn FnMut(&CompletionReport)>;

/// One hardware generation decoding one coding standard.
pub trait Backend {
    fn standard(&self) -> CodingStandard;

    fn generation(&self) -> HwGeneration;

    /// Allocates the register sets and per-session buffers and configures the frame slots.
    fn init(&mut self, env: &mut BackendEnv) -> BackendResult<()>;

    /// Reserves a register set for `task` and fills it.
    ///
    /// Tasks carrying a parse error, or a reference error while error tolerance is disabled, get
    /// a register set marked as a no-op that never reaches the hardware.
    fn generate_registers(&mut self, task: &mut Task, env: &mut BackendEnv) -> BackendResult<()>;

    /// Submits the register set of `task`.
    fn start(&mut self, task: &mut Task, env: &mut BackendEnv) -> BackendResult<()>;

    /// Waits for `task` to complete, reports it to `callback` and frees its register set.
    ///
    /// Hardware errors are reported through [`CompletionReport::hard_error`], not as `Err`.
    fn wait(
        &mut self,
        task: &mut Task,
        env: &mut BackendEnv,
        callback: &mut dyn FnMut(&CompletionReport),
    ) -> BackendResult<()>;

    fn reset(&mut self, env: &mut BackendEnv) -> BackendResult<()>;

    fn flush(&mut self, env: &mut BackendEnv) -> BackendResult<()>;

    fn control(&mut self, cmd: ControlCmd, env: &mut BackendEnv) -> BackendResult<()>;

    /// Number of register sets currently in use.
    fn tasks_in_flight(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_rules() {
        let mut task = Task::new(Syntax::H264(Default::default()), 0, 0, 0);
        let strict = HalConfig::default();
        let tolerant = HalConfig {
            error_tolerance: true,
            ..Default::default()
        };
        assert!(!task.must_skip(&strict));

        task.flags = TaskFlags::REF_ERROR;
        assert!(task.must_skip(&strict));
        assert!(!task.must_skip(&tolerant));

        task.flags = TaskFlags::PARSE_ERROR;
        assert!(task.must_skip(&tolerant));
    }

    #[test]
    fn generation_from_str() {
        assert_eq!("rkvdec2".parse(), Ok(HwGeneration::Vdpu34x));
        assert_eq!(HwGeneration::Rkv.to_string(), "rkv");
        assert!("vdpu1".parse::<HwGeneration>().is_err());
        assert_eq!(
            SocVariant::Rk3588.caps(),
            HwGeneration::Rkv.caps() | HwGeneration::Vdpu34x.caps()
        );
    }
}

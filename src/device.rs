// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Channel to the kernel driver executing register writes and reads on the decoder hardware.
//!
//! A backend describes one hardware run as a [`RegBatch`]: an ordered list of register block
//! writes, register block reads and address offset patches. The batch is submitted as a whole,
//! then [`DeviceChannel::poll`] blocks until the hardware is done and returns the contents of
//! every read block, in the order the reads were queued.
//!
//! Several batches may be pending at once. The hardware runs them one after the other in
//! submission order, and each poll completes the oldest one.

#[cfg(test)]
pub(crate) mod dummy;
#[cfg(feature = "mpp")]
pub mod mpp_service;

use enumn::N;
use thiserror::Error;

use crate::buffer::AllocError;
use crate::buffer::Allocator;

/// Hardware client a channel is attached to.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ClientType {
    HevcDec = 8,
    RkvDec = 9,
}

/// One register operation. Offsets are in bytes from the start of the register file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegOp {
    Write { offset: u32, words: Vec<u32> },
    Read { offset: u32, count: usize },
    /// Adds `offset` to the buffer handle programmed in register `reg` once the handle has been
    /// translated into a device address.
    AddrOffset { reg: u32, offset: u32 },
}

/// Ordered list of register operations making up one hardware run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegBatch {
    ops: Vec<RegOp>,
}

impl RegBatch {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn write(&mut self, offset: u32, words: &[u32]) -> &mut Self {
        self.ops.push(RegOp::Write {
            offset,
            words: words.to_vec(),
        });
        self
    }

    pub fn read(&mut self, offset: u32, count: usize) -> &mut Self {
        self.ops.push(RegOp::Read { offset, count });
        self
    }

    pub fn addr_offset(&mut self, reg: u32, offset: u32) -> &mut Self {
        self.ops.push(RegOp::AddrOffset { reg, offset });
        self
    }

    pub fn ops(&self) -> &[RegOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Read operations, in queue order.
    pub fn reads(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.ops.iter().filter_map(|op| match op {
            RegOp::Read { offset, count } => Some((*offset, *count)),
            _ => None,
        })
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request rejected by the device: {0}")]
    Rejected(String),
    #[error("timed out waiting for the hardware")]
    Timeout,
    #[error("no request is pending")]
    NothingPending,
    #[error("device error: {0}")]
    Io(#[from] nix::Error),
}

/// Kernel-mediated register channel attached to one hardware client.
pub trait DeviceChannel {
    /// Queues `batch` for execution after every batch already pending.
    fn submit(&mut self, batch: RegBatch) -> Result<(), ChannelError>;
    /// Blocks until the oldest pending batch completes and returns one block per read it queued.
    fn poll(&mut self) -> Result<Vec<Vec<u32>>, ChannelError>;
    /// Resets the hardware, dropping every pending batch.
    fn reset(&mut self) -> Result<(), ChannelError>;
    fn flush(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// On-chip memory usable for row/column working buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScratchMemory {
    pub handle: u32,
    pub size: usize,
}

/// Services provided by the running system to a decoding session.
pub trait Platform {
    /// Opens a channel attached to `client`.
    fn open_channel(&self, client: ClientType) -> Result<Box<dyn DeviceChannel>, ChannelError>;
    /// Creates the allocator backing a session's buffer group.
    fn allocator(&self) -> Result<Box<dyn Allocator>, AllocError>;
    /// On-chip scratch memory, if the SoC has any.
    fn scratch(&self) -> Option<ScratchMemory> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_keeps_order() {
        let mut batch = RegBatch::new();
        batch
            .write(0x100, &[1, 2])
            .addr_offset(64, 0x40)
            .read(0x380, 1)
            .write(0x20, &[3])
            .read(0x400, 4);

        assert_eq!(batch.ops().len(), 5);
        assert_eq!(batch.ops()[1], RegOp::AddrOffset { reg: 64, offset: 0x40 });
        assert_eq!(batch.reads().collect::<Vec<_>>(), vec![(0x380, 1), (0x400, 4)]);
    }
}

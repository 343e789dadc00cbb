// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register channel over the `mpp_service` kernel driver.
//!
//! Every command is a `mpp_request` passed through a single ioctl. Several requests can be chained
//! in one call by setting `MULTI_MSG` on all of them and `LAST_MSG` on the final one. Register
//! reads are only recorded at submission; the driver fills the destination buffers when the poll
//! command returns.

use std::collections::VecDeque;
use std::fs::File;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::ioctl_write_ptr_bad;
use nix::libc;
use nix::request_code_write;

use crate::buffer::dma_heap::DmaHeapAllocator;
use crate::buffer::AllocError;
use crate::buffer::Allocator;
use crate::device::ChannelError;
use crate::device::ClientType;
use crate::device::DeviceChannel;
use crate::device::Platform;
use crate::device::RegBatch;
use crate::device::RegOp;
use crate::device::ScratchMemory;

pub const MPP_SERVICE_PATH: &str = "/dev/mpp_service";

const MPP_IOC_MAGIC: u8 = b'v';
const MPP_IOC_CFG_V1: u8 = 1;

const MPP_CMD_INIT_CLIENT_TYPE: u32 = 0x100;
const MPP_CMD_SET_REG_WRITE: u32 = 0x200;
const MPP_CMD_SET_REG_READ: u32 = 0x201;
const MPP_CMD_SET_REG_ADDR_OFFSET: u32 = 0x202;
const MPP_CMD_POLL_HW_FINISH: u32 = 0x300;
const MPP_CMD_RESET_SESSION: u32 = 0x400;

const MPP_FLAGS_MULTI_MSG: u32 = 1 << 0;
const MPP_FLAGS_LAST_MSG: u32 = 1 << 1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct mpp_request {
    cmd: u32,
    flag: u32,
    size: u32,
    offset: u32,
    data_ptr: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct reg_offset_elem {
    index: u32,
    offset: u32,
}

// The driver declares the command with a `u32` size even though it takes an array of requests.
ioctl_write_ptr_bad!(
    mpp_ioc_cfg_v1,
    request_code_write!(MPP_IOC_MAGIC, MPP_IOC_CFG_V1, size_of::<u32>()),
    mpp_request
);

pub struct MppServiceChannel {
    dev: File,
    client: ClientType,
    /// Destination buffers of the reads of every pending batch, oldest first. The driver writes
    /// into them when the matching poll returns.
    pending: VecDeque<Vec<Vec<u32>>>,
}

impl MppServiceChannel {
    /// Opens the driver at `path` and attaches the new session to `client`.
    pub fn open<P: AsRef<Path>>(path: P, client: ClientType) -> Result<Self, ChannelError> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::ENODEV)))?;

        let channel = Self {
            dev,
            client,
            pending: VecDeque::new(),
        };

        let client_type = client as u32;
        let mut req = [mpp_request {
            cmd: MPP_CMD_INIT_CLIENT_TYPE,
            size: size_of::<u32>() as u32,
            data_ptr: &client_type as *const u32 as u64,
            ..Default::default()
        }];
        channel.send(&mut req)?;
        log::debug!("Attached mpp_service channel to {:?}", client);

        Ok(channel)
    }

    fn send(&self, reqs: &mut [mpp_request]) -> Result<(), ChannelError> {
        let Some((last, rest)) = reqs.split_last_mut() else {
            return Ok(());
        };
        for req in rest {
            req.flag |= MPP_FLAGS_MULTI_MSG;
        }
        last.flag |= MPP_FLAGS_MULTI_MSG | MPP_FLAGS_LAST_MSG;

        loop {
            // SAFETY: `reqs` is a valid array of requests whose data pointers all outlive this
            // call, and the driver stops at the one flagged `LAST_MSG`.
            match unsafe { mpp_ioc_cfg_v1(self.dev.as_raw_fd(), reqs.as_ptr()) } {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::ETIMEDOUT) => return Err(ChannelError::Timeout),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl DeviceChannel for MppServiceChannel {
    fn submit(&mut self, batch: RegBatch) -> Result<(), ChannelError> {
        let mut reqs = Vec::new();
        let mut offsets = Vec::new();
        let mut read_specs = Vec::new();
        for op in batch.ops() {
            match op {
                RegOp::Write { offset, words } => reqs.push(mpp_request {
                    cmd: MPP_CMD_SET_REG_WRITE,
                    size: (words.len() * size_of::<u32>()) as u32,
                    offset: *offset,
                    data_ptr: words.as_ptr() as u64,
                    ..Default::default()
                }),
                RegOp::AddrOffset { reg, offset } => offsets.push(reg_offset_elem {
                    index: *reg,
                    offset: *offset,
                }),
                RegOp::Read { offset, count } => read_specs.push((*offset, *count)),
            }
        }

        if !offsets.is_empty() {
            reqs.push(mpp_request {
                cmd: MPP_CMD_SET_REG_ADDR_OFFSET,
                size: (offsets.len() * size_of::<reg_offset_elem>()) as u32,
                data_ptr: offsets.as_ptr() as u64,
                ..Default::default()
            });
        }

        let mut reads: Vec<Vec<u32>> = read_specs
            .iter()
            .map(|&(_, count)| vec![0u32; count])
            .collect();
        for (dst, &(offset, count)) in reads.iter_mut().zip(read_specs.iter()) {
            reqs.push(mpp_request {
                cmd: MPP_CMD_SET_REG_READ,
                size: (count * size_of::<u32>()) as u32,
                offset,
                data_ptr: dst.as_mut_ptr() as u64,
                ..Default::default()
            });
        }

        self.send(&mut reqs)
            .map_err(|e| ChannelError::Rejected(e.to_string()))?;
        self.pending.push_back(reads);

        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Vec<u32>>, ChannelError> {
        let reads = self
            .pending
            .pop_front()
            .ok_or(ChannelError::NothingPending)?;

        let mut req = [mpp_request {
            cmd: MPP_CMD_POLL_HW_FINISH,
            ..Default::default()
        }];
        self.send(&mut req)?;

        Ok(reads)
    }

    fn reset(&mut self) -> Result<(), ChannelError> {
        self.pending.clear();
        let mut req = [mpp_request {
            cmd: MPP_CMD_RESET_SESSION,
            ..Default::default()
        }];
        self.send(&mut req)?;
        log::debug!("Reset {:?} session", self.client);

        Ok(())
    }
}

/// Linux system with the `mpp_service` driver and a DMA heap.
pub struct MppPlatform {
    pub service_path: PathBuf,
    pub heap_path: PathBuf,
    pub scratch: Option<ScratchMemory>,
}

impl Default for MppPlatform {
    fn default() -> Self {
        Self {
            service_path: MPP_SERVICE_PATH.into(),
            heap_path: crate::buffer::dma_heap::SYSTEM_UNCACHED_HEAP.into(),
            scratch: None,
        }
    }
}

impl Platform for MppPlatform {
    fn open_channel(&self, client: ClientType) -> Result<Box<dyn DeviceChannel>, ChannelError> {
        Ok(Box::new(MppServiceChannel::open(&self.service_path, client)?))
    }

    fn allocator(&self) -> Result<Box<dyn Allocator>, AllocError> {
        Ok(Box::new(DmaHeapAllocator::open(&self.heap_path)?))
    }

    fn scratch(&self) -> Option<ScratchMemory> {
        self.scratch
    }
}

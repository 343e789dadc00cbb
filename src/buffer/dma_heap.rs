// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocator backed by a Linux DMA heap (`/dev/dma_heap/*`).
//!
//! Each allocation is a dma-buf whose file descriptor doubles as the handle programmed into the
//! decoder registers; the kernel register channel translates it into a device address.

use std::fs::File;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;

use nix::errno::Errno;
use nix::ioctl_readwrite;
use nix::libc;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;

use super::AllocError;
use super::Allocator;
use super::DeviceMemory;

pub const SYSTEM_HEAP: &str = "/dev/dma_heap/system";
pub const SYSTEM_UNCACHED_HEAP: &str = "/dev/dma_heap/system-uncached";

// Defined in include/uapi/linux/dma-heap.h
const DMA_HEAP_IOC_MAGIC: u8 = b'H';
const DMA_HEAP_IOCTL_ALLOC: u8 = 0x0;
#[repr(C)]
#[derive(Default)]
struct dma_heap_allocation_data {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}
ioctl_readwrite!(
    dma_heap_ioctl_alloc,
    DMA_HEAP_IOC_MAGIC,
    DMA_HEAP_IOCTL_ALLOC,
    dma_heap_allocation_data
);

// UNSAFE: the mapping is created from a dma-buf we own and unmapped before the fd is closed, so
// the slices handed out never outlive the memory they point to.
struct DmaHeapMemory {
    fd: OwnedFd,
    addr: NonNull<libc::c_void>,
    len: usize,
}

impl DeviceMemory for DmaHeapMemory {
    fn handle(&self) -> u32 {
        self.fd.as_raw_fd() as u32
    }

    fn size(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr.as_ptr() as *const u8, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.addr.as_ptr() as *mut u8, self.len) }
    }
}

impl Drop for DmaHeapMemory {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.addr, self.len) } {
            log::error!("Failed to unmap dma-buf {}: {}", self.fd.as_raw_fd(), e);
        }
    }
}

pub struct DmaHeapAllocator {
    heap: File,
}

impl DmaHeapAllocator {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AllocError> {
        let heap = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| {
                AllocError::Io(Errno::from_raw(e.raw_os_error().unwrap_or(libc::ENODEV)))
            })?;

        Ok(Self { heap })
    }
}

impl Allocator for DmaHeapAllocator {
    fn allocate(&mut self, size: usize) -> Result<Box<dyn DeviceMemory>, AllocError> {
        let len = NonZeroUsize::new(size).ok_or(AllocError::ZeroSize)?;

        let mut data = dma_heap_allocation_data {
            len: size as u64,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            ..Default::default()
        };
        loop {
            // SAFETY: `heap` is an open dma-heap and `data` a valid allocation request.
            match unsafe { dma_heap_ioctl_alloc(self.heap.as_raw_fd(), &mut data) } {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::ENOMEM) => return Err(AllocError::OutOfMemory(size)),
                Err(e) => return Err(e.into()),
            }
        }

        // SAFETY: on success the kernel returned a new dma-buf fd that nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(data.fd as i32) };

        // SAFETY: mapping a dma-buf we own over its whole length.
        let addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };

        Ok(Box::new(DmaHeapMemory {
            fd,
            addr,
            len: size,
        }))
    }
}

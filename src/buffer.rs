// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device-visible memory used by the decoder besides the frames themselves: parameter tables,
//! row/column working buffers and motion vector stores.
//!
//! Allocations come from an [`Allocator`] and are handed out by a [`BufferGroup`] as
//! [`DeviceBuffer`]s, which return to the group when dropped so later requests of the same
//! purpose and size can reuse them.

#[cfg(feature = "mpp")]
pub mod dma_heap;
pub mod heap;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::rc::Weak;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("cannot allocate an empty buffer")]
    ZeroSize,
    #[error("out of device memory while allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("allocation failed: {0}")]
    Io(#[from] nix::Error),
}

/// What a buffer is used for. Buffers are only recycled within the same purpose.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufferPurpose {
    /// Packed parameter headers, reference sets and scaling lists.
    Tables,
    /// Row/column working buffers.
    Auxiliary,
    /// Co-located motion vector stores.
    MotionVectors,
}

/// One chunk of device-visible memory.
pub trait DeviceMemory {
    /// Handle the device uses to refer to this memory in registers.
    fn handle(&self) -> u32;
    fn size(&self) -> usize;
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// Source of [`DeviceMemory`]. The returned memory must be zero-filled.
pub trait Allocator {
    fn allocate(&mut self, size: usize) -> Result<Box<dyn DeviceMemory>, AllocError>;
}

struct GroupInner {
    allocator: Box<dyn Allocator>,
    free: BTreeMap<(BufferPurpose, usize), VecDeque<Box<dyn DeviceMemory>>>,
    outstanding: usize,
}

/// A buffer obtained from a [`BufferGroup`].
///
/// The buffer is returned to its group upon dropping, provided the group still exists.
pub struct DeviceBuffer {
    mem: Option<Box<dyn DeviceMemory>>,
    purpose: BufferPurpose,
    group: Weak<RefCell<GroupInner>>,
}

impl DeviceBuffer {
    fn mem(&self) -> &dyn DeviceMemory {
        // `mem` is `Some` until the buffer is dropped.
        match &self.mem {
            Some(mem) => mem.as_ref(),
            None => unreachable!(),
        }
    }

    pub fn handle(&self) -> u32 {
        self.mem().handle()
    }

    pub fn size(&self) -> usize {
        self.mem().size()
    }

    pub fn purpose(&self) -> BufferPurpose {
        self.purpose
    }

    pub fn map(&self) -> &[u8] {
        self.mem().as_slice()
    }

    pub fn map_mut(&mut self) -> &mut [u8] {
        match &mut self.mem {
            Some(mem) => mem.as_mut_slice(),
            None => unreachable!(),
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.handle())
            .field("size", &self.size())
            .field("purpose", &self.purpose)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        let Some(mut mem) = self.mem.take() else {
            return;
        };

        if let Some(group) = self.group.upgrade() {
            let mut group = group.borrow_mut();
            group.outstanding -= 1;
            mem.as_mut_slice().fill(0);
            group
                .free
                .entry((self.purpose, mem.size()))
                .or_default()
                .push_back(mem);
            return;
        }

        log::debug!(
            "Dropping buffer {} ({} bytes) of a closed group",
            mem.handle(),
            mem.size()
        );
    }
}

/// Recycling pool of device buffers, one per decoding session.
///
/// Cloning the group gives another reference to the same pool. Dropping the last reference frees
/// every idle allocation; buffers still held elsewhere are freed when they are dropped.
#[derive(Clone)]
pub struct BufferGroup {
    inner: Rc<RefCell<GroupInner>>,
}

impl BufferGroup {
    pub fn new(allocator: Box<dyn Allocator>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(GroupInner {
                allocator,
                free: Default::default(),
                outstanding: 0,
            })),
        }
    }

    /// Gets a zero-filled buffer of exactly `size` bytes for `purpose`, reusing an idle one if
    /// possible.
    pub fn get(&self, purpose: BufferPurpose, size: usize) -> Result<DeviceBuffer, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let mut inner = self.inner.borrow_mut();
        let recycled = inner
            .free
            .get_mut(&(purpose, size))
            .and_then(|list| list.pop_front());

        let mem = match recycled {
            Some(mem) => mem,
            None => {
                let mem = inner.allocator.allocate(size)?;
                log::debug!(
                    "Allocated {:?} buffer {} of {} bytes",
                    purpose,
                    mem.handle(),
                    size
                );
                mem
            }
        };
        inner.outstanding += 1;

        Ok(DeviceBuffer {
            mem: Some(mem),
            purpose,
            group: Rc::downgrade(&self.inner),
        })
    }

    /// Number of idle allocations kept for reuse.
    pub fn num_free(&self) -> usize {
        self.inner.borrow().free.values().map(VecDeque::len).sum()
    }

    /// Number of buffers currently handed out.
    pub fn num_outstanding(&self) -> usize {
        self.inner.borrow().outstanding
    }

    /// Frees every idle allocation.
    pub fn trim(&self) {
        self.inner.borrow_mut().free.clear();
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-memory allocator, for platforms where the device shares the CPU address space with no
//! IOMMU restrictions and for running the pipeline without hardware.

use std::cell::Cell;
use std::rc::Rc;

use super::AllocError;
use super::Allocator;
use super::DeviceMemory;

struct HeapMemory {
    handle: u32,
    data: Vec<u8>,
    in_use: Rc<Cell<usize>>,
}

impl DeviceMemory for HeapMemory {
    fn handle(&self) -> u32 {
        self.handle
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        self.in_use.set(self.in_use.get() - self.data.len());
    }
}

/// Allocates zeroed vectors and numbers them with increasing handles.
///
/// An optional byte budget makes allocations fail once the live total would exceed it.
pub struct HeapAllocator {
    next_handle: u32,
    budget: Option<usize>,
    in_use: Rc<Cell<usize>>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            budget: None,
            in_use: Default::default(),
        }
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new()
        }
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for HeapAllocator {
    fn allocate(&mut self, size: usize) -> Result<Box<dyn DeviceMemory>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if let Some(budget) = self.budget {
            if self.in_use.get() + size > budget {
                return Err(AllocError::OutOfMemory(size));
            }
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        self.in_use.set(self.in_use.get() + size);

        Ok(Box::new(HeapMemory {
            handle,
            data: vec![0; size],
            in_use: Rc::clone(&self.in_use),
        }))
    }
}

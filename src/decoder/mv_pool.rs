// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Co-located motion vector stores, one per frame slot.
//!
//! The hardware writes the motion vectors of each decoded picture to the store of its output
//! slot and reads them back when the picture is used as a temporal reference. The pool grows with
//! the frame slot pool; growing it or changing the store size drops every store before binding
//! new ones, so no register set ever mixes stores from two sizings.

use crate::buffer::AllocError;
use crate::buffer::BufferGroup;
use crate::buffer::BufferPurpose;
use crate::buffer::DeviceBuffer;

#[derive(Default)]
pub struct MvPool {
    store_size: usize,
    stores: Vec<DeviceBuffer>,
}

impl MvPool {
    /// Makes sure `count` stores of `store_size` bytes exist. Returns whether the pool was
    /// reallocated.
    pub fn ensure(
        &mut self,
        count: usize,
        store_size: usize,
        group: &BufferGroup,
    ) -> Result<bool, AllocError> {
        if store_size == self.store_size && count <= self.stores.len() {
            return Ok(false);
        }

        log::debug!(
            "Reallocating motion vector pool: {} x {} bytes -> {} x {} bytes",
            self.stores.len(),
            self.store_size,
            count,
            store_size
        );

        self.stores.clear();
        self.store_size = 0;

        let mut stores = Vec::with_capacity(count);
        for _ in 0..count {
            stores.push(group.get(BufferPurpose::MotionVectors, store_size)?);
        }
        self.stores = stores;
        self.store_size = store_size;

        Ok(true)
    }

    /// Handle of the store attached to frame slot `index`.
    pub fn handle(&self, index: usize) -> Option<u32> {
        self.stores.get(index).map(DeviceBuffer::handle)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn store_size(&self) -> usize {
        self.store_size
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register-set slots: the in-flight task contexts of a backend.

use crate::buffer::DeviceBuffer;
use crate::device::RegOp;

/// One reusable register image and the buffers it points to.
pub struct RegisterSet<R> {
    pub regs: R,
    /// Per-slot parameter tables.
    pub tables: Option<DeviceBuffer>,
    /// Address offset patches to apply on submission.
    pub patches: Vec<RegOp>,
    /// The task bound to this set must not reach the hardware.
    pub skip: bool,
    valid: bool,
}

/// Fixed set of interchangeable register sets.
///
/// A set is valid from the moment a task acquires it until the task's completion releases it. At
/// most `len()` sets can be valid at once.
pub struct RegisterSetSlots<R> {
    sets: Vec<RegisterSet<R>>,
}

impl<R: Default> RegisterSetSlots<R> {
    pub fn new(count: usize) -> Self {
        Self {
            sets: (0..count)
                .map(|_| RegisterSet {
                    regs: R::default(),
                    tables: None,
                    patches: Vec::new(),
                    skip: false,
                    valid: false,
                })
                .collect(),
        }
    }
}

impl<R> RegisterSetSlots<R> {
    /// Marks the first free set as valid and returns its index.
    pub fn acquire(&mut self) -> Option<usize> {
        let (index, set) = self.sets.iter_mut().enumerate().find(|(_, s)| !s.valid)?;
        set.valid = true;
        set.skip = false;
        set.patches.clear();
        Some(index)
    }

    /// Frees set `index`. Returns whether it was valid.
    pub fn release(&mut self, index: usize) -> bool {
        match self.sets.get_mut(index) {
            Some(set) => std::mem::replace(&mut set.valid, false),
            None => false,
        }
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.sets.get(index).is_some_and(|s| s.valid)
    }

    pub fn get(&self, index: usize) -> Option<&RegisterSet<R>> {
        self.sets.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RegisterSet<R>> {
        self.sets.get_mut(index)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegisterSet<R>> {
        self.sets.iter_mut()
    }

    pub fn num_valid(&self) -> usize {
        self.sets.iter().filter(|s| s.valid).count()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

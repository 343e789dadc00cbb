// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recording channel and platform used to run the pipeline without hardware.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::buffer::heap::HeapAllocator;
use crate::buffer::AllocError;
use crate::buffer::Allocator;
use crate::device::ChannelError;
use crate::device::ClientType;
use crate::device::DeviceChannel;
use crate::device::Platform;
use crate::device::RegBatch;
use crate::device::ScratchMemory;

/// Scripted outcome of one poll.
pub(crate) enum PollScript {
    Status(Vec<Vec<u32>>),
    Timeout,
}

/// Everything the dummy channels of a test have seen, plus their scripted behavior.
#[derive(Default)]
pub(crate) struct ChannelLog {
    pub submitted: Vec<RegBatch>,
    pub polls: usize,
    pub resets: usize,
    pub flushes: usize,
    pub opened: Vec<ClientType>,
    pub closed: usize,
    /// Outcomes of the next polls, consumed in order.
    pub script: VecDeque<PollScript>,
    /// Words returned for reads at a given offset when no script is queued.
    pub default_reads: HashMap<u32, Vec<u32>>,
    pub reject_submits: bool,
}

pub(crate) type SharedLog = Rc<RefCell<ChannelLog>>;

pub(crate) struct DummyChannel {
    log: SharedLog,
    pending: VecDeque<RegBatch>,
}

impl DummyChannel {
    pub(crate) fn new(log: SharedLog) -> Self {
        Self {
            log,
            pending: VecDeque::new(),
        }
    }
}

impl DeviceChannel for DummyChannel {
    fn submit(&mut self, batch: RegBatch) -> Result<(), ChannelError> {
        let mut log = self.log.borrow_mut();
        if log.reject_submits {
            return Err(ChannelError::Rejected("scripted rejection".into()));
        }

        log.submitted.push(batch.clone());
        self.pending.push_back(batch);
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Vec<u32>>, ChannelError> {
        let batch = self.pending.pop_front().ok_or(ChannelError::NothingPending)?;
        let mut log = self.log.borrow_mut();
        log.polls += 1;

        match log.script.pop_front() {
            Some(PollScript::Timeout) => Err(ChannelError::Timeout),
            Some(PollScript::Status(blocks)) => Ok(blocks),
            None => Ok(batch
                .reads()
                .map(|(offset, count)| {
                    let mut words = log.default_reads.get(&offset).cloned().unwrap_or_default();
                    words.resize(count, 0);
                    words
                })
                .collect()),
        }
    }

    fn reset(&mut self) -> Result<(), ChannelError> {
        self.pending.clear();
        self.log.borrow_mut().resets += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ChannelError> {
        self.log.borrow_mut().flushes += 1;
        Ok(())
    }
}

impl Drop for DummyChannel {
    fn drop(&mut self) {
        self.log.borrow_mut().closed += 1;
    }
}

/// Platform handing out [`DummyChannel`]s sharing one log and budgeted heap allocators.
#[derive(Default)]
pub(crate) struct DummyPlatform {
    pub log: SharedLog,
    /// Clients whose channel fails to open.
    pub failing_clients: Vec<ClientType>,
    /// Byte budget of each allocator.
    pub budget: Option<usize>,
    pub scratch: Option<ScratchMemory>,
}

impl Platform for DummyPlatform {
    fn open_channel(&self, client: ClientType) -> Result<Box<dyn DeviceChannel>, ChannelError> {
        if self.failing_clients.contains(&client) {
            return Err(ChannelError::Io(nix::Error::ENODEV));
        }
        self.log.borrow_mut().opened.push(client);
        Ok(Box::new(DummyChannel::new(Rc::clone(&self.log))))
    }

    fn allocator(&self) -> Result<Box<dyn Allocator>, AllocError> {
        Ok(Box::new(match self.budget {
            Some(budget) => HeapAllocator::with_budget(budget),
            None => HeapAllocator::new(),
        }))
    }

    fn scratch(&self) -> Option<ScratchMemory> {
        self.scratch
    }
}

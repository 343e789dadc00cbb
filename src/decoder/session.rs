// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A decoding session: one bound backend and the resources lent to it.

use std::rc::Rc;

use anyhow::anyhow;

use crate::decoder::registry::instantiate;
use crate::decoder::registry::AcceleratorDescriptor;
use crate::decoder::registry::Registry;
use crate::decoder::Backend;
use crate::decoder::BackendEnv;
use crate::decoder::BackendError;
use crate::decoder::BackendResult;
use crate::decoder::CompletionCallback;
use crate::decoder::CompletionReport;
use crate::decoder::ControlCmd;
use crate::decoder::HalConfig;
use crate::decoder::HwCaps;
use crate::decoder::Task;
use crate::device::Platform;
use crate::CodingStandard;

/// Session opened by [`Registry::open`].
///
/// The session owns the device channel and the buffer group of its backend. Dropping it releases
/// both once every buffer handed out has come back.
pub struct Session {
    registry: Rc<Registry>,
    descriptor: &'static AcceleratorDescriptor,
    caps: HwCaps,
    platform: Rc<dyn Platform>,
    backend: Box<dyn Backend>,
    env: BackendEnv,
    callback: Option<CompletionCallback>,
    /// Last accepted `SetFrameInfo`, replayed when the backend is replaced.
    frame_info: Option<ControlCmd>,
}

impl Session {
    pub(crate) fn new(
        registry: Rc<Registry>,
        descriptor: &'static AcceleratorDescriptor,
        caps: HwCaps,
        platform: Rc<dyn Platform>,
        backend: Box<dyn Backend>,
        env: BackendEnv,
    ) -> Self {
        Self {
            registry,
            descriptor,
            caps,
            platform,
            backend,
            env,
            callback: None,
            frame_info: None,
        }
    }

    /// Descriptor of the bound backend.
    pub fn descriptor(&self) -> &'static AcceleratorDescriptor {
        self.descriptor
    }

    pub fn config(&self) -> &HalConfig {
        &self.env.config
    }

    pub fn tasks_in_flight(&self) -> usize {
        self.backend.tasks_in_flight()
    }

    /// Sets the function receiving the [`CompletionReport`] of every task.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&CompletionReport) + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Generates the registers of `task`.
    ///
    /// If the task is of another coding standard than the session, the backend is first replaced
    /// by one decoding that standard on the same hardware family.
    pub fn generate_registers(&mut self, task: &mut Task) -> BackendResult<()> {
        let standard = task.syntax.standard();
        if standard != self.descriptor.standard {
            self.redispatch(standard)?;
        }
        self.backend.generate_registers(task, &mut self.env)
    }

    pub fn start(&mut self, task: &mut Task) -> BackendResult<()> {
        self.backend.start(task, &mut self.env)
    }

    /// Waits for `task` and passes its report to the session callback.
    pub fn wait(&mut self, task: &mut Task) -> BackendResult<()> {
        let Self {
            backend,
            env,
            callback,
            ..
        } = self;
        backend.wait(task, env, &mut |report| {
            if let Some(callback) = callback.as_mut() {
                callback(report);
            }
        })
    }

    pub fn reset(&mut self) -> BackendResult<()> {
        self.backend.reset(&mut self.env)
    }

    pub fn flush(&mut self) -> BackendResult<()> {
        self.backend.flush(&mut self.env)
    }

    pub fn control(&mut self, cmd: ControlCmd) -> BackendResult<()> {
        self.backend.control(cmd.clone(), &mut self.env)?;
        if let ControlCmd::SetFrameInfo { .. } = cmd {
            self.frame_info = Some(cmd);
        }
        Ok(())
    }

    /// Replaces the backend by a sibling of the same family decoding `standard`.
    ///
    /// The frame info given to the old backend is replayed on the new one. The current backend and
    /// the frame alignment are kept if no sibling initializes.
    fn redispatch(&mut self, standard: CodingStandard) -> BackendResult<()> {
        if self.backend.tasks_in_flight() > 0 {
            return Err(BackendError::LayoutBusy);
        }

        let family = self.descriptor.generation.family();
        let siblings: Vec<_> = self
            .registry
            .candidates(standard, Some(self.descriptor.generation), self.caps)
            .into_iter()
            .filter(|d| d.generation.family() == family)
            .collect();
        if siblings.is_empty() {
            return Err(BackendError::WrongStandard(standard));
        }

        let alignment = self.env.frames.borrow().alignment();
        for descriptor in siblings {
            let (mut backend, mut env) = match instantiate(
                descriptor,
                self.platform.as_ref(),
                &self.env.frames,
                &self.env.config,
            ) {
                Ok(bound) => bound,
                Err(e) => {
                    log::debug!("{} failed to initialize: {:#}", descriptor.name, e);
                    continue;
                }
            };
            if let Some(cmd) = &self.frame_info {
                if let Err(e) = backend.control(cmd.clone(), &mut env) {
                    log::debug!("{} refused the frame info: {}", descriptor.name, e);
                    continue;
                }
            }

            log::debug!(
                "Stream switched to {}, replacing {} with {}",
                standard,
                self.descriptor.name,
                descriptor.name
            );
            self.backend = backend;
            self.env = env;
            self.descriptor = descriptor;
            return Ok(());
        }

        self.env.frames.borrow_mut().set_alignment(alignment);
        Err(BackendError::Other(anyhow!(
            "no {} backend of the {:?} family could be opened",
            standard,
            family
        )))
    }
}

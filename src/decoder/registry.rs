// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accelerator descriptors and the dispatch picking one of them when a session is opened.
//!
//! A [`Registry`] is built once for the running SoC, usually with [`Registry::with_builtin`], and
//! shared by every session. [`Registry::open`] walks the candidates for a coding standard in
//! priority order and binds the first backend that initializes.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::buffer::BufferGroup;
use crate::decoder::h264;
use crate::decoder::h265;
use crate::decoder::session::Session;
use crate::decoder::Backend;
use crate::decoder::BackendEnv;
use crate::decoder::HalConfig;
use crate::decoder::HwCaps;
use crate::decoder::HwGeneration;
use crate::decoder::SocVariant;
use crate::device::ClientType;
use crate::device::Platform;
use crate::frame::SharedFrameSlots;
use crate::CodingStandard;

/// Maximum number of descriptors registered for one coding standard.
pub const MAX_PER_STANDARD: usize = 2;

/// Generations tried for every standard when none is forced, best first.
const PRIORITY: [HwGeneration; 2] = [HwGeneration::Vdpu34x, HwGeneration::Rkv];

/// Every descriptor built into the crate.
pub static BUILTIN: [&AcceleratorDescriptor; 4] = [
    &h264::vdpu34x::DESCRIPTOR,
    &h264::rkv::DESCRIPTOR,
    &h265::vdpu34x::DESCRIPTOR,
    &h265::rkv::DESCRIPTOR,
];

/// One (coding standard, hardware generation) pair that can be instantiated.
pub struct AcceleratorDescriptor {
    pub name: &'static str,
    pub standard: CodingStandard,
    pub generation: HwGeneration,
    /// Hardware client the device channel must be attached to.
    pub client: ClientType,
    /// SoCs carrying this hardware.
    pub socs: &'static [SocVariant],
    pub create: fn() -> Box<dyn Backend>,
}

impl fmt::Debug for AcceleratorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("{name} does not run on {soc:?}")]
    SocNotSupported { name: &'static str, soc: SocVariant },
    #[error("{0} already has the maximum number of descriptors")]
    StandardFull(CodingStandard),
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("no accelerator decodes {0} on this system")]
    UnsupportedCoding(CodingStandard),
    #[error("every {standard} accelerator failed to initialize (tried {tried:?})")]
    InitFailed {
        standard: CodingStandard,
        tried: Vec<&'static str>,
    },
}

/// Descriptors usable on one SoC.
#[derive(Debug)]
pub struct Registry {
    soc: SocVariant,
    descriptors: Vec<&'static AcceleratorDescriptor>,
}

impl Registry {
    /// Creates an empty registry for `soc`.
    pub fn new(soc: SocVariant) -> Self {
        Self {
            soc,
            descriptors: Vec::new(),
        }
    }

    /// Creates a registry holding every built-in descriptor that runs on `soc`.
    pub fn with_builtin(soc: SocVariant) -> Self {
        let mut registry = Self::new(soc);
        for descriptor in BUILTIN {
            if let Err(e) = registry.register(descriptor) {
                log::debug!("Not registering {}: {}", descriptor.name, e);
            }
        }
        registry
    }

    pub fn soc(&self) -> SocVariant {
        self.soc
    }

    pub fn register(
        &mut self,
        descriptor: &'static AcceleratorDescriptor,
    ) -> Result<(), RegisterError> {
        if !descriptor.socs.contains(&self.soc) {
            return Err(RegisterError::SocNotSupported {
                name: descriptor.name,
                soc: self.soc,
            });
        }
        if self.descriptors(descriptor.standard).count() >= MAX_PER_STANDARD {
            return Err(RegisterError::StandardFull(descriptor.standard));
        }

        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Registered descriptors for `standard`, in registration order.
    pub fn descriptors(
        &self,
        standard: CodingStandard,
    ) -> impl Iterator<Item = &'static AcceleratorDescriptor> + '_ {
        self.descriptors
            .iter()
            .copied()
            .filter(move |d| d.standard == standard)
    }

    /// Descriptors to try for `standard` on hardware with `caps`, in order: the `forced`
    /// generation if any, then the default priority order.
    pub fn candidates(
        &self,
        standard: CodingStandard,
        forced: Option<HwGeneration>,
        caps: HwCaps,
    ) -> Vec<&'static AcceleratorDescriptor> {
        forced
            .into_iter()
            .chain(PRIORITY.into_iter().filter(|g| Some(*g) != forced))
            .filter(|g| caps.contains(g.caps()))
            .flat_map(|g| self.descriptors(standard).filter(move |d| d.generation == g))
            .collect()
    }

    /// Opens a session decoding `standard`, bound to the first candidate that initializes.
    ///
    /// A failed candidate releases everything it acquired before the next one is tried.
    pub fn open(
        self: &Rc<Self>,
        standard: CodingStandard,
        config: HalConfig,
        caps: HwCaps,
        platform: Rc<dyn Platform>,
        frames: SharedFrameSlots,
    ) -> Result<Session, OpenError> {
        let candidates = self.candidates(standard, config.forced_generation, caps);
        if candidates.is_empty() {
            return Err(OpenError::UnsupportedCoding(standard));
        }

        let mut tried = Vec::new();
        for descriptor in candidates {
            match instantiate(descriptor, platform.as_ref(), &frames, &config) {
                Ok((backend, env)) => {
                    log::debug!("Opened {} session on {}", standard, descriptor.name);
                    return Ok(Session::new(
                        Rc::clone(self),
                        descriptor,
                        caps,
                        platform,
                        backend,
                        env,
                    ));
                }
                Err(e) => {
                    log::debug!("{} failed to initialize: {:#}", descriptor.name, e);
                    tried.push(descriptor.name);
                }
            }
        }

        Err(OpenError::InitFailed { standard, tried })
    }
}

/// Attaches a channel, creates a buffer group and initializes the backend of `descriptor`.
///
/// Everything acquired is dropped with the error if any step fails.
pub(crate) fn instantiate(
    descriptor: &AcceleratorDescriptor,
    platform: &dyn Platform,
    frames: &SharedFrameSlots,
    config: &HalConfig,
) -> anyhow::Result<(Box<dyn Backend>, BackendEnv)> {
    let channel = platform.open_channel(descriptor.client)?;
    let allocator = platform.allocator()?;
    let mut env = BackendEnv {
        channel,
        buffers: BufferGroup::new(allocator),
        frames: Rc::clone(frames),
        config: config.clone(),
        scratch: platform.scratch(),
    };

    let mut backend = (descriptor.create)();
    backend.init(&mut env)?;
    Ok((backend, env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::transcoder::tests::frame_table;
    use crate::device::dummy::DummyPlatform;

    fn names(descriptors: &[&'static AcceleratorDescriptor]) -> Vec<&'static str> {
        descriptors.iter().map(|d| d.name).collect()
    }

    #[test]
    fn registration_limits() {
        let mut registry = Registry::new(SocVariant::Rk3288);
        assert_eq!(
            registry.register(&h264::vdpu34x::DESCRIPTOR),
            Err(RegisterError::SocNotSupported {
                name: "vdpu34x-h264",
                soc: SocVariant::Rk3288
            })
        );

        let mut registry = Registry::new(SocVariant::Rk3588);
        registry.register(&h264::rkv::DESCRIPTOR).unwrap();
        registry.register(&h264::vdpu34x::DESCRIPTOR).unwrap();
        assert_eq!(
            registry.register(&h264::rkv::DESCRIPTOR),
            Err(RegisterError::StandardFull(CodingStandard::H264))
        );
        registry.register(&h265::rkv::DESCRIPTOR).unwrap();
    }

    #[test]
    fn builtin_descriptors_follow_the_soc() {
        let registry = Registry::with_builtin(SocVariant::Rk3288);
        assert_eq!(registry.descriptors(CodingStandard::H264).count(), 0);
        assert_eq!(registry.descriptors(CodingStandard::H265).count(), 1);

        let registry = Registry::with_builtin(SocVariant::Rk3588);
        assert_eq!(registry.descriptors(CodingStandard::H264).count(), 2);
        assert_eq!(registry.descriptors(CodingStandard::H265).count(), 2);
    }

    #[test]
    fn candidate_order() {
        let registry = Registry::with_builtin(SocVariant::Rk3588);
        let caps = SocVariant::Rk3588.caps();

        let default = registry.candidates(CodingStandard::H264, None, caps);
        assert_eq!(names(&default), vec!["vdpu34x-h264", "rkv-h264"]);

        let forced = registry.candidates(CodingStandard::H265, Some(HwGeneration::Rkv), caps);
        assert_eq!(names(&forced), vec!["rkv-h265", "vdpu34x-h265"]);

        let legacy_only = registry.candidates(CodingStandard::H264, None, HwCaps::RKV);
        assert_eq!(names(&legacy_only), vec!["rkv-h264"]);
    }

    #[test]
    fn open_binds_one_backend_wherever_a_descriptor_exists() {
        let _ = env_logger::try_init();
        let socs = [
            SocVariant::Rk3288,
            SocVariant::Rk3328,
            SocVariant::Rk3399,
            SocVariant::Rk3568,
            SocVariant::Rk3588,
        ];
        for soc in socs {
            let registry = Rc::new(Registry::with_builtin(soc));
            for standard in [CodingStandard::H264, CodingStandard::H265] {
                let platform = Rc::new(DummyPlatform::default());
                let result = registry.open(
                    standard,
                    HalConfig::default(),
                    soc.caps(),
                    platform.clone(),
                    frame_table(2),
                );

                let expected = registry.candidates(standard, None, soc.caps());
                match (result, expected.first()) {
                    (Ok(session), Some(first)) => {
                        assert_eq!(session.descriptor().name, first.name);
                        assert_eq!(platform.log.borrow().opened, vec![first.client]);
                    }
                    (Err(OpenError::UnsupportedCoding(s)), None) => assert_eq!(s, standard),
                    (result, _) => panic!("{:?} {}: unexpected {:?}", soc, standard, result.err()),
                }
            }
        }
    }

    #[test]
    fn failed_candidates_are_rolled_back() {
        let _ = env_logger::try_init();
        let registry = Rc::new(Registry::with_builtin(SocVariant::Rk3588));
        // Not even one table page fits.
        let platform = Rc::new(DummyPlatform {
            budget: Some(1024),
            ..Default::default()
        });

        let result = registry.open(
            CodingStandard::H264,
            HalConfig::default(),
            SocVariant::Rk3588.caps(),
            platform.clone(),
            frame_table(2),
        );
        match result {
            Err(OpenError::InitFailed { standard, tried }) => {
                assert_eq!(standard, CodingStandard::H264);
                assert_eq!(tried, vec!["vdpu34x-h264", "rkv-h264"]);
            }
            other => panic!("unexpected {:?}", other.err()),
        }

        let log = platform.log.borrow();
        assert_eq!(log.opened.len(), 2);
        assert_eq!(log.closed, 2);
    }

    #[test]
    fn unavailable_client_falls_back() {
        let registry = Rc::new(Registry::with_builtin(SocVariant::Rk3588));
        let platform = Rc::new(DummyPlatform {
            failing_clients: vec![ClientType::RkvDec],
            ..Default::default()
        });

        // Both H.264 generations use the same client.
        assert!(registry
            .open(
                CodingStandard::H264,
                HalConfig::default(),
                SocVariant::Rk3588.caps(),
                platform.clone(),
                frame_table(2),
            )
            .is_err());

        let session = registry
            .open(
                CodingStandard::H265,
                HalConfig::default(),
                SocVariant::Rk3588.caps(),
                platform,
                frame_table(2),
            )
            .unwrap();
        assert_eq!(session.descriptor().name, "rkv-h265");
    }
}

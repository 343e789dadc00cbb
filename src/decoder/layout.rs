// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sizing of the auxiliary working buffers of the decoder.
//!
//! Some hardware needs external row and column buffers ("RCB") whose size depends on the picture
//! geometry. Each generation describes them as a list of [`RegionFormula`]s; [`compute_layout`]
//! turns that list and a [`LayoutKey`] into an [`AuxLayout`] placing every region inside one
//! allocation. [`AuxBuffers`] caches the layout and its allocations, and only recomputes them
//! when the key changes.

use std::collections::BTreeMap;
use std::rc::Rc;

use enumn::N;

use crate::align_up;
use crate::buffer::AllocError;
use crate::buffer::BufferGroup;
use crate::buffer::BufferPurpose;
use crate::buffer::DeviceBuffer;
use crate::ChromaFormat;
use crate::Resolution;

/// Device DMA granularity.
pub const DMA_ALIGN: usize = 64;
/// Granularity of independently addressed regions and of whole allocations.
pub const PAGE_ALIGN: usize = 4096;

/// Auxiliary regions, numbered in the order their address registers appear.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum RegionId {
    StrmdRow = 0,
    TransdRow = 1,
    TransdCol = 2,
    TransdColUp = 3,
    InterRow = 4,
    InterCol = 5,
    IntraRow = 6,
    DblkRow = 7,
    SaoRow = 8,
    FbcRow = 9,
    FiltCol = 10,
}

pub const NUM_REGIONS: usize = 11;

/// Direction a region scales with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Axis {
    /// One entry per block column of the picture, i.e. scales with the width.
    Row,
    /// One entry per block row of the picture, i.e. scales with the height.
    Column,
}

/// Size formula of one region: `ceil(dimension / unit) * bytes_per_unit`, optionally scaled by
/// bit depth and chroma sampling.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionFormula {
    pub id: RegionId,
    pub axis: Axis,
    /// Block size in pixels.
    pub unit: u32,
    pub bytes_per_unit: usize,
    /// Whether the region stores samples, and therefore grows with bit depth and chroma.
    pub sample_scaled: bool,
    /// Whether the region has its own address register, requiring page alignment.
    pub independent: bool,
}

impl RegionFormula {
    /// Page-aligned region, not scaled by sample format.
    pub const fn new(id: RegionId, axis: Axis, unit: u32, bytes_per_unit: usize) -> Self {
        Self {
            id,
            axis,
            unit,
            bytes_per_unit,
            sample_scaled: false,
            independent: true,
        }
    }

    pub const fn scaled(mut self) -> Self {
        self.sample_scaled = true;
        self
    }

    /// Region placed right after the previous one at DMA alignment instead of on its own page.
    pub const fn packed(mut self) -> Self {
        self.independent = false;
        self
    }
}

/// Inputs of the layout computation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LayoutKey {
    pub resolution: Resolution,
    pub bit_depth: u8,
    pub chroma: ChromaFormat,
    /// Number of register sets that can be in flight.
    pub pipeline_depth: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub size: usize,
}

/// Placement of every region inside one allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuxLayout {
    regions: BTreeMap<RegionId, Region>,
    total_size: usize,
}

impl AuxLayout {
    pub fn region(&self, id: RegionId) -> Option<Region> {
        self.regions.get(&id).copied()
    }

    /// Regions in register order.
    pub fn regions(&self) -> impl Iterator<Item = (RegionId, Region)> + '_ {
        self.regions.iter().map(|(id, r)| (*id, *r))
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

fn region_size(formula: &RegionFormula, key: &LayoutKey) -> usize {
    let dimension = match formula.axis {
        Axis::Row => key.resolution.width,
        Axis::Column => key.resolution.height,
    };
    let mut bytes = dimension.div_ceil(formula.unit) as usize * formula.bytes_per_unit;

    if formula.sample_scaled {
        let (num, den) = key.chroma.sample_ratio();
        bytes = (bytes * usize::from(key.bit_depth)).div_ceil(8);
        bytes = (bytes * num).div_ceil(den);
    }

    align_up(bytes, DMA_ALIGN)
}

/// Places the regions described by `formulas` for `key`.
///
/// Regions are laid out in [`RegionId`] order regardless of the order of `formulas`.
pub fn compute_layout(formulas: &[RegionFormula], key: &LayoutKey) -> AuxLayout {
    let mut sorted = formulas.to_vec();
    sorted.sort_by_key(|f| f.id);

    let mut regions = BTreeMap::new();
    let mut offset = 0;
    for formula in &sorted {
        let size = region_size(formula, key);
        offset = align_up(
            offset,
            if formula.independent {
                PAGE_ALIGN
            } else {
                DMA_ALIGN
            },
        );
        regions.insert(formula.id, Region { offset, size });
        offset += size;
    }

    AuxLayout {
        regions,
        total_size: align_up(offset, PAGE_ALIGN),
    }
}

/// How regions are picked to live in on-chip scratch memory when it cannot hold them all.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScratchPolicy {
    /// Walk a fixed list, stopping at the first region that does not fit.
    PriorityOrder(&'static [RegionId]),
    /// Take regions from the largest down, skipping those that do not fit.
    LargestFirst,
}

impl ScratchPolicy {
    /// Returns the regions moved to a scratch memory of `capacity` bytes, with their offset in it.
    pub fn select(&self, layout: &AuxLayout, capacity: usize) -> Vec<(RegionId, usize)> {
        let mut selected = Vec::new();
        let mut used = 0;

        match self {
            ScratchPolicy::PriorityOrder(order) => {
                for id in order.iter() {
                    let Some(region) = layout.region(*id) else {
                        continue;
                    };
                    if used + region.size > capacity {
                        break;
                    }
                    selected.push((*id, used));
                    used += region.size;
                }
            }
            ScratchPolicy::LargestFirst => {
                let mut candidates: Vec<_> = layout.regions().collect();
                candidates.sort_by(|a, b| b.1.size.cmp(&a.1.size).then(a.0.cmp(&b.0)));
                for (id, region) in candidates {
                    if used + region.size <= capacity {
                        selected.push((id, used));
                        used += region.size;
                    }
                }
            }
        }

        selected
    }
}

/// Auxiliary allocations of a backend, kept in sync with the current [`LayoutKey`].
#[derive(Default)]
pub struct AuxBuffers {
    key: Option<LayoutKey>,
    layout: Option<Rc<AuxLayout>>,
    buffers: Vec<DeviceBuffer>,
    allocations: usize,
}

impl AuxBuffers {
    pub fn needs_refresh(&self, key: &LayoutKey) -> bool {
        self.key.as_ref() != Some(key)
    }

    /// Recomputes the layout for `key` if it changed, freeing the previous buffers before
    /// allocating new ones: one per register set when pipelining, a single shared one otherwise.
    ///
    /// Returns whether anything was reallocated. On failure the cache is left empty.
    pub fn refresh(
        &mut self,
        formulas: &[RegionFormula],
        key: LayoutKey,
        group: &BufferGroup,
    ) -> Result<bool, AllocError> {
        if !self.needs_refresh(&key) {
            return Ok(false);
        }

        self.buffers.clear();
        self.layout = None;
        self.key = None;

        let layout = compute_layout(formulas, &key);
        log::debug!(
            "Auxiliary layout for {} {}-bit {:?}: {} bytes x {}",
            key.resolution,
            key.bit_depth,
            key.chroma,
            layout.total_size(),
            key.pipeline_depth
        );

        if layout.total_size() > 0 {
            for _ in 0..key.pipeline_depth.max(1) {
                let buffer = group.get(BufferPurpose::Auxiliary, layout.total_size())?;
                self.buffers.push(buffer);
                self.allocations += 1;
            }
        }

        self.layout = Some(Rc::new(layout));
        self.key = Some(key);
        Ok(true)
    }

    pub fn layout(&self) -> Option<Rc<AuxLayout>> {
        self.layout.clone()
    }

    /// Buffer bound to register set `slot`.
    pub fn buffer(&self, slot: usize) -> Option<&DeviceBuffer> {
        match self.buffers.len() {
            0 => None,
            1 => self.buffers.first(),
            _ => self.buffers.get(slot),
        }
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Number of buffers allocated since creation.
    pub fn allocations(&self) -> usize {
        self.allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::heap::HeapAllocator;

    const FORMULAS: &[RegionFormula] = &[
        RegionFormula {
            id: RegionId::DblkRow,
            axis: Axis::Row,
            unit: 16,
            bytes_per_unit: 32,
            sample_scaled: true,
            independent: true,
        },
        RegionFormula {
            id: RegionId::IntraRow,
            axis: Axis::Row,
            unit: 16,
            bytes_per_unit: 24,
            sample_scaled: false,
            independent: true,
        },
        RegionFormula {
            id: RegionId::StrmdRow,
            axis: Axis::Row,
            unit: 16,
            bytes_per_unit: 3,
            sample_scaled: false,
            independent: false,
        },
        RegionFormula {
            id: RegionId::InterCol,
            axis: Axis::Column,
            unit: 64,
            bytes_per_unit: 96,
            sample_scaled: false,
            independent: true,
        },
    ];

    fn key_1080p() -> LayoutKey {
        LayoutKey {
            resolution: Resolution::from((1920, 1080)),
            bit_depth: 8,
            chroma: ChromaFormat::Yuv420,
            pipeline_depth: 1,
        }
    }

    #[test]
    fn layout_1080p() {
        let layout = compute_layout(FORMULAS, &key_1080p());

        // 120 macroblock columns.
        let intra = layout.region(RegionId::IntraRow).unwrap();
        assert_eq!(intra.size, 120 * 24);
        assert_eq!(intra.size % DMA_ALIGN, 0);

        // 120 * 32 bytes of 8-bit 4:2:0 samples.
        assert_eq!(layout.region(RegionId::DblkRow).unwrap().size, 5760);
        // 360 bytes rounded up.
        assert_eq!(layout.region(RegionId::StrmdRow).unwrap().size, 384);
        // 17 CTB rows.
        assert_eq!(layout.region(RegionId::InterCol).unwrap().size, 1664);

        assert_eq!(layout.total_size() % PAGE_ALIGN, 0);
        assert!(layout.region(RegionId::FbcRow).is_none());
    }

    #[test]
    fn layout_is_pure_and_ordered() {
        let a = compute_layout(FORMULAS, &key_1080p());
        let mut reversed = FORMULAS.to_vec();
        reversed.reverse();
        let b = compute_layout(&reversed, &key_1080p());
        assert_eq!(a, b);

        let ids: Vec<_> = a.regions().map(|(id, _)| id).collect();
        assert_eq!(
            ids,
            vec![
                RegionId::StrmdRow,
                RegionId::InterCol,
                RegionId::IntraRow,
                RegionId::DblkRow
            ]
        );

        let mut end = 0;
        for (id, region) in a.regions() {
            assert!(region.offset >= end);
            assert_eq!(region.size % DMA_ALIGN, 0);
            if id != RegionId::StrmdRow {
                assert_eq!(region.offset % PAGE_ALIGN, 0);
            }
            end = region.offset + region.size;
        }
        assert!(end <= a.total_size());
    }

    #[test]
    fn sample_scaling() {
        let key = LayoutKey {
            bit_depth: 10,
            chroma: ChromaFormat::Yuv422,
            ..key_1080p()
        };
        let layout = compute_layout(FORMULAS, &key);
        // 3840 bytes at 10 bits, doubled for 4:2:2.
        assert_eq!(layout.region(RegionId::DblkRow).unwrap().size, 9600);
        assert_eq!(layout.region(RegionId::IntraRow).unwrap().size, 2880);
    }

    #[test]
    fn scratch_policies() {
        let layout = compute_layout(FORMULAS, &key_1080p());

        let largest = ScratchPolicy::LargestFirst.select(&layout, 6000);
        assert_eq!(largest, vec![(RegionId::DblkRow, 0)]);

        let largest = ScratchPolicy::LargestFirst.select(&layout, 9000);
        assert_eq!(
            largest,
            vec![(RegionId::DblkRow, 0), (RegionId::IntraRow, 5760)]
        );

        const ORDER: &[RegionId] = &[RegionId::IntraRow, RegionId::DblkRow, RegionId::StrmdRow];
        let priority = ScratchPolicy::PriorityOrder(ORDER).select(&layout, 6000);
        // DblkRow does not fit after IntraRow; the walk stops there.
        assert_eq!(priority, vec![(RegionId::IntraRow, 0)]);

        assert!(ScratchPolicy::LargestFirst.select(&layout, 0).is_empty());
    }

    #[test]
    fn refresh_only_on_change() {
        let group = BufferGroup::new(Box::new(HeapAllocator::new()));
        let mut aux = AuxBuffers::default();

        assert!(aux.refresh(FORMULAS, key_1080p(), &group).unwrap());
        let handle = aux.buffer(0).unwrap().handle();
        assert!(!aux.refresh(FORMULAS, key_1080p(), &group).unwrap());
        assert_eq!(aux.allocations(), 1);
        assert_eq!(aux.buffer(0).unwrap().handle(), handle);
        // Not pipelined: every slot shares the buffer.
        assert_eq!(aux.buffer(2).unwrap().handle(), handle);

        let key = LayoutKey {
            resolution: Resolution::from((3840, 2160)),
            pipeline_depth: 3,
            ..key_1080p()
        };
        assert!(aux.refresh(FORMULAS, key, &group).unwrap());
        assert_eq!(aux.num_buffers(), 3);
        assert_eq!(aux.allocations(), 4);
        assert_ne!(aux.buffer(0).unwrap().handle(), aux.buffer(1).unwrap().handle());
        assert_eq!(group.num_outstanding(), 3);
    }

    #[test]
    fn failed_refresh_leaves_cache_empty() {
        let group = BufferGroup::new(Box::new(HeapAllocator::with_budget(PAGE_ALIGN * 4)));
        let mut aux = AuxBuffers::default();
        let key = LayoutKey {
            pipeline_depth: 3,
            ..key_1080p()
        };

        assert!(aux.refresh(FORMULAS, key, &group).is_err());
        assert!(aux.layout().is_none());
        assert_eq!(aux.num_buffers(), 0);
        assert!(aux.needs_refresh(&key));
        assert_eq!(group.num_outstanding(), 0);
    }
}

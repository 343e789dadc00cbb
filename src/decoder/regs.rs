// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register image helpers.

/// Bit field of a 32-bit register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub shift: u32,
    pub width: u32,
}

impl Field {
    pub const fn new(shift: u32, width: u32) -> Self {
        Self { shift, width }
    }

    pub const fn bit(shift: u32) -> Self {
        Self { shift, width: 1 }
    }

    fn mask(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1 << self.width) - 1
        }
    }
}

/// Contiguous range of registers, written or read as one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterBlock {
    first: u32,
    words: Vec<u32>,
}

impl RegisterBlock {
    /// Block of `count` registers starting at register number `first`.
    pub fn new(first: u32, count: usize) -> Self {
        Self {
            first,
            words: vec![0; count],
        }
    }

    pub fn first(&self) -> u32 {
        self.first
    }

    /// Byte offset of the block in the register file.
    pub fn offset(&self) -> u32 {
        self.first * 4
    }

    pub fn contains(&self, reg: u32) -> bool {
        reg >= self.first && ((reg - self.first) as usize) < self.words.len()
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Words of registers `first..=last`.
    pub fn range(&self, first: u32, last: u32) -> &[u32] {
        &self.words[(first - self.first) as usize..=(last - self.first) as usize]
    }

    pub fn get(&self, reg: u32) -> u32 {
        self.words[(reg - self.first) as usize]
    }

    pub fn set(&mut self, reg: u32, value: u32) {
        self.words[(reg - self.first) as usize] = value;
    }

    pub fn field(&self, reg: u32, field: Field) -> u32 {
        (self.get(reg) >> field.shift) & field.mask()
    }

    /// Sets `field` of `reg`. Values wider than the field are truncated.
    pub fn set_field(&mut self, reg: u32, field: Field, value: u32) {
        let mask = field.mask();
        if value & !mask != 0 {
            log::warn!(
                "Value {:#x} truncated to {} bits in register {}",
                value,
                field.width,
                reg
            );
        }

        let word = &mut self.words[(reg - self.first) as usize];
        *word = (*word & !(mask << field.shift)) | ((value & mask) << field.shift);
    }

    pub fn set_flag(&mut self, reg: u32, field: Field, flag: bool) {
        self.set_field(reg, field, flag as u32);
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Checksum of the block contents, for comparing register dumps.
    pub fn checksum(&self, hasher: &mut crc32fast::Hasher) {
        for word in &self.words {
            hasher.update(&word.to_le_bytes());
        }
    }
}

/// Register image of one hardware generation.
pub trait RegisterImage: Default {
    /// Blocks in the order they are written to the hardware.
    fn blocks(&self) -> Vec<&RegisterBlock>;

    /// Clears the status bits reported by the previous run.
    fn clear_status(&mut self);

    fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for block in self.blocks() {
            block.checksum(&mut hasher);
        }
        hasher.finalize()
    }

    fn dump(&self) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        for block in self.blocks() {
            for (i, word) in block.words().iter().enumerate() {
                log::trace!("reg{:03} {:#010x}", block.first() as usize + i, word);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields() {
        let mut block = RegisterBlock::new(64, 4);
        assert_eq!(block.offset(), 256);
        assert!(block.contains(67));
        assert!(!block.contains(68));
        assert!(!block.contains(63));

        block.set_field(65, Field::new(4, 8), 0xab);
        block.set_flag(65, Field::bit(31), true);
        assert_eq!(block.get(65), 0x8000_0ab0);
        assert_eq!(block.field(65, Field::new(4, 8)), 0xab);

        block.set_field(65, Field::new(4, 8), 0x1cd);
        assert_eq!(block.get(65), 0x8000_0cd0);

        block.set_field(66, Field::new(0, 32), u32::MAX);
        assert_eq!(block.range(65, 66), &[0x8000_0cd0, u32::MAX]);

        block.clear();
        assert!(block.words().iter().all(|&w| w == 0));
    }

    #[test]
    fn checksum_tracks_contents() {
        let mut a = RegisterBlock::new(0, 8);
        let b = RegisterBlock::new(0, 8);
        let sum = |block: &RegisterBlock| {
            let mut hasher = crc32fast::Hasher::new();
            block.checksum(&mut hasher);
            hasher.finalize()
        };
        assert_eq!(sum(&a), sum(&b));
        a.set(3, 1);
        assert_ne!(sum(&a), sum(&b));
    }
}

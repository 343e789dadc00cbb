// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit packing of hardware-parsed headers.
//!
//! Decoder hardware reads its parameter headers as little-endian 64-bit words in which fields are
//! laid out starting from the least significant bit. [`BitPutter`] builds such regions field by
//! field and refuses any value that would not fit its declared width, so a malformed syntax
//! structure cannot silently corrupt neighbouring fields.

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitPutError {
    #[error("invalid bit count {0}")]
    InvalidBitCount(u32),
    #[error("value {value} does not fit in {bits} bits")]
    ValueTooWide { value: i64, bits: u32 },
    #[error("region of {capacity} bits overflowed")]
    Overflow { capacity: usize },
    #[error("destination of {0} bytes is too small")]
    DestinationTooSmall(usize),
}

pub type BitPutResult<T> = std::result::Result<T, BitPutError>;

/// LSB-first bit packer over a fixed-capacity sequence of 64-bit words.
pub struct BitPutter {
    words: Vec<u64>,
    pos: usize,
}

impl BitPutter {
    /// Creates a packer for a region of `capacity_bits` bits, rounded up to whole words.
    pub fn new(capacity_bits: usize) -> Self {
        Self {
            words: vec![0; capacity_bits.div_ceil(64)],
            pos: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.words.len() * 64
    }

    /// Current write position, in bits.
    pub fn bit_pos(&self) -> usize {
        self.pos
    }

    fn put_raw(&mut self, bits: u32, value: u64) -> BitPutResult<()> {
        if bits > 64 {
            return Err(BitPutError::InvalidBitCount(bits));
        }
        if self.pos + bits as usize > self.capacity() {
            return Err(BitPutError::Overflow {
                capacity: self.capacity(),
            });
        }
        if bits == 0 {
            return Ok(());
        }

        let value = if bits == 64 {
            value
        } else {
            value & ((1u64 << bits) - 1)
        };
        let word = self.pos / 64;
        let shift = (self.pos % 64) as u32;

        self.words[word] |= value << shift;
        if shift + bits > 64 {
            self.words[word + 1] |= value >> (64 - shift);
        }

        self.pos += bits as usize;
        Ok(())
    }

    /// Writes an unsigned field of `bits` bits.
    pub fn put_u<T: Into<u64>>(&mut self, bits: u32, value: T) -> BitPutResult<()> {
        let value = value.into();
        if bits < 64 && value >> bits != 0 {
            return Err(BitPutError::ValueTooWide {
                value: value as i64,
                bits,
            });
        }

        self.put_raw(bits, value)
    }

    /// Writes a two's complement field of `bits` bits.
    pub fn put_s<T: Into<i64>>(&mut self, bits: u32, value: T) -> BitPutResult<()> {
        let value = value.into();
        if bits == 0 || bits > 64 {
            return Err(BitPutError::InvalidBitCount(bits));
        }
        if bits < 64 {
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            if value < min || value > max {
                return Err(BitPutError::ValueTooWide { value, bits });
            }
        }

        self.put_raw(bits, value as u64)
    }

    pub fn put_flag(&mut self, flag: bool) -> BitPutResult<()> {
        self.put_raw(1, flag as u64)
    }

    /// Pads with `fill` bits until the position is a multiple of `bits`.
    pub fn align(&mut self, bits: usize, fill: bool) -> BitPutResult<()> {
        if bits == 0 {
            return Err(BitPutError::InvalidBitCount(0));
        }

        let mut remaining = self.pos.next_multiple_of(bits) - self.pos;
        while remaining > 0 {
            let n = remaining.min(64) as u32;
            self.put_raw(n, if fill { u64::MAX } else { 0 })?;
            remaining -= n as usize;
        }

        Ok(())
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Copies the whole region into `dst` as little-endian words and returns the number of bytes
    /// written.
    pub fn write_to(&self, dst: &mut [u8]) -> BitPutResult<usize> {
        let len = self.words.len() * 8;
        if dst.len() < len {
            return Err(BitPutError::DestinationTooSmall(dst.len()));
        }

        LittleEndian::write_u64_into(&self.words, &mut dst[..len]);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsb_first() {
        let mut bp = BitPutter::new(64);
        bp.put_flag(true).unwrap();
        bp.put_u(3, 0b110u8).unwrap();
        bp.put_u(4, 0b1010u8).unwrap();
        assert_eq!(bp.words()[0], 0b1010_110_1);
        assert_eq!(bp.bit_pos(), 8);
    }

    #[test]
    fn straddles_words() {
        let mut bp = BitPutter::new(128);
        bp.put_u(60, 0u64).unwrap();
        bp.put_u(8, 0xabu8).unwrap();
        assert_eq!(bp.words()[0], 0xb << 60);
        assert_eq!(bp.words()[1], 0xa);

        let mut out = [0u8; 16];
        assert_eq!(bp.write_to(&mut out).unwrap(), 16);
        assert_eq!(out[7], 0xb0);
        assert_eq!(out[8], 0x0a);
    }

    #[test]
    fn signed_values() {
        let mut bp = BitPutter::new(64);
        bp.put_s(7, -26i32).unwrap();
        assert_eq!(bp.words()[0], 0b1100110);
        assert_eq!(
            bp.put_s(4, 8i32),
            Err(BitPutError::ValueTooWide { value: 8, bits: 4 })
        );
        bp.put_s(4, -8i32).unwrap();
        assert_eq!(bp.words()[0] >> 7, 0b1000);
    }

    #[test]
    fn rejects_wide_values() {
        let mut bp = BitPutter::new(64);
        assert_eq!(
            bp.put_u(9, 512u32),
            Err(BitPutError::ValueTooWide { value: 512, bits: 9 })
        );
        assert_eq!(bp.put_u(65, 1u32), Err(BitPutError::InvalidBitCount(65)));
        assert_eq!(bp.bit_pos(), 0);
    }

    #[test]
    fn align_and_overflow() {
        let mut bp = BitPutter::new(128);
        bp.put_u(5, 1u8).unwrap();
        bp.align(64, true).unwrap();
        assert_eq!(bp.bit_pos(), 64);
        assert_eq!(bp.words()[0], !0u64 << 5 | 1);

        bp.align(64, false).unwrap();
        assert_eq!(bp.bit_pos(), 64);

        bp.put_u(64, 0u64).unwrap();
        assert_eq!(
            bp.put_flag(false),
            Err(BitPutError::Overflow { capacity: 128 })
        );
    }
}

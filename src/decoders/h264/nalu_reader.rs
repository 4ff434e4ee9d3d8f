// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use anyhow::anyhow;
use anyhow::Result;
use bytes::Buf;

/// A bit reader for h264 bitstreams. It properly handles emulation-prevention
/// bytes and stop bits.
pub struct NaluReader<T> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<T>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// Used in epb detection.
    prev_two_bytes: u32,
    /// Number of epbs (i.e. 0x000003) we found.
    num_epb: usize,
    /// Number of RBSP bits consumed so far, epbs excluded.
    num_bits_read: usize,
}

/// Saved position of a `NaluReader`, used to implement look-ahead.
struct ReaderState {
    position: u64,
    curr_byte: u32,
    num_remaining_bits_in_curr_byte: usize,
    prev_two_bytes: u32,
    num_epb: usize,
    num_bits_read: usize,
}

impl<T: AsRef<[u8]>> NaluReader<T> {
    pub fn new(data: T) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
            num_bits_read: Default::default(),
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool> {
        let bit: u32 = self.read_bits(1)?;
        Ok(bit == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U> {
        if num_bits > 31 {
            return Err(anyhow!("Overflow: more than 31 bits requested at once"));
        }

        let mut bits_left = num_bits;
        let mut out = 0;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;
        self.num_bits_read += num_bits;

        U::try_from(out).map_err(|_| anyhow!("Conversion failed"))
    }

    /// Read up to 32 bits from the stream, as needed by the VUI timing and
    /// the HRD delay fields.
    pub fn read_bits_u32(&mut self, num_bits: usize) -> Result<u32> {
        match num_bits {
            0..=31 => self.read_bits(num_bits),
            32 => {
                let high = self.read_bits::<u32>(16)?;
                let low = self.read_bits::<u32>(16)?;
                Ok((high << 16) | low)
            }
            _ => Err(anyhow!("Overflow: more than 32 bits requested at once")),
        }
    }

    /// Skip up to 31 bits from the stream.
    pub fn skip_bits(&mut self, num_bits: usize) -> Result<()> {
        self.read_bits::<u32>(num_bits)?;
        Ok(())
    }

    /// Returns the next `num_bits` bits without consuming them.
    pub fn next_bits(&mut self, num_bits: usize) -> Result<u32> {
        let state = self.save();
        let bits = self.read_bits(num_bits);
        self.restore(state);
        bits
    }

    /// Whether the reader sits on a byte boundary.
    pub fn is_byte_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte % 8 == 0
    }

    /// Skips to the next byte boundary. Does nothing if already aligned.
    pub fn byte_align(&mut self) -> Result<()> {
        let pad = self.num_remaining_bits_in_curr_byte % 8;
        self.skip_bits(pad)
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the number of RBSP bits consumed so far.
    pub fn num_bits_read(&self) -> usize {
        self.num_bits_read
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data().
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            // no more data at all in the rbsp
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        if self.data.chunk().iter().any(|b| *b != 0) {
            return true;
        }

        self.data.advance(self.data.remaining());
        false
    }

    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> Result<U> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 31 {
                return Err(anyhow!("Invalid stream: Exp-Golomb prefix too long"));
            }
        }

        // 2^31 - 1 + a 31 bit suffix still fits in 32 bits.
        let prefix: u32 = (1u32 << num_bits) - 1;
        let value = if num_bits > 0 {
            prefix + self.read_bits::<u32>(num_bits)?
        } else {
            prefix
        };

        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> Result<U> {
        let ue = self.read_ue()?;
        if ue > max {
            Err(anyhow!(
                "Value out of bounds: expected at most {}, got {}",
                max,
                ue
            ))
        } else {
            Ok(U::try_from(ue).map_err(|_| anyhow!("Conversion error"))?)
        }
    }

    pub fn read_se<U: TryFrom<i32>>(&mut self) -> Result<U> {
        let code_num = i64::from(self.read_ue::<u32>()?);

        let value = if code_num % 2 == 0 {
            -(code_num / 2)
        } else {
            code_num / 2 + 1
        };

        let value = i32::try_from(value).map_err(|_| anyhow!("Signed value out of range"))?;
        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> Result<U> {
        let se = self.read_se()?;
        if se < min || se > max {
            Err(anyhow!(
                "Value out of bounds, expected between {}-{}, got {}",
                min,
                max,
                se
            ))
        } else {
            Ok(U::try_from(se).map_err(|_| anyhow!("Conversion error"))?)
        }
    }

    fn save(&self) -> ReaderState {
        ReaderState {
            position: self.data.position(),
            curr_byte: self.curr_byte,
            num_remaining_bits_in_curr_byte: self.num_remaining_bits_in_curr_byte,
            prev_two_bytes: self.prev_two_bytes,
            num_epb: self.num_epb,
            num_bits_read: self.num_bits_read,
        }
    }

    fn restore(&mut self, state: ReaderState) {
        self.data.set_position(state.position);
        self.curr_byte = state.curr_byte;
        self.num_remaining_bits_in_curr_byte = state.num_remaining_bits_in_curr_byte;
        self.prev_two_bytes = state.prev_two_bytes;
        self.num_epb = state.num_epb;
        self.num_bits_read = state.num_bits_read;
    }

    fn get_byte(&mut self) -> Result<u8> {
        if self.data.remaining() == 0 {
            return Err(anyhow!("Reader ran out of bits"));
        }

        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> Result<()> {
        let mut byte = self.get_byte()?;

        if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            // We found an epb
            self.num_epb += 1;
            // Read another byte
            byte = self.get_byte()?;
            // We need another 3 bytes before another epb can happen.
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);

        self.curr_byte = u32::from(byte);
        Ok(())
    }
}

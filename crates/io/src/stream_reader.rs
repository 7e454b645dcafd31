//! Bounds-checked reader over an in-memory byte stream.
//!
//! Every read validates the remaining length before touching the buffer, so
//! truncated or corrupted input surfaces as [`IoError::EndOfStream`] rather
//! than a panic.

use crate::error::{IoError, IoResult};
use std::convert::TryInto;

/// A reader for decoding little-endian data from a byte slice.
pub struct StreamReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    /// Creates a new reader over the given data.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Gets the current position in the reader.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Gets the total length of the underlying data.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether the underlying data is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Sets the position in the reader.
    pub fn set_position(&mut self, position: usize) -> IoResult<()> {
        if position > self.data.len() {
            return Err(IoError::stream_position(position, self.data.len()));
        }
        self.pos = position;
        Ok(())
    }

    /// Ensures that there are enough bytes remaining to read the specified amount.
    fn ensure(&self, amount: usize) -> IoResult<()> {
        if self.pos + amount > self.data.len() {
            return Err(IoError::end_of_stream(amount, "stream reader"));
        }
        Ok(())
    }

    /// Peeks at the next byte without advancing the position.
    pub fn peek(&self) -> IoResult<u8> {
        self.ensure(1)?;
        Ok(self.data[self.pos])
    }

    /// Reads an unsigned byte.
    pub fn read_u8(&mut self) -> IoResult<u8> {
        self.ensure(1)?;
        let result = self.data[self.pos];
        self.pos += 1;
        Ok(result)
    }

    /// Reads a boolean value; anything other than 0 or 1 is rejected.
    pub fn read_bool(&mut self) -> IoResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(IoError::invalid_data(
                "read_bool".to_string(),
                other.to_string(),
            )),
        }
    }

    /// Reads a 16-bit unsigned integer in little-endian format.
    pub fn read_u16(&mut self) -> IoResult<u16> {
        self.ensure(2)?;
        let bytes = &self.data[self.pos..self.pos + 2];
        self.pos += 2;
        Ok(u16::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    /// Reads a 32-bit unsigned integer in little-endian format.
    pub fn read_u32(&mut self) -> IoResult<u32> {
        self.ensure(4)?;
        let bytes = &self.data[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    /// Reads a 32-bit signed integer in little-endian format.
    pub fn read_i32(&mut self) -> IoResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Reads a 64-bit unsigned integer in little-endian format.
    pub fn read_u64(&mut self) -> IoResult<u64> {
        self.ensure(8)?;
        let bytes = &self.data[self.pos..self.pos + 8];
        self.pos += 8;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    /// Reads a 64-bit signed integer in little-endian format.
    pub fn read_i64(&mut self) -> IoResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Reads a 32-bit IEEE float in little-endian format.
    pub fn read_f32(&mut self) -> IoResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Reads a 64-bit IEEE float in little-endian format.
    pub fn read_f64(&mut self) -> IoResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Reads a variable-length unsigned integer, rejecting values above `limit`.
    ///
    /// Encoding: values below 0xFD are a single byte; 0xFD, 0xFE, 0xFF prefix
    /// a little-endian u16, u32, or u64 respectively.
    pub fn read_var_u64(&mut self, limit: u64) -> IoResult<u64> {
        let prefix = self.read_u8()?;
        let value = match prefix {
            0xFD => self.read_u16()? as u64,
            0xFE => self.read_u32()? as u64,
            0xFF => self.read_u64()?,
            direct => direct as u64,
        };
        if value > limit {
            return Err(IoError::length_limit_exceeded(value, limit));
        }
        Ok(value)
    }

    /// Reads a variable-length unsigned integer that must fit in 32 bits.
    pub fn read_var_u32(&mut self) -> IoResult<u32> {
        Ok(self.read_var_u64(u32::MAX as u64)? as u32)
    }

    /// Reads exactly `count` bytes.
    pub fn read_bytes(&mut self, count: usize) -> IoResult<Vec<u8>> {
        self.ensure(count)?;
        let result = self.data[self.pos..self.pos + count].to_vec();
        self.pos += count;
        Ok(result)
    }

    /// Reads a length-prefixed byte string, rejecting lengths above `limit`.
    pub fn read_var_bytes(&mut self, limit: usize) -> IoResult<Vec<u8>> {
        let length = self.read_var_u64(limit as u64)? as usize;
        self.read_bytes(length)
    }
}

//! Binary writer for the Ares runtime.
//!
//! This module provides a growable little-endian writer; the persisted-state
//! codec and the bytecode builder both emit through it.

use bytes::{BufMut, BytesMut};

/// A writer for encoding data structures to binary form.
pub struct StreamWriter {
    /// The buffer being written to
    buffer: BytesMut,
}

impl StreamWriter {
    /// Creates a new writer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Creates a new writer with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Returns the current length of the buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Writes a single byte to the buffer.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    /// Writes a boolean value to the buffer.
    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(if value { 1 } else { 0 });
    }

    /// Writes an unsigned 16-bit integer in little-endian format.
    pub fn write_u16(&mut self, value: u16) {
        self.buffer.put_u16_le(value);
    }

    /// Writes an unsigned 32-bit integer in little-endian format.
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32_le(value);
    }

    /// Writes a signed 32-bit integer in little-endian format.
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.put_i32_le(value);
    }

    /// Writes an unsigned 64-bit integer in little-endian format.
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.put_u64_le(value);
    }

    /// Writes a signed 64-bit integer in little-endian format.
    pub fn write_i64(&mut self, value: i64) {
        self.buffer.put_i64_le(value);
    }

    /// Writes a 32-bit IEEE float in little-endian format.
    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    /// Writes a 64-bit IEEE float in little-endian format.
    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    /// Writes a variable-length unsigned integer.
    ///
    /// Encoding matches [`StreamReader::read_var_u64`]: values below 0xFD are
    /// a single byte; larger values carry a width prefix.
    ///
    /// [`StreamReader::read_var_u64`]: crate::StreamReader::read_var_u64
    pub fn write_var_u64(&mut self, value: u64) {
        if value < 0xFD {
            self.write_u8(value as u8);
        } else if value <= u16::MAX as u64 {
            self.write_u8(0xFD);
            self.write_u16(value as u16);
        } else if value <= u32::MAX as u64 {
            self.write_u8(0xFE);
            self.write_u32(value as u32);
        } else {
            self.write_u8(0xFF);
            self.write_u64(value);
        }
    }

    /// Writes a variable-length unsigned 32-bit integer.
    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(value as u64);
    }

    /// Writes raw bytes to the buffer.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.put_slice(bytes);
    }

    /// Writes a length-prefixed byte string.
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    /// Consumes the writer and returns the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer.to_vec()
    }

    /// Returns a view of the bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }
}

impl Default for StreamWriter {
    fn default() -> Self {
        Self::new()
    }
}

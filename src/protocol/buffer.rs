//! Cursor-based reading and writing of wire-format buffers.
//!
//! `BufferReader` walks an immutable byte slice with an advancing offset;
//! every read checks the remaining length first, so a truncated message
//! surfaces as a decode error instead of a panic. `BufferWriter` is the
//! mirror image for fixed-size outgoing messages (standby status updates).

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::utils::binary::{
    buf_recv_i16, buf_recv_i32, buf_recv_i64, buf_recv_u64, buf_send_i64, buf_send_u64,
};

#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn read_u8(&mut self) -> ReplicationResult<u8> {
        if !self.has_bytes(1) {
            return Err(ReplicationError::decode("not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_i16(&mut self) -> ReplicationResult<i16> {
        if !self.has_bytes(2) {
            return Err(ReplicationError::decode("not enough bytes for i16"));
        }
        let value = buf_recv_i16(&self.buffer[self.position..]);
        self.position += 2;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> ReplicationResult<i32> {
        if !self.has_bytes(4) {
            return Err(ReplicationError::decode("not enough bytes for i32"));
        }
        let value = buf_recv_i32(&self.buffer[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn read_i64(&mut self) -> ReplicationResult<i64> {
        if !self.has_bytes(8) {
            return Err(ReplicationError::decode("not enough bytes for i64"));
        }
        let value = buf_recv_i64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    pub fn read_u64(&mut self) -> ReplicationResult<u64> {
        if !self.has_bytes(8) {
            return Err(ReplicationError::decode("not enough bytes for u64"));
        }
        let value = buf_recv_u64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    /// Read `n` bytes as UTF-8. Invalid UTF-8 is a decode error.
    pub fn read_string(&mut self, n: usize) -> ReplicationResult<String> {
        if !self.has_bytes(n) {
            return Err(ReplicationError::decode("string data truncated"));
        }
        let bytes = &self.buffer[self.position..self.position + n];
        let value = std::str::from_utf8(bytes)
            .map_err(|_| ReplicationError::decode("invalid UTF-8 in string"))?
            .to_owned();
        self.position += n;
        Ok(value)
    }

    /// Read bytes up to and including a NUL terminator; the returned
    /// string excludes the terminator.
    pub fn read_cstr(&mut self) -> ReplicationResult<String> {
        let start = self.position;
        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }

        if self.position >= self.buffer.len() {
            return Err(ReplicationError::decode("string not NUL-terminated"));
        }

        let value = std::str::from_utf8(&self.buffer[start..self.position])
            .map_err(|_| ReplicationError::decode("invalid UTF-8 in string"))?
            .to_owned();
        self.position += 1;
        Ok(value)
    }

    pub fn read_bytes(&mut self, count: usize) -> ReplicationResult<Vec<u8>> {
        if !self.has_bytes(count) {
            return Err(ReplicationError::decode("not enough bytes"));
        }
        let bytes = self.buffer[self.position..self.position + count].to_vec();
        self.position += count;
        Ok(bytes)
    }
}

/// Position-tracked writer over a fixed-size outgoing buffer.
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn has_space(&self, count: usize) -> bool {
        self.buffer.len().saturating_sub(self.position) >= count
    }

    pub fn bytes_written(&self) -> usize {
        self.position
    }

    pub fn write_u8(&mut self, value: u8) -> ReplicationResult<()> {
        if !self.has_space(1) {
            return Err(ReplicationError::buffer("not enough space for u8"));
        }
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> ReplicationResult<()> {
        if !self.has_space(8) {
            return Err(ReplicationError::buffer("not enough space for u64"));
        }
        buf_send_u64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> ReplicationResult<()> {
        if !self.has_space(8) {
            return Err(ReplicationError::buffer("not enough space for i64"));
        }
        buf_send_i64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }
}

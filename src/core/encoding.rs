//! Bitcoin binary encoding helpers
//!
//! Little-endian integers, CompactSize var-ints and length-prefixed byte
//! strings as used by block headers, transactions and wire messages.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::crypto::Hash256;

/// Decoding errors for binary payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Cursor over a byte slice
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Look at the next byte without consuming it
    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::UnexpectedEnd {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    /// CompactSize unsigned integer
    pub fn read_var_int(&mut self) -> Result<u64, DecodeError> {
        match self.read_u8()? {
            0xfd => Ok(self.read_u16_le()? as u64),
            0xfe => Ok(self.read_u32()? as u64),
            0xff => self.read_u64(),
            n => Ok(n as u64),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        self.ensure(len)?;
        let bytes = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(bytes)
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.ensure(32)?;
        let mut hash = [0u8; 32];
        self.buf.copy_to_slice(&mut hash);
        Ok(hash)
    }

    /// Var-int length followed by that many bytes
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_var_int()?;
        if len as usize > self.remaining() {
            return Err(DecodeError::UnexpectedEnd {
                needed: len as usize,
                remaining: self.remaining(),
            });
        }
        self.read_bytes(len as usize)
    }

    pub fn read_var_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|e| DecodeError::InvalidValue(e.to_string()))
    }

    /// Read a var-int count and reject counts that cannot fit in the remaining data
    pub fn read_count(&mut self, min_item_size: usize) -> Result<usize, DecodeError> {
        let count = self.read_var_int()? as usize;
        if count.saturating_mul(min_item_size.max(1)) > self.remaining() {
            return Err(DecodeError::InvalidValue(format!("count {} exceeds payload", count)));
        }
        Ok(count)
    }
}

/// Append a CompactSize unsigned integer
pub fn put_var_int(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x10000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

/// Append a var-int length prefix followed by the bytes
pub fn put_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_var_int(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Serialized length of a CompactSize integer
pub fn var_int_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

//! Minimal XDR (RFC 4506) encoding for layout bodies and device addresses.
//!
//! The writer is bounded: callers hand it the size the client will accept
//! and every encode fails with `TooSmall` once that would be exceeded.

use crate::error::{FsalError, Result};

pub struct XdrWriter {
    buffer: Vec<u8>,
    limit: usize,
}

impl XdrWriter {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn reserve(&self, extra: usize) -> Result<()> {
        let need = self.buffer.len() + extra;
        if need > self.limit {
            return Err(FsalError::TooSmall {
                need,
                have: self.limit,
            });
        }
        Ok(())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(4)?;
        self.buffer.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<()> {
        self.reserve(8)?;
        self.buffer.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Fixed-length opaque, zero padded to a 4-byte boundary.
    pub fn put_opaque_fixed(&mut self, data: &[u8]) -> Result<()> {
        let pad = (4 - data.len() % 4) % 4;
        self.reserve(data.len() + pad)?;
        self.buffer.extend_from_slice(data);
        self.buffer.extend_from_slice(&[0u8; 3][..pad]);
        Ok(())
    }

    pub fn put_opaque(&mut self, data: &[u8]) -> Result<()> {
        self.reserve(4 + data.len())?;
        self.put_u32(data.len() as u32)?;
        self.put_opaque_fixed(data)
    }

    pub fn put_string(&mut self, s: &str) -> Result<()> {
        self.put_opaque(s.as_bytes())
    }
}

/// Decoder for the same subset. Malformed input is reported as `BadHandle`.
pub struct XdrReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> XdrReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(FsalError::BadHandle {
                len: self.buffer.len(),
            });
        }
        let out = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(out)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn get_opaque_fixed(&mut self, len: usize) -> Result<&'a [u8]> {
        let padded = len + (4 - len % 4) % 4;
        Ok(&self.take(padded)?[..len])
    }

    pub fn get_opaque(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.get_opaque_fixed(len)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_opaque()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FsalError::BadHandle { len: bytes.len() })
    }
}

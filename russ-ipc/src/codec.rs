// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-endian framing of scalars, byte strings and string arrays. Byte
//! order is little-endian for wire compatibility. Encoders fail without
//! writing when the frame limit would be exceeded; decoders advance a
//! cursor and fail on truncated input.

use crate::error::{Error, Result};

pub struct Enc {
    buf: Vec<u8>,
    limit: usize,
}

impl Enc {
    pub fn with_limit(limit: usize) -> Enc {
        Enc { buf: Vec::new(), limit }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > self.limit {
            return Err(Error::protocol("encoded frame exceeds limit"));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn put_i32(&mut self, v: i32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    /// Raw bytes without a length prefix (the protocol tag).
    pub fn put_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.put(bytes)
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > u32::MAX as usize {
            return Err(Error::protocol("byte string too long"));
        }
        self.put_u32(bytes.len() as u32)?;
        self.put(bytes)
    }

    /// Strings encode exactly as bytes; no trailing NUL on the wire.
    pub fn put_str(&mut self, s: &str) -> Result<()> {
        self.put_bytes(s.as_bytes())
    }

    /// String array: element count, then each element. A count of zero
    /// denotes an empty array; the in-memory NUL sentinel never travels.
    pub fn put_str_array(&mut self, items: &[String]) -> Result<()> {
        self.put_u32(items.len() as u32)?;
        for item in items {
            self.put_str(item)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Overwrite previously reserved bytes, for patching a size prefix.
    pub fn patch(&mut self, at: usize, bytes: &[u8]) {
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
    }
}

pub struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    pub fn new(buf: &'a [u8]) -> Dec<'a> {
        Dec { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::protocol("truncated frame"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.get_u32()? as usize;
        self.take(n)
    }

    pub fn get_str(&mut self) -> Result<String> {
        let b = self.get_bytes()?;
        String::from_utf8(b.to_vec()).map_err(|_| Error::protocol("non-utf8 string field"))
    }

    /// String array bounded by `max` elements.
    pub fn get_str_array(&mut self, max: usize) -> Result<Vec<String>> {
        let n = self.get_u32()? as usize;
        if n > max {
            return Err(Error::protocol("string array exceeds element limit"));
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.get_str()?);
        }
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

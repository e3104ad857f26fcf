// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Capped byte buffer with a drain offset, used for captured output and
/// pending relay writes. A capacity of zero models "discard".
#[derive(Debug, Default)]
pub struct Buf {
    data: Vec<u8>,
    cap: usize,
    off: usize,
}

impl Buf {
    pub fn new(cap: usize) -> Buf {
        Buf { data: Vec::with_capacity(cap), cap, off: 0 }
    }

    /// Pre-filled buffer; capacity equals the initial content.
    pub fn from_slice(bytes: &[u8]) -> Buf {
        Buf { data: bytes.to_vec(), cap: bytes.len(), off: 0 }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Room left for appending.
    pub fn space(&self) -> usize {
        self.cap - self.data.len()
    }

    /// Append at most `space()` bytes; returns how many were taken.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let n = chunk.len().min(self.space());
        self.data.extend_from_slice(&chunk[..n]);
        n
    }

    /// Unread portion (everything past the drain offset).
    pub fn pending(&self) -> &[u8] {
        &self.data[self.off..]
    }

    /// Mark `n` pending bytes as consumed; clears the buffer once drained.
    pub fn consume(&mut self, n: usize) {
        self.off += n;
        if self.off >= self.data.len() {
            self.data.clear();
            self.off = 0;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.off = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_respects_cap() {
        let mut b = Buf::new(4);
        assert_eq!(b.push(b"abcdef"), 4);
        assert_eq!(b.as_slice(), b"abcd");
        assert_eq!(b.space(), 0);
        assert_eq!(b.push(b"x"), 0);
        b.clear();
        assert_eq!(b.space(), 4);
    }

    #[test]
    fn test_zero_cap_discards() {
        let mut b = Buf::new(0);
        assert_eq!(b.push(b"abc"), 0);
        assert!(b.is_empty());
    }

    #[test]
    fn test_consume_resets_when_drained() {
        let mut b = Buf::from_slice(b"hello");
        b.consume(2);
        assert_eq!(b.pending(), b"llo");
        b.consume(3);
        assert!(b.is_empty());
        assert_eq!(b.space(), 5);
    }
}

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// Ordered queue of bytes waiting to be written to the transport.
///
/// Owned by the protocol connection. The transport only asks whether data is
/// pending, reads the next contiguous fragment, and consumes what the socket
/// accepted.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    fragments: VecDeque<Bytes>,
    len: usize,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Empty fragments are dropped.
    pub fn push(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.fragments.push_back(data);
    }

    /// Append a copy of `data`.
    pub fn push_slice(&mut self, data: &[u8]) {
        self.push(Bytes::copy_from_slice(data));
    }

    /// Whether any bytes are waiting.
    pub fn has_pending(&self) -> bool {
        self.len > 0
    }

    /// Total pending bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The next contiguous run of pending bytes. Empty when nothing is pending.
    pub fn chunk(&self) -> &[u8] {
        self.fragments.front().map(|b| &b[..]).unwrap_or(&[])
    }

    /// Drop `n` bytes from the front.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`len()`](Self::len).
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.len,
            "consume({n}) exceeds buffered length {}",
            self.len
        );
        self.len -= n;
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.fragments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.fragments.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
    }

    /// Discard everything pending.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_is_front_fragment() {
        let mut buf = OutboundBuffer::new();
        assert!(!buf.has_pending());
        assert!(buf.chunk().is_empty());

        buf.push_slice(b"abc");
        buf.push(Bytes::from_static(b"defg"));
        assert_eq!(buf.len(), 7);
        assert_eq!(buf.chunk(), b"abc");
    }

    #[test]
    fn consume_spans_fragments() {
        let mut buf = OutboundBuffer::new();
        buf.push_slice(b"abc");
        buf.push_slice(b"defg");

        buf.consume(2);
        assert_eq!(buf.chunk(), b"c");
        buf.consume(3);
        assert_eq!(buf.chunk(), b"fg");
        assert_eq!(buf.len(), 2);
        buf.consume(2);
        assert!(!buf.has_pending());
    }

    #[test]
    fn empty_push_is_ignored() {
        let mut buf = OutboundBuffer::new();
        buf.push_slice(b"");
        assert!(buf.is_empty());
        assert_eq!(buf.chunk(), b"");
    }

    #[test]
    #[should_panic(expected = "exceeds buffered length")]
    fn consume_past_end_panics() {
        let mut buf = OutboundBuffer::new();
        buf.push_slice(b"ab");
        buf.consume(3);
    }
}

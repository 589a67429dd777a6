//! Buffered input for the streaming parser.
//!
//! Chunks arrive with arbitrary boundaries. Most of the time a chunk can be
//! consumed in place, so the parser reads straight from the caller's slice.
//! Only when a state needs more bytes than are available (a header split
//! across chunks, the manifest body) is the unconsumed remainder copied into
//! an owned carry-over buffer, and subsequent chunks are appended to it until
//! the buffered record has been consumed.

use bytes::{Buf, BytesMut};

/// Carry-over storage that survives between `process` calls.
#[derive(Debug, Default)]
pub struct InputBuffer {
    pending: BytesMut,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an incoming chunk with the carry-over and return a view over the
    /// bytes available to the parser.
    ///
    /// Without carry-over the view points directly at `chunk` (no copy).
    pub fn feed<'a>(&'a mut self, chunk: &'a [u8]) -> InputView<'a> {
        if self.pending.is_empty() {
            InputView {
                pending: &mut self.pending,
                chunk,
                buffered: false,
            }
        } else {
            self.pending.extend_from_slice(chunk);
            InputView {
                pending: &mut self.pending,
                chunk: &[],
                buffered: true,
            }
        }
    }

    /// Number of bytes carried over to the next call.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The `(pointer, length)` view the state machine reads through.
///
/// Bytes that are neither consumed nor saved are dropped when the view goes
/// out of scope.
#[derive(Debug)]
pub struct InputView<'a> {
    pending: &'a mut BytesMut,
    chunk: &'a [u8],
    buffered: bool,
}

impl<'a> InputView<'a> {
    /// Currently available bytes.
    pub fn data(&self) -> &[u8] {
        if self.buffered {
            &self.pending[..]
        } else {
            self.chunk
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the view is backed by the carry-over buffer.
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Keep the unconsumed bytes for the next call.
    ///
    /// A no-op when the view already reads from the carry-over buffer.
    pub fn save(&mut self) {
        if !self.buffered {
            self.pending.extend_from_slice(self.chunk);
            self.chunk = &[];
            self.buffered = true;
        }
    }

    /// Advance past `n` bytes (clamped to what is available).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len());
        if self.buffered {
            self.pending.advance(n);
            if self.pending.is_empty() {
                // Release the record-sized allocation once it is drained.
                *self.pending = BytesMut::new();
            }
        } else {
            let chunk = self.chunk;
            self.chunk = &chunk[n..];
        }
    }

    /// Drop everything currently visible.
    pub fn discard_all(&mut self) {
        let len = self.len();
        self.consume(len);
    }
}

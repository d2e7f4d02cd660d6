//! Receive buffer for the frame decoder.
//!
//! Read chunks arrive as refcounted `Bytes` and are queued whole; the
//! decoder consumes them without stitching chunks together unless a
//! frame actually straddles a chunk boundary.
//!
//! Only three consumers exist, so the API is exactly what the decoder
//! needs: `peek_into` for the fixed header, `skip` to discard it, and
//! `take` for the two body sections.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::mem;

/// Queue of incoming byte chunks with cheap front extraction.
///
/// Taking `n` bytes that sit inside the first chunk is zero-copy (a
/// refcount bump); only a frame section straddling chunks is copied.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    chunks: VecDeque<Bytes>,
    buffered: usize,
}

impl RecvBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            buffered: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.buffered
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    /// Queue a chunk read from the socket.
    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.buffered += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// Copy the first `dst.len()` bytes into `dst` without consuming
    /// them. Returns `false` if not enough data is buffered.
    pub fn peek_into(&self, dst: &mut [u8]) -> bool {
        if dst.len() > self.buffered {
            return false;
        }

        // Walk the chunk queue, carving `dst` down as each chunk fills
        // its leading slice.
        let mut unfilled = &mut dst[..];
        for chunk in &self.chunks {
            if unfilled.is_empty() {
                break;
            }
            let take = unfilled.len().min(chunk.len());
            let (fill, rest) = mem::take(&mut unfilled).split_at_mut(take);
            fill.copy_from_slice(&chunk[..take]);
            unfilled = rest;
        }
        true
    }

    /// Drop the first `n` buffered bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    pub fn skip(&mut self, mut n: usize) {
        assert!(n <= self.buffered);
        self.buffered -= n;

        while let Some(front) = self.chunks.front_mut() {
            if n < front.len() {
                front.advance(n);
                return;
            }
            n -= front.len();
            self.chunks.pop_front();
            if n == 0 {
                return;
            }
        }
    }

    /// Remove and return exactly `n` bytes from the front.
    ///
    /// Returns `None` if fewer than `n` bytes are buffered. Zero-copy
    /// when the bytes fit in the first chunk.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if n > self.buffered {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }

        // Fast path: the front chunk alone covers the request.
        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= n {
                self.buffered -= n;
                let out = front.split_to(n);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                return Some(out);
            }
        }

        // Straddles chunks: copy the prefix out, then discard it.
        let mut out = vec![0u8; n];
        let copied = self.peek_into(&mut out);
        debug_assert!(copied);
        self.skip(n);
        Some(Bytes::from(out))
    }
}

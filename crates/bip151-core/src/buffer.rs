//! Incremental byte queue for the inbound frame parser.
//!
//! Ciphertext arrives in arbitrary chunks; the parser repeatedly asks for an
//! exact number of bytes (first the encrypted length prefix, then the
//! payload plus tag). The queue keeps the chunks as received and only
//! coalesces when a request straddles a chunk boundary.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Ordered queue of owned byte buffers with a running total.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    chunks: VecDeque<Bytes>,
    total: usize,
}

impl PendingBuffer {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Empty chunks are discarded.
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.total += data.len();
        self.chunks.push_back(data);
    }

    /// Total bytes currently buffered.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Take exactly `n` contiguous bytes, or `None` if fewer are buffered.
    ///
    /// Reuses the head chunk without copying when it covers the request;
    /// otherwise coalesces into a single allocation. Never returns a short
    /// read: the total is only consumed once `n` bytes are in hand.
    pub fn read(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 || self.total < n {
            return None;
        }

        if let Some(head) = self.chunks.front_mut() {
            if head.len() >= n {
                let out = head.split_to(n);
                if head.is_empty() {
                    self.chunks.pop_front();
                }
                self.total -= n;
                return Some(out);
            }
        }

        let mut out = BytesMut::with_capacity(n);
        while let Some(mut chunk) = self.chunks.pop_front() {
            let take = chunk.len().min(n - out.len());
            out.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                chunk.advance(take);
                self.chunks.push_front(chunk);
            }
            if out.len() == n {
                self.total -= n;
                return Some(out.freeze());
            }
        }

        // The chunks ran dry before `n` bytes despite the total; requeue
        // what was taken so no bytes are lost.
        let taken = out.freeze();
        if !taken.is_empty() {
            self.chunks.push_front(taken);
        }
        None
    }
}

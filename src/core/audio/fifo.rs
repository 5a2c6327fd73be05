//! FIFO of PCM bytes bridging an audio producer and a single consumer.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Default upper bound for a single dequeued chunk (about 680 ms of 24 kHz mono PCM16).
const DEFAULT_MAX_CHUNK_BYTES: usize = 32 * 1024;

/// First-in-first-out byte queue with wakeup on enqueue.
///
/// Producers call [`push`](Self::push); the consumer either polls with
/// [`pop`](Self::pop), which never blocks, or awaits [`recv`](Self::recv), which
/// parks on a [`Notify`] until the next push. The internal lock is only held for
/// the duration of a push/pop and never across an `.await`.
#[derive(Debug)]
pub struct AudioFrameBuffer {
    chunks: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    max_chunk_bytes: usize,
}

impl Default for AudioFrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioFrameBuffer {
    pub fn new() -> Self {
        Self::with_max_chunk(DEFAULT_MAX_CHUNK_BYTES)
    }

    /// Create a buffer whose dequeued chunks never exceed `max_chunk_bytes`.
    ///
    /// The bound is rounded down to an even number so chunks stay sample-aligned.
    pub fn with_max_chunk(max_chunk_bytes: usize) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_chunk_bytes: (max_chunk_bytes & !1).max(2),
        }
    }

    /// Append bytes and wake the consumer.
    pub fn push(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.chunks.lock().push_back(data);
        self.notify.notify_one();
    }

    /// Dequeue everything buffered so far (up to the chunk bound) as one chunk.
    ///
    /// Returns `None` immediately when nothing is queued.
    pub fn pop(&self) -> Option<Bytes> {
        let mut chunks = self.chunks.lock();
        let first = chunks.pop_front()?;

        if first.len() >= self.max_chunk_bytes {
            let mut first = first;
            let head = first.split_to(self.max_chunk_bytes);
            if !first.is_empty() {
                chunks.push_front(first);
            }
            return Some(head);
        }

        if chunks.is_empty() {
            return Some(first);
        }

        let mut out = BytesMut::with_capacity(self.max_chunk_bytes);
        out.extend_from_slice(&first);
        while let Some(mut next) = chunks.pop_front() {
            let room = self.max_chunk_bytes - out.len();
            if next.len() > room {
                out.extend_from_slice(&next.split_to(room));
                chunks.push_front(next);
                break;
            }
            out.extend_from_slice(&next);
            if out.len() == self.max_chunk_bytes {
                break;
            }
        }
        Some(out.freeze())
    }

    /// Wait until data is available and dequeue it.
    pub async fn recv(&self) -> Bytes {
        loop {
            if let Some(chunk) = self.pop() {
                return chunk;
            }
            self.notify.notified().await;
        }
    }

    /// Discard everything buffered.
    pub fn clear(&self) {
        self.chunks.lock().clear();
    }

    /// Total bytes currently buffered.
    pub fn len(&self) -> usize {
        self.chunks.lock().iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }
}

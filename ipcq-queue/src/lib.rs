//! Single-producer shared-memory byte ring with a peek-then-commit reader
//! protocol.
//!
//! Ported from PipelineDB's `queue.c`. Each record is a `[len: u32][payload]`
//! frame written by exactly one producer. A reader calls [`IpcQueue::peek`]
//! repeatedly to walk frames without removing them (advancing an internal
//! `cursor`), processes them, then calls [`IpcQueue::commit`] once to
//! release everything peeked so far back to the producer in one step —
//! mirroring the original's `ipc_queue_peek_next` / `ipc_queue_pop_peeked`
//! split, which exists so a reader can batch many frames under one lock
//! acquisition before paying the cost of waking the producer.
//!
//! The original additionally juggles explicit wrap-detection and padding
//! because a single `memcpy` cannot straddle the end of a contiguous shared
//! memory region. This port instead copies in two pieces when a frame
//! straddles the boundary (`write_wrapping` / `read_wrapping`), which is
//! simpler and needs no padding records, while preserving the same
//! capacity, blocking, and ordering behavior.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("record of {0} bytes exceeds queue capacity {1}")]
    TooLarge(usize, usize),
    #[error("queue is full and wait=false")]
    WouldBlock,
}

struct Ring {
    bytes: Box<[u8]>,
    capacity: u64,
    /// Next byte offset the producer will write to.
    head: u64,
    /// Oldest unread byte offset; advances only on `commit`.
    tail: u64,
    /// Peek position; `tail <= cursor <= head`.
    cursor: u64,
}

impl Ring {
    fn free_space(&self) -> u64 {
        self.capacity - (self.head - self.tail)
    }

    fn write_wrapping(&mut self, logical_off: u64, data: &[u8]) {
        let cap = self.capacity as usize;
        let start = (logical_off % self.capacity) as usize;
        let first = (cap - start).min(data.len());
        self.bytes[start..start + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.bytes[..data.len() - first].copy_from_slice(&data[first..]);
        }
    }

    fn read_wrapping(&self, logical_off: u64, len: usize) -> Vec<u8> {
        let cap = self.capacity as usize;
        let start = (logical_off % self.capacity) as usize;
        let first = (cap - start).min(len);
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&self.bytes[start..start + first]);
        if first < len {
            out.extend_from_slice(&self.bytes[..len - first]);
        }
        out
    }
}

/// A single-producer queue with peek-then-commit readers. Multiple queues
/// (one per producer) are what the broker (`ipcq-broker`) fans in across;
/// within one queue there is exactly one producer and one logical reader
/// cursor, matching the original `ipc_queue` struct, which carries a single
/// shared `tail`/`cursor` pair rather than per-reader state.
pub struct IpcQueue {
    ring: Mutex<Ring>,
    not_empty: Condvar,
    space_available: Condvar,
    /// Monotonic count of frames ever pushed, for metrics/tests; not used
    /// for ring bookkeeping.
    pushed: AtomicU64,
}

impl IpcQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                bytes: vec![0u8; capacity].into_boxed_slice(),
                capacity: capacity as u64,
                head: 0,
                tail: 0,
                cursor: 0,
            }),
            not_empty: Condvar::new(),
            space_available: Condvar::new(),
            pushed: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity as usize
    }

    /// Appends a record, blocking the calling (single producer) thread
    /// until there is room. Registers intent to wait before checking the
    /// condition, the same "register the waiter before reading the gating
    /// state" ordering the original calls out as necessary to avoid a
    /// missed wakeup between a reader's `commit` and the producer's wait.
    ///
    /// Equivalent to `push(data, wait = true)` in the original's
    /// `ipc_queue_push(data, len, wait)` contract.
    pub fn push(&self, data: &[u8]) -> Result<(), QueueError> {
        self.push_with(data, true)
    }

    /// Non-blocking push: returns [`QueueError::WouldBlock`] immediately
    /// instead of waiting when there isn't room. Equivalent to `push(data,
    /// wait = false)`.
    pub fn try_push(&self, data: &[u8]) -> Result<(), QueueError> {
        self.push_with(data, false)
    }

    fn push_with(&self, data: &[u8], wait: bool) -> Result<(), QueueError> {
        let required = (LEN_PREFIX + data.len()) as u64;
        let mut ring = self.ring.lock();
        if required > ring.capacity {
            tracing::warn!(len = data.len(), capacity = ring.capacity, "record too large for queue");
            return Err(QueueError::TooLarge(data.len(), ring.capacity as usize));
        }
        while ring.free_space() < required {
            if !wait {
                return Err(QueueError::WouldBlock);
            }
            self.space_available.wait(&mut ring);
        }
        let head = ring.head;
        ring.write_wrapping(head, &(data.len() as u32).to_le_bytes());
        ring.write_wrapping(head + LEN_PREFIX as u64, data);
        ring.head += required;
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until there is at least one unread (not-yet-peeked) frame.
    pub fn wait_non_empty(&self) {
        let mut ring = self.ring.lock();
        while ring.head == ring.cursor {
            self.not_empty.wait(&mut ring);
        }
    }

    /// Like [`wait_non_empty`](Self::wait_non_empty), but gives up after
    /// `timeout` and returns `false`. The broker uses this in place of the
    /// original's 1-second `WaitLatch` timeout, so it can still notice a
    /// shutdown signal while no producer has anything queued.
    pub fn wait_non_empty_timeout(&self, timeout: std::time::Duration) -> bool {
        let mut ring = self.ring.lock();
        if ring.head != ring.cursor {
            return true;
        }
        !self.not_empty.wait_for(&mut ring, timeout).timed_out()
    }

    /// Advances the peek cursor past the next frame and returns a copy of
    /// its payload, or `None` if everything pushed so far has already been
    /// peeked. Does not release space back to the producer; call
    /// [`commit`](Self::commit) for that.
    pub fn peek(&self) -> Option<Vec<u8>> {
        let mut ring = self.ring.lock();
        if ring.cursor == ring.head {
            return None;
        }
        let cursor = ring.cursor;
        let len_bytes = ring.read_wrapping(cursor, LEN_PREFIX);
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        let payload = ring.read_wrapping(cursor + LEN_PREFIX as u64, len);
        ring.cursor += (LEN_PREFIX + len) as u64;
        Some(payload)
    }

    /// True if there are frames peeked but not yet committed.
    pub fn has_unpopped(&self) -> bool {
        let ring = self.ring.lock();
        ring.cursor > ring.tail
    }

    /// Resets the peek cursor to the last commit point, so the next `peek`
    /// re-reads frames that were peeked but not committed. Matches the
    /// original's `ipc_queue_unpeek`, used when a reader decides mid-batch
    /// not to consume what it has looked at.
    pub fn unpeek(&self) {
        let mut ring = self.ring.lock();
        ring.cursor = ring.tail;
    }

    /// Releases every frame peeked since the last commit back to the
    /// producer. Callers must have already finished acting on the data
    /// returned by `peek` — the original runs its per-slot callback before
    /// advancing `tail` for exactly this reason, so a producer woken by
    /// this call never observes space that the reader hasn't truly
    /// finished with.
    pub fn commit(&self) {
        let mut ring = self.ring.lock();
        ring.tail = ring.cursor;
        drop(ring);
        self.space_available.notify_one();
    }

    pub fn frames_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn push_peek_commit_roundtrip() {
        let q = IpcQueue::new(256);
        q.push(b"hello").unwrap();
        q.push(b"world").unwrap();

        assert_eq!(q.peek().unwrap(), b"hello");
        assert_eq!(q.peek().unwrap(), b"world");
        assert!(q.peek().is_none());
        assert!(q.has_unpopped());
        q.commit();
        assert!(!q.has_unpopped());
    }

    #[test]
    fn unpeek_rewinds_to_last_commit() {
        let q = IpcQueue::new(256);
        q.push(b"a").unwrap();
        q.push(b"b").unwrap();
        assert_eq!(q.peek().unwrap(), b"a");
        q.unpeek();
        assert_eq!(q.peek().unwrap(), b"a");
        assert_eq!(q.peek().unwrap(), b"b");
        q.commit();
    }

    #[test]
    fn blocks_until_space_freed() {
        let q = Arc::new(IpcQueue::new(4 + 8));
        q.push(b"aaaaaaaa").unwrap();

        let q2 = q.clone();
        let writer = thread::spawn(move || {
            q2.push(b"bbbbbbbb").unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        q.peek().unwrap();
        q.commit();
        writer.join().unwrap();
    }

    #[test]
    fn try_push_returns_would_block_instead_of_waiting() {
        let q = IpcQueue::new(4 + 8);
        q.push(b"aaaaaaaa").unwrap();
        assert!(matches!(q.try_push(b"bbbbbbbb"), Err(QueueError::WouldBlock)));
        q.peek().unwrap();
        q.commit();
        q.try_push(b"bbbbbbbb").unwrap();
    }

    #[test]
    fn oversized_record_is_rejected() {
        let q = IpcQueue::new(16);
        let err = q.push(&[0u8; 64]);
        assert!(matches!(err, Err(QueueError::TooLarge(64, 16))));
    }

    #[test]
    fn wrapping_record_reads_back_correctly() {
        let q = IpcQueue::new(4 + 8);
        q.push(b"aaaaaaaa").unwrap();
        assert_eq!(q.peek().unwrap(), b"aaaaaaaa");
        q.commit();
        // Head is now at capacity; the next record must wrap around.
        q.push(b"bbbbbbbb").unwrap();
        assert_eq!(q.peek().unwrap(), b"bbbbbbbb");
        q.commit();
    }
}

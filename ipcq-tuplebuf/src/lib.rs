//! Fan-out tuple ring buffer.
//!
//! Ported from PipelineDB's `tuplebuf.c`: a ring of slots, each carrying a
//! `readby` set of the readers still interested in it. A slot is freed for
//! reuse only once every interested reader has unpinned it. Grounded in the
//! teacher's `CompletionTracker` (`kaos::disruptor::completion_tracker`) for
//! the RAII pin/unpin shape — `ReadGuard`/`BatchReadGuard` there commit a
//! read on `Drop`; `PinGuard` here unpins on `Drop` the same way, so a
//! panicking reader can never leave a slot permanently pinned.
//!
//! The original partitions readers of the same continuous query across
//! several reader processes with a jump-consistent-hash function computed
//! inside the buffer. That partitioning decision belongs to the layer that
//! knows about continuous queries, which is out of scope here; callers of
//! [`TupleBuffer::insert`] pass the already-computed set of interested
//! readers directly.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

pub type ReaderId = u32;

#[derive(Error, Debug)]
pub enum TupleBufError {
    #[error("reader {0} is not open on this buffer")]
    UnknownReader(ReaderId),
    #[error("tuple of {0} bytes exceeds the configured slot capacity")]
    TupleTooLarge(usize),
}

struct Slot {
    seq: u64,
    data: Arc<[u8]>,
    readby: HashSet<ReaderId>,
    /// Mirrors the original's tuple-descriptor refcount, which starts
    /// negative for stream inserts and is released to zero on the unpin
    /// that empties `readby`; here it's simply `readby.len()` at insertion
    /// time, decremented on each unpin, with zero meaning the underlying
    /// tuple descriptor can be dropped.
    descriptor_refcount: usize,
}

struct ReaderState {
    /// Last slot sequence this reader has pinned, or `None` before its
    /// first pin.
    position: Option<u64>,
    /// Nonce observed at last pin; used to detect this reader having been
    /// lapped by the ring wrapping past it.
    nonce: u64,
}

struct Inner {
    slots: VecDeque<Slot>,
    capacity: usize,
    /// Sequence number of the next slot to be inserted.
    head_seq: u64,
    /// Bumped every time a slot is evicted (ring capacity reached) so
    /// readers that were still behind it can detect they were lapped.
    nonce: u64,
    readers: std::collections::HashMap<ReaderId, ReaderState>,
    next_reader_id: ReaderId,
    /// Readers parked in `wait`/`pin_next_blocking`, captured and cleared by
    /// `notify_and_clear_waiters`.
    waiters: HashSet<ReaderId>,
}

impl Inner {
    fn oldest_seq(&self) -> Option<u64> {
        self.slots.front().map(|s| s.seq)
    }
}

/// Shared fan-out buffer. Cloning is cheap (`Arc` internally via
/// [`TupleBuffer::handle`]); most code holds a `TupleBuffer` directly and
/// shares it behind an `Arc<TupleBuffer>`.
pub struct TupleBuffer {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    space_available: Condvar,
    live_descriptor_bytes: AtomicU64,
}

/// RAII guard for one pinned slot. Unpins on drop, including on an
/// unwinding panic, so a reader that dies mid-processing can never wedge
/// the ring.
pub struct PinGuard<'a> {
    buffer: &'a TupleBuffer,
    reader: ReaderId,
    seq: u64,
    data: Arc<[u8]>,
    unpinned: bool,
}

impl<'a> PinGuard<'a> {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Unpins early, rather than waiting for `Drop`. Idempotent.
    pub fn unpin(mut self) {
        self.do_unpin();
    }

    fn do_unpin(&mut self) {
        if self.unpinned {
            return;
        }
        self.unpinned = true;
        self.buffer.unpin(self.reader, self.seq);
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.do_unpin();
    }
}

impl TupleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: VecDeque::with_capacity(capacity),
                capacity,
                head_seq: 0,
                nonce: 0,
                readers: std::collections::HashMap::new(),
                next_reader_id: 0,
                waiters: HashSet::new(),
            }),
            not_empty: Condvar::new(),
            space_available: Condvar::new(),
            live_descriptor_bytes: AtomicU64::new(0),
        }
    }

    pub fn open_reader(&self) -> ReaderId {
        let mut inner = self.inner.lock();
        let id = inner.next_reader_id;
        inner.next_reader_id += 1;
        let nonce = inner.nonce;
        inner.readers.insert(id, ReaderState { position: None, nonce });
        id
    }

    pub fn close_reader(&self, reader: ReaderId) {
        let mut inner = self.inner.lock();
        // Dropping interest unblocks any slot only this reader was holding.
        for slot in inner.slots.iter_mut() {
            if slot.readby.remove(&reader) && slot.readby.is_empty() {
                slot.descriptor_refcount = 0;
            }
        }
        inner.readers.remove(&reader);
        inner.waiters.remove(&reader);
        self.reclaim_tail(&mut inner);
        drop(inner);
        self.space_available.notify_all();
    }

    /// Inserts a tuple, fanning it out to `interested_readers`. Blocks while
    /// the ring is full — i.e. while the oldest slot still has unfinished
    /// readers — mirroring the original's spin-wait in `TupleBufferInsert`.
    pub fn insert(&self, data: Arc<[u8]>, interested_readers: HashSet<ReaderId>) {
        let mut inner = self.inner.lock();
        while inner.slots.len() >= inner.capacity {
            self.space_available.wait(&mut inner);
        }
        self.live_descriptor_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        let seq = inner.head_seq;
        inner.head_seq += 1;
        let refcount = interested_readers.len();
        inner.slots.push_back(Slot {
            seq,
            data,
            readby: interested_readers,
            descriptor_refcount: refcount,
        });
        if inner.slots.len() > inner.capacity {
            // Shouldn't happen given the wait above, but keep the ring's
            // logical capacity honest if it ever does.
            inner.nonce += 1;
        }
        drop(inner);
        self.notify_and_clear_waiters();
    }

    /// Pins the next slot this reader hasn't yet seen and is interested in,
    /// skipping slots it isn't registered against. Returns `None` if the
    /// reader is caught up with every slot currently in the buffer. Never
    /// blocks; call [`wait`](Self::wait) or [`pin_next_blocking`]
    /// (Self::pin_next_blocking) to suspend until more arrive instead of
    /// polling.
    pub fn pin_next(&self, reader: ReaderId) -> Result<Option<PinGuard<'_>>, TupleBufError> {
        self.pin_next_inner(reader, false)
    }

    /// Like [`pin_next`](Self::pin_next), but suspends on the same latch
    /// [`wait`](Self::wait) uses instead of returning `None` when the
    /// reader is caught up, so a reader with nothing else to do never has
    /// to poll. Mirrors `TupleBufferPinNextSlot` blocking on the per-reader
    /// latch in the original when there is nothing pinnable yet.
    pub fn pin_next_blocking(&self, reader: ReaderId) -> Result<PinGuard<'_>, TupleBufError> {
        Ok(self
            .pin_next_inner(reader, true)?
            .expect("blocking pin_next_inner always resolves to a slot"))
    }

    fn pin_next_inner(&self, reader: ReaderId, block: bool) -> Result<Option<PinGuard<'_>>, TupleBufError> {
        let mut inner = self.inner.lock();
        loop {
            let (oldest_seq, nonce) = (inner.oldest_seq(), inner.nonce);

            let state = inner
                .readers
                .get_mut(&reader)
                .ok_or(TupleBufError::UnknownReader(reader))?;

            if state.nonce < nonce {
                // Lapped: the ring has recycled past where this reader was.
                // Jump to the oldest slot still present, same as the
                // original resetting a lapped reader to `tail`.
                state.position = oldest_seq.map(|s| s.saturating_sub(1));
                state.nonce = nonce;
            }

            let next_seq = match state.position {
                Some(pos) => pos + 1,
                None => oldest_seq.unwrap_or(inner.head_seq),
            };

            if next_seq >= inner.head_seq {
                if !block {
                    return Ok(None);
                }
                // Register as a waiter and sleep on the same condvar
                // `insert` notifies, all under one lock hold so a racing
                // insert between our emptiness check and the wait can never
                // be missed.
                inner.waiters.insert(reader);
                self.not_empty.wait(&mut inner);
                continue;
            }

            inner.readers.get_mut(&reader).unwrap().position = Some(next_seq);

            let Some(front_seq) = inner.oldest_seq() else {
                return Ok(None);
            };
            let idx = (next_seq - front_seq) as usize;
            let interested = inner.slots.get(idx).map(|s| s.readby.contains(&reader)).unwrap_or(false);
            if !interested {
                continue;
            }

            let slot = inner.slots.get(idx).unwrap();
            let data = slot.data.clone();
            drop(inner);
            return Ok(Some(PinGuard {
                buffer: self,
                reader,
                seq: next_seq,
                data,
                unpinned: false,
            }));
        }
    }

    /// Suspends the caller until `notify` or `notify_and_clear_waiters` next
    /// wakes it. Registers `reader` in the waiters set before sleeping, same
    /// as `TupleBufferWait` recording the caller's bit before checking
    /// emptiness, so a racing insert can never be missed. Returns an error
    /// for a reader id this buffer doesn't recognize.
    pub fn wait(&self, reader: ReaderId) -> Result<(), TupleBufError> {
        let mut inner = self.inner.lock();
        if !inner.readers.contains_key(&reader) {
            return Err(TupleBufError::UnknownReader(reader));
        }
        inner.waiters.insert(reader);
        self.not_empty.wait(&mut inner);
        Ok(())
    }

    /// Wakes every reader currently suspended in [`wait`](Self::wait),
    /// without otherwise touching the waiters set. Mirrors
    /// `TupleBufferNotify`.
    pub fn notify(&self) {
        self.not_empty.notify_all();
    }

    /// Atomically captures and clears the waiters set, then wakes everyone
    /// in it. `insert` calls this after publishing a new slot, matching
    /// `TupleBufferNotifyAndClearWaiters`'s "no-miss wakeup" guarantee: a
    /// waiter that registered its bit before re-checking emptiness is
    /// guaranteed to be in the captured set.
    pub fn notify_and_clear_waiters(&self) -> HashSet<ReaderId> {
        let mut inner = self.inner.lock();
        let woken = std::mem::take(&mut inner.waiters);
        drop(inner);
        self.not_empty.notify_all();
        woken
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    fn unpin(&self, reader: ReaderId, seq: u64) {
        let mut inner = self.inner.lock();
        let Some(front_seq) = inner.oldest_seq() else { return };
        if seq < front_seq {
            return; // already reclaimed
        }
        let idx = (seq - front_seq) as usize;
        if let Some(slot) = inner.slots.get_mut(idx) {
            if slot.readby.remove(&reader) && slot.readby.is_empty() {
                slot.descriptor_refcount = 0;
            }
        }
        self.reclaim_tail(&mut inner);
        drop(inner);
        self.space_available.notify_all();
    }

    /// Pops slots from the front while they have no remaining interested
    /// readers, freeing their space and releasing their tuple bytes.
    fn reclaim_tail(&self, inner: &mut Inner) {
        while let Some(front) = inner.slots.front() {
            if !front.readby.is_empty() || front.descriptor_refcount != 0 {
                break;
            }
            let popped = inner.slots.pop_front().unwrap();
            self.live_descriptor_bytes
                .fetch_sub(popped.data.len() as u64, Ordering::Relaxed);
            inner.nonce += 1;
            tracing::trace!(seq = popped.seq, nonce = inner.nonce, "reclaimed tuple slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_reader_sees_every_inserted_tuple() {
        let buf = TupleBuffer::new(8);
        let r = buf.open_reader();
        let readers: HashSet<_> = [r].into_iter().collect();

        buf.insert(Arc::from(&b"a"[..]), readers.clone());
        buf.insert(Arc::from(&b"b"[..]), readers);

        let g1 = buf.pin_next(r).unwrap().unwrap();
        assert_eq!(g1.data(), b"a");
        g1.unpin();

        let g2 = buf.pin_next(r).unwrap().unwrap();
        assert_eq!(g2.data(), b"b");
        g2.unpin();

        assert!(buf.pin_next(r).unwrap().is_none());
    }

    #[test]
    fn slot_is_reclaimed_only_after_all_readers_unpin() {
        let buf = TupleBuffer::new(8);
        let r1 = buf.open_reader();
        let r2 = buf.open_reader();
        let readers: HashSet<_> = [r1, r2].into_iter().collect();
        buf.insert(Arc::from(&b"x"[..]), readers);

        let g1 = buf.pin_next(r1).unwrap().unwrap();
        assert_eq!(buf.len(), 1);
        g1.unpin();
        assert_eq!(buf.len(), 1, "slot must survive until the last reader unpins");

        let g2 = buf.pin_next(r2).unwrap().unwrap();
        g2.unpin();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn reader_not_interested_in_a_slot_skips_it() {
        let buf = TupleBuffer::new(8);
        let r1 = buf.open_reader();
        let r2 = buf.open_reader();

        buf.insert(Arc::from(&b"only-for-r1"[..]), [r1].into_iter().collect());
        buf.insert(Arc::from(&b"for-both"[..]), [r1, r2].into_iter().collect());

        let g = buf.pin_next(r2).unwrap().unwrap();
        assert_eq!(g.data(), b"for-both");
    }

    #[test]
    fn closing_a_reader_releases_its_pending_slots() {
        let buf = TupleBuffer::new(4);
        let r1 = buf.open_reader();
        let r2 = buf.open_reader();
        buf.insert(Arc::from(&b"x"[..]), [r1, r2].into_iter().collect());

        let g1 = buf.pin_next(r1).unwrap().unwrap();
        g1.unpin();
        assert_eq!(buf.len(), 1);

        buf.close_reader(r2);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn unknown_reader_is_an_error() {
        let buf = TupleBuffer::new(4);
        assert!(matches!(buf.pin_next(999), Err(TupleBufError::UnknownReader(999))));
    }

    #[test]
    fn pin_next_blocking_wakes_once_a_matching_slot_is_inserted() {
        let buf = Arc::new(TupleBuffer::new(8));
        let r = buf.open_reader();

        let reader_buf = buf.clone();
        let reader = std::thread::spawn(move || reader_buf.pin_next_blocking(r).unwrap().data().to_vec());

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!reader.is_finished(), "reader should still be parked with nothing inserted yet");

        buf.insert(Arc::from(&b"late"[..]), [r].into_iter().collect());
        assert_eq!(reader.join().unwrap(), b"late");
    }

    #[test]
    fn wait_is_woken_by_insert_without_missing_a_concurrent_publish() {
        let buf = Arc::new(TupleBuffer::new(8));
        let r = buf.open_reader();

        let waiter_buf = buf.clone();
        let waiter = std::thread::spawn(move || waiter_buf.wait(r));

        std::thread::sleep(std::time::Duration::from_millis(50));
        buf.insert(Arc::from(&b"x"[..]), [r].into_iter().collect());

        waiter.join().unwrap().unwrap();
        assert_eq!(buf.pin_next(r).unwrap().unwrap().data(), b"x");
    }

    #[test]
    fn wait_rejects_an_unknown_reader() {
        let buf = TupleBuffer::new(4);
        assert!(matches!(buf.wait(999), Err(TupleBufError::UnknownReader(999))));
    }
}

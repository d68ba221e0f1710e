//! `ipcq` — inter-process streaming substrate.
//!
//! This crate is the facade: it re-exports the public surface of each
//! component crate (grounded in how the teacher's `kaos` crate re-exports
//! its `disruptor` submodules from one `lib.rs`) and wires them into an
//! [`Engine`] that offers exactly the four external interfaces named for
//! this system: a push-side API for producers, a pin-iterate-unpin API for
//! consumers, a batch-ack API tying the two together, and a supervisor-
//! control API (`add_broker`/`remove_broker`/`begin`/`end`/`begin_all`/
//! `end_all`) for starting and stopping Kafka ingest.
//!
//! The SQL planner/executor, JSON codec, geodetic math, distributed commit,
//! connection-pool protocol, and combiner logic that sit on either side of
//! this substrate are out of scope and are not modeled here at all; callers
//! of `Engine` play those roles themselves.

use std::collections::HashSet;
use std::sync::Arc;

pub use ipcq_batch::{BatchCoordinator, BatchError, BatchId};
pub use ipcq_broker::{Broker, BrokerMetrics, Source as BrokerSource};
pub use ipcq_catalog::{
    BrokerRow, CatalogError, CatalogStore, ConsumerRow, InMemoryStore, OffsetsRow, RowFormat,
};
pub use ipcq_dsm::{DsmError, Handle as DsmHandle, Registry as DsmRegistry, Segment as DsmSegment};
pub use ipcq_ingest::{IngestError, IngestSupervisor};
pub use ipcq_queue::{IpcQueue, QueueError};
pub use ipcq_slab::{BlockHandle, Slab, SlabError};
pub use ipcq_tuplebuf::{PinGuard, ReaderId, TupleBufError, TupleBuffer};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Dsm(#[from] DsmError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    TupleBuf(#[from] TupleBufError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// A producer's handle onto its own queue. Pushing a row does not by
/// itself guarantee any reader has seen it — call [`Producer::push_batch`]
/// and wait on the returned [`BatchId`] for that.
pub struct Producer {
    queue: Arc<IpcQueue>,
    batches: Arc<BatchCoordinator>,
}

impl Producer {
    /// Pushes every row in `rows` onto this producer's queue, registers a
    /// batch expecting one worker-ack per `(reader, row)` pair, and returns
    /// its id. The caller acks the rows itself on the consumer side by
    /// calling [`Engine::ack_batch`] once done processing, and can then
    /// block on [`Engine::wait_for_batch`].
    pub fn push_batch(&self, rows: &[Vec<u8>], num_readers: u64) -> Result<BatchId, EngineError> {
        for row in rows {
            self.queue.push(row)?;
        }
        Ok(self.batches.create(num_readers, rows.len() as u64))
    }
}

/// Top-level wiring: one DSM registry, one shared tuple buffer fanning out
/// to every consumer, one batch coordinator, one catalog, and an ingest
/// supervisor driving Kafka-sourced producers. A real deployment runs the
/// broker (`ipcq-broker`'s binary) as a separate process attached to the
/// same DSM segments; `Engine` here runs it as an in-process background
/// thread for embedding and for tests, since nothing about the broker's
/// logic depends on which process it executes in.
pub struct Engine {
    pub dsm: DsmRegistry,
    pub catalog: Arc<dyn CatalogStore>,
    pub batches: Arc<BatchCoordinator>,
    pub buffer: Arc<TupleBuffer>,
    pub ingest: IngestSupervisor,
    producers: std::sync::Mutex<Vec<Arc<IpcQueue>>>,
}

impl Engine {
    pub fn open(base_dir: impl AsRef<std::path::Path>, buffer_capacity: usize) -> Result<Self, EngineError> {
        let dsm = DsmRegistry::open_or_create(base_dir)?;
        let catalog: Arc<dyn CatalogStore> = Arc::new(InMemoryStore::new());
        let buffer = Arc::new(TupleBuffer::new(buffer_capacity));
        Ok(Self {
            ingest: IngestSupervisor::new(catalog.clone(), Arc::new(IpcQueue::new(1 << 16))),
            dsm,
            catalog,
            batches: Arc::new(BatchCoordinator::new()),
            buffer,
            producers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Registers a new producer with its own queue of `queue_capacity`
    /// bytes.
    pub fn register_producer(&self, queue_capacity: usize) -> Producer {
        let queue = Arc::new(IpcQueue::new(queue_capacity));
        self.producers.lock().unwrap().push(queue.clone());
        Producer { queue, batches: self.batches.clone() }
    }

    pub fn open_consumer(&self) -> ReaderId {
        self.buffer.open_reader()
    }

    pub fn close_consumer(&self, reader: ReaderId) {
        self.buffer.close_reader(reader);
    }

    /// Builds a broker over every producer registered so far, all fanning
    /// out to every reader currently open. Real partitioning of which
    /// readers see which producer's rows belongs to the catalog/CQ layer
    /// (out of scope here, same as [`TupleBuffer::insert`]'s caller-
    /// supplied readers set).
    pub fn make_broker(&self, readers: HashSet<ReaderId>) -> Broker {
        let sources = self
            .producers
            .lock()
            .unwrap()
            .iter()
            .map(|q| BrokerSource { queue: q.clone(), readers: readers.clone() })
            .collect();
        Broker::new(sources, self.buffer.clone())
    }

    pub fn pin_next(&self, reader: ReaderId) -> Result<Option<PinGuard<'_>>, EngineError> {
        Ok(self.buffer.pin_next(reader)?)
    }

    /// Records that `count` rows from `batch` have been processed by a
    /// worker (`is_worker = true`) or a combiner (`is_worker = false`).
    pub fn ack_batch(&self, batch: BatchId, count: u64, is_worker: bool) -> Result<(), EngineError> {
        Ok(self.batches.mark_processed(batch, count, is_worker)?)
    }

    pub fn wait_for_batch(&self, batch: BatchId) -> Result<(), EngineError> {
        Ok(self.batches.wait_and_remove(batch)?)
    }

    // Supervisor-control API: thin forwarders onto `ingest`, named after
    // the `ingest.*` RPCs in the external interface table so callers don't
    // need to reach through the `ingest` field themselves.

    pub fn add_broker(&self, name: impl Into<String>, brokers: impl Into<String>) -> Result<(), EngineError> {
        Ok(self.ingest.add_broker(name, brokers)?)
    }

    pub fn remove_broker(&self, name: &str) -> Result<(), EngineError> {
        Ok(self.ingest.remove_broker(name)?)
    }

    pub fn begin(&self, consumer: ConsumerRow) -> Result<(), EngineError> {
        Ok(self.ingest.begin(consumer)?)
    }

    pub fn end(&self, consumer_id: u32) -> Result<(), EngineError> {
        Ok(self.ingest.end(consumer_id)?)
    }

    pub fn begin_all(&self) -> Result<(), EngineError> {
        Ok(self.ingest.begin_all()?)
    }

    pub fn end_all(&self) -> Result<(), EngineError> {
        Ok(self.ingest.end_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_route_pin_ack_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path(), 16).unwrap();

        let reader = engine.open_consumer();
        let producer = engine.register_producer(4096);

        let batch = producer
            .push_batch(&[b"row-a".to_vec(), b"row-b".to_vec()], 1)
            .unwrap();

        let readers: HashSet<_> = [reader].into_iter().collect();
        let broker = engine.make_broker(readers);
        let routed = broker.drain_once();
        assert_eq!(routed, 2);

        let g1 = engine.pin_next(reader).unwrap().unwrap();
        assert_eq!(g1.data(), b"row-a");
        g1.unpin();
        engine.ack_batch(batch, 1, true).unwrap();

        let g2 = engine.pin_next(reader).unwrap().unwrap();
        assert_eq!(g2.data(), b"row-b");
        g2.unpin();
        engine.ack_batch(batch, 1, true).unwrap();

        engine.wait_for_batch(batch).unwrap();
    }
}

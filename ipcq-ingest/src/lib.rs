//! Ingest supervisor.
//!
//! Ported from `pipeline_kafka.c`'s consumer-process management: each
//! `(relation, topic)` pair the catalog knows about is served by a pool of
//! worker processes, one per partition group, each polling its assigned
//! partitions and pushing decoded rows into the shared-memory ring the rest
//! of the system reads from, committing its offset once a batch is
//! acknowledged.
//!
//! The original launches real child processes via the postmaster's
//! `bgworker` machinery. This port spawns one `std::thread` per worker
//! instead — the supervised start/stop/offset-commit lifecycle is
//! unchanged, but a single test process can't literally fork a worker the
//! way a PipelineDB backend does, and a thread gets us the same isolation
//! properties (a worker's panic can't corrupt another's consumer state)
//! without needing its own IPC channel back to the catalog. The driving
//! loop shape (signal check + periodic work + graceful shutdown) is
//! grounded in `kaos-driver`'s `main.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ipcq_catalog::{CatalogError, CatalogStore, ConsumerRow, CONSUMER_TIMEOUT_MS};
use ipcq_queue::IpcQueue;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::{ClientConfig, Message};
use thiserror::Error;

/// Exit-kind taxonomy for the supervisor's control API, matching the
/// richer error kinds named for the external interface rather than a
/// single opaque `anyhow::Error`.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("no brokers configured")]
    NoBrokers,
    #[error("unknown consumer id {0}")]
    UnknownConsumer(u32),
    #[error("broker {0:?} is already registered")]
    DuplicateBroker(String),
    #[error("ingest target must be a static stream relation, got {0:?}")]
    TargetMustBeStaticStream(String),
    #[error("could not reach kafka source: {0}")]
    SourceUnreachable(String),
    #[error("timed out fetching cluster metadata")]
    MetadataTimeout,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

struct Worker {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Supervises ingest worker groups. Holds no Kafka connections itself; each
/// worker opens its own consumer, matching the original's one-consumer-
/// per-process model.
pub struct IngestSupervisor {
    catalog: Arc<dyn CatalogStore>,
    target_queue: Arc<IpcQueue>,
    /// One entry per running consumer group; the `Vec` holds one `Worker`
    /// per partition-group member (group size == that consumer's
    /// `parallelism`).
    workers: parking_lot::Mutex<HashMap<u32, Vec<Worker>>>,
}

impl IngestSupervisor {
    pub fn new(catalog: Arc<dyn CatalogStore>, target_queue: Arc<IpcQueue>) -> Self {
        Self {
            catalog,
            target_queue,
            workers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn add_broker(&self, name: impl Into<String>, brokers: impl Into<String>) -> Result<(), IngestError> {
        let name = name.into();
        self.catalog
            .upsert_broker(name.clone(), ipcq_catalog::BrokerRow { brokers: brokers.into() })
            .map_err(|e| match e {
                CatalogError::DuplicateBroker(name) => IngestError::DuplicateBroker(name),
                other => IngestError::Catalog(other),
            })
    }

    /// `ingest.remove_broker` from the external interface table: drops the
    /// named broker entry. Does not touch any already-running consumer
    /// group — the original likewise only affects future `begin` calls.
    pub fn remove_broker(&self, name: &str) -> Result<(), IngestError> {
        self.catalog.remove_broker(name).map_err(IngestError::from)
    }

    /// `ingest.begin`: upserts the consumer row, validates the target is a
    /// registered stream and the source is reachable, then launches a
    /// worker group of size `consumer.parallelism`. A no-op if this
    /// consumer id is already running.
    pub fn begin(&self, consumer: ConsumerRow) -> Result<(), IngestError> {
        if self.is_running(consumer.id) {
            return Ok(());
        }
        self.catalog.insert_consumer(consumer.clone())?;
        if let Err(e) = self.spawn_group(&consumer) {
            // Roll back the row so a failed `begin` doesn't leave a
            // consumer that `begin_all` will keep trying, and failing, to
            // launch forever.
            let _ = self.catalog.remove_consumer(consumer.id);
            return Err(e);
        }
        Ok(())
    }

    /// `ingest.end`: removes the consumer row and terminates every worker
    /// in its group.
    pub fn end(&self, id: u32) -> Result<(), IngestError> {
        self.catalog.remove_consumer(id)?;
        self.stop_group(id)
    }

    /// `ingest.begin_all`: launches a group for every persisted consumer
    /// not already running. Keeps going past a failed launch so one bad
    /// consumer row can't block the rest; returns the first error
    /// encountered, if any.
    pub fn begin_all(&self) -> Result<(), IngestError> {
        let mut first_err = None;
        for consumer in self.catalog.all_consumers() {
            if self.is_running(consumer.id) {
                continue;
            }
            if let Err(e) = self.spawn_group(&consumer) {
                tracing::warn!(consumer = consumer.id, error = %e, "failed to launch persisted consumer");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// `ingest.end_all`: terminates every running group, but — unlike
    /// `end` — leaves the consumer rows in the catalog so a later
    /// `begin_all` resumes them.
    pub fn end_all(&self) -> Result<(), IngestError> {
        let ids: Vec<u32> = self.workers.lock().keys().copied().collect();
        for id in ids {
            self.stop_group(id)?;
        }
        Ok(())
    }

    pub fn is_running(&self, id: u32) -> bool {
        self.workers.lock().get(&id).is_some_and(|group| !group.is_empty())
    }

    fn bootstrap_servers(&self) -> Result<String, IngestError> {
        let brokers = self.catalog.all_brokers();
        if brokers.is_empty() {
            return Err(IngestError::NoBrokers);
        }
        Ok(brokers.iter().map(|b| b.brokers.as_str()).collect::<Vec<_>>().join(","))
    }

    /// Resolves brokers and partition metadata, then spawns one worker
    /// thread per partition group (`consumer.parallelism` of them), each
    /// responsible for the partitions `p` where `p mod parallelism ==
    /// worker_id`, per §4.7's partition-group assignment.
    fn spawn_group(&self, consumer: &ConsumerRow) -> Result<(), IngestError> {
        if !self.catalog.is_stream(&consumer.relation) {
            return Err(IngestError::TargetMustBeStaticStream(consumer.relation.clone()));
        }
        let brokers = self.bootstrap_servers()?;
        let partition_count = fetch_partition_count(&brokers, &consumer.topic)?;
        let parallelism = consumer.parallelism.max(1) as usize;

        let mut group = Vec::with_capacity(parallelism);
        for worker_id in 0..parallelism {
            let partitions: Vec<i32> = (0..partition_count as i32)
                .filter(|p| (*p as usize) % parallelism == worker_id)
                .collect();
            if partitions.is_empty() {
                continue;
            }

            let shutdown = Arc::new(AtomicBool::new(false));
            let worker_shutdown = shutdown.clone();
            let queue = self.target_queue.clone();
            let catalog = self.catalog.clone();
            let id = consumer.id;
            let topic = consumer.topic.clone();
            let brokers = brokers.clone();
            let batch_size = consumer.batch_size;

            let handle = thread::Builder::new()
                .name(format!("ipcq-ingest-{id}-{worker_id}"))
                .spawn(move || {
                    run_consumer_loop(id, &topic, &brokers, batch_size, partitions, queue, catalog, worker_shutdown)
                })
                .expect("failed to spawn ingest worker thread");
            group.push(Worker { shutdown, handle });
        }

        tracing::info!(consumer = consumer.id, topic = %consumer.topic, workers = group.len(), "started ingest worker group");
        self.workers.lock().insert(consumer.id, group);
        Ok(())
    }

    fn stop_group(&self, id: u32) -> Result<(), IngestError> {
        let group = self
            .workers
            .lock()
            .remove(&id)
            .ok_or(IngestError::UnknownConsumer(id))?;
        for worker in group {
            worker.shutdown.store(true, Ordering::Release);
            worker.handle.join().expect("ingest worker thread panicked");
        }
        tracing::info!(consumer = id, "stopped ingest worker group");
        Ok(())
    }
}

/// Connects to `brokers` and fetches `topic`'s metadata, returning its
/// partition count. Used once per `begin`/`begin_all` to size the
/// partition groups before any worker threads are spawned.
fn fetch_partition_count(brokers: &str, topic: &str) -> Result<usize, IngestError> {
    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .create()
        .map_err(|e| IngestError::SourceUnreachable(e.to_string()))?;

    let timeout = Duration::from_millis(CONSUMER_TIMEOUT_MS);
    let metadata = consumer.fetch_metadata(Some(topic), timeout).map_err(|e| {
        let msg = e.to_string();
        if msg.to_lowercase().contains("timed out") {
            IngestError::MetadataTimeout
        } else {
            IngestError::SourceUnreachable(msg)
        }
    })?;

    let topic_meta = metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .ok_or_else(|| IngestError::SourceUnreachable(format!("topic {topic:?} not found")))?;
    Ok(topic_meta.partitions().len())
}

fn run_consumer_loop(
    id: u32,
    topic: &str,
    brokers: &str,
    batch_size: u32,
    partitions: Vec<i32>,
    queue: Arc<IpcQueue>,
    catalog: Arc<dyn CatalogStore>,
    shutdown: Arc<AtomicBool>,
) {
    let consumer: BaseConsumer = match ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", format!("ipcq-consumer-{id}"))
        .set("enable.auto.commit", "false")
        .create()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(consumer = id, error = %e, "failed to create kafka consumer");
            return;
        }
    };

    // Partitions are assigned directly rather than subscribed to: the
    // partition-group split is computed by the supervisor, not by Kafka's
    // consumer-group rebalancing, so each worker must own exactly its
    // `p mod parallelism == worker_id` set regardless of what else is
    // running.
    let mut tpl = TopicPartitionList::new();
    for &partition in &partitions {
        let offset = catalog
            .offset(id, partition)
            .map(Offset::Offset)
            .unwrap_or(Offset::End);
        if let Err(e) = tpl.add_partition_offset(topic, partition, offset) {
            tracing::error!(consumer = id, partition, error = %e, "failed to stage partition offset");
            return;
        }
    }
    if let Err(e) = consumer.assign(&tpl) {
        tracing::error!(consumer = id, error = %e, "failed to assign partitions");
        return;
    }

    let timeout = Duration::from_millis(CONSUMER_TIMEOUT_MS);
    let mut in_batch = 0u32;
    let mut last_partition_offsets: HashMap<i32, i64> = HashMap::new();

    while !shutdown.load(Ordering::Acquire) {
        match consumer.poll(timeout) {
            Some(Ok(message)) => {
                if let Some(payload) = message.payload() {
                    if queue.push(payload).is_err() {
                        tracing::warn!(consumer = id, "target queue rejected oversized message, dropping");
                    }
                }
                last_partition_offsets.insert(message.partition(), message.offset());
                in_batch += 1;
                if in_batch >= batch_size {
                    commit_offsets(id, &catalog, &last_partition_offsets);
                    in_batch = 0;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(consumer = id, error = %e, "kafka poll error");
            }
            None => {
                if in_batch > 0 {
                    commit_offsets(id, &catalog, &last_partition_offsets);
                    in_batch = 0;
                }
            }
        }
    }
    if in_batch > 0 {
        commit_offsets(id, &catalog, &last_partition_offsets);
    }
}

fn commit_offsets(id: u32, catalog: &Arc<dyn CatalogStore>, offsets: &HashMap<i32, i64>) {
    for (&partition, &offset) in offsets {
        catalog.commit_offset(ipcq_catalog::OffsetsRow {
            consumer_id: id,
            partition,
            offset,
        });
    }
}

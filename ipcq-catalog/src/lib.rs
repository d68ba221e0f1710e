//! Catalog glue for the ingest supervisor.
//!
//! Ported from `pipeline_kafka.c`'s three catalog relations: the consumer
//! table (one row per `(relation, topic)` ingest target), the broker table
//! (known Kafka broker lists), and the offsets table (durable per-partition
//! read position). The original stores these as ordinary Postgres tables
//! reached through the executor; this crate models the same rows behind a
//! storage-backend trait (grounded in the pack's `ringwal-store` crate,
//! which separates its record shape from how it is persisted) so the
//! supervisor doesn't care whether the backing store is in memory, a file,
//! or eventually a real table.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONSUMER_RELATION: &str = "pipeline_kafka_consumers";
pub const OFFSETS_RELATION: &str = "pipeline_kafka_offsets";
pub const BROKER_RELATION: &str = "pipeline_kafka_brokers";

pub const NUM_CONSUMERS_INIT: u32 = 4;
pub const NUM_CONSUMERS_MAX: u32 = 64;
pub const DEFAULT_PARALLELISM: u32 = 1;
pub const MAX_CONSUMER_PROCS: u32 = 32;
pub const CONSUMER_TIMEOUT_MS: u64 = 1000;
pub const CONSUMER_BATCH_SIZE: u32 = 1000;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("invalid row format {0:?}, expected one of csv, json, text")]
    InvalidFormat(String),
    #[error("consumer already exists for relation {relation:?} topic {topic:?}")]
    DuplicateConsumer { relation: String, topic: String },
    #[error("unknown consumer id {0}")]
    UnknownConsumer(u32),
    #[error("broker {0:?} is already registered")]
    DuplicateBroker(String),
    #[error("unknown broker {0:?}")]
    UnknownBroker(String),
    #[error("parallelism {0} exceeds MAX_CONSUMER_PROCS ({MAX_CONSUMER_PROCS})")]
    ParallelismTooHigh(u32),
}

/// Row format accepted for a consumer's incoming Kafka messages. Modeled as
/// an enum (supplemented over the distilled spec) rather than an arbitrary
/// string, matching the `OPTION_FORMAT` constraint the original only
/// enforces loosely at the SQL option-parsing boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowFormat {
    Csv,
    Json,
    Text,
}

impl RowFormat {
    pub fn parse(s: &str) -> Result<Self, CatalogError> {
        match s {
            "csv" => Ok(RowFormat::Csv),
            "json" => Ok(RowFormat::Json),
            "text" => Ok(RowFormat::Text),
            other => Err(CatalogError::InvalidFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerRow {
    pub id: u32,
    pub relation: String,
    pub topic: String,
    pub format: RowFormat,
    pub delimiter: Option<char>,
    pub batch_size: u32,
    pub parallelism: u32,
}

impl ConsumerRow {
    pub fn validate(
        id: u32,
        relation: impl Into<String>,
        topic: impl Into<String>,
        format: &str,
        delimiter: Option<char>,
        batch_size: u32,
        parallelism: u32,
    ) -> Result<Self, CatalogError> {
        if parallelism > MAX_CONSUMER_PROCS {
            return Err(CatalogError::ParallelismTooHigh(parallelism));
        }
        Ok(ConsumerRow {
            id,
            relation: relation.into(),
            topic: topic.into(),
            format: RowFormat::parse(format)?,
            delimiter,
            batch_size: if batch_size == 0 { CONSUMER_BATCH_SIZE } else { batch_size },
            parallelism: if parallelism == 0 { DEFAULT_PARALLELISM } else { parallelism },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRow {
    pub brokers: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct OffsetsRow {
    pub consumer_id: u32,
    pub partition: i32,
    pub offset: i64,
}

/// Storage backend trait, separating the catalog's record shapes from how
/// they're persisted. `InMemoryStore` below is the only implementation this
/// crate ships; a durable backend (sqlite, a file-backed table) can be added
/// later without touching `IngestCatalog`'s API.
pub trait CatalogStore: Send + Sync {
    fn insert_consumer(&self, row: ConsumerRow) -> Result<(), CatalogError>;
    fn remove_consumer(&self, id: u32) -> Result<ConsumerRow, CatalogError>;
    fn consumer(&self, id: u32) -> Option<ConsumerRow>;
    fn all_consumers(&self) -> Vec<ConsumerRow>;

    fn upsert_broker(&self, name: String, row: BrokerRow) -> Result<(), CatalogError>;
    fn remove_broker(&self, name: &str) -> Result<(), CatalogError>;
    fn broker(&self, name: &str) -> Option<BrokerRow>;
    fn all_brokers(&self) -> Vec<BrokerRow>;

    fn commit_offset(&self, row: OffsetsRow);
    fn offset(&self, consumer_id: u32, partition: i32) -> Option<i64>;

    /// Registers `relation` as a valid ingest target. `ingest.begin` checks
    /// this before launching a consumer group: the original only allows
    /// ingest to write into a stream relation, never an ordinary static
    /// table, and rejects the attempt with `target-must-be-static-stream`
    /// otherwise. The full relation-kind catalog that check reads from is
    /// out of scope here, so callers register the streams they intend to
    /// ingest into directly.
    fn register_stream(&self, relation: String);
    fn is_stream(&self, relation: &str) -> bool;
}

#[derive(Default)]
pub struct InMemoryStore {
    consumers: RwLock<HashMap<u32, ConsumerRow>>,
    brokers: RwLock<HashMap<String, BrokerRow>>,
    offsets: RwLock<HashMap<(u32, i32), i64>>,
    streams: RwLock<std::collections::HashSet<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CatalogStore for InMemoryStore {
    fn insert_consumer(&self, row: ConsumerRow) -> Result<(), CatalogError> {
        let mut consumers = self.consumers.write();
        if consumers
            .values()
            .any(|c| c.relation == row.relation && c.topic == row.topic)
        {
            return Err(CatalogError::DuplicateConsumer {
                relation: row.relation,
                topic: row.topic,
            });
        }
        consumers.insert(row.id, row);
        Ok(())
    }

    fn remove_consumer(&self, id: u32) -> Result<ConsumerRow, CatalogError> {
        self.consumers
            .write()
            .remove(&id)
            .ok_or(CatalogError::UnknownConsumer(id))
    }

    fn consumer(&self, id: u32) -> Option<ConsumerRow> {
        self.consumers.read().get(&id).cloned()
    }

    fn all_consumers(&self) -> Vec<ConsumerRow> {
        self.consumers.read().values().cloned().collect()
    }

    fn upsert_broker(&self, name: String, row: BrokerRow) -> Result<(), CatalogError> {
        let mut brokers = self.brokers.write();
        if brokers.contains_key(&name) {
            return Err(CatalogError::DuplicateBroker(name));
        }
        brokers.insert(name, row);
        Ok(())
    }

    fn remove_broker(&self, name: &str) -> Result<(), CatalogError> {
        self.brokers
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CatalogError::UnknownBroker(name.to_string()))
    }

    fn broker(&self, name: &str) -> Option<BrokerRow> {
        self.brokers.read().get(name).cloned()
    }

    fn all_brokers(&self) -> Vec<BrokerRow> {
        self.brokers.read().values().cloned().collect()
    }

    fn commit_offset(&self, row: OffsetsRow) {
        self.offsets.write().insert((row.consumer_id, row.partition), row.offset);
    }

    fn offset(&self, consumer_id: u32, partition: i32) -> Option<i64> {
        self.offsets.read().get(&(consumer_id, partition)).copied()
    }

    fn register_stream(&self, relation: String) {
        self.streams.write().insert(relation);
    }

    fn is_stream(&self, relation: &str) -> bool {
        self.streams.read().contains(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_format() {
        let err = ConsumerRow::validate(1, "events", "events-topic", "xml", None, 0, 0);
        assert!(matches!(err, Err(CatalogError::InvalidFormat(_))));
    }

    #[test]
    fn defaults_fill_in_batch_size_and_parallelism() {
        let row = ConsumerRow::validate(1, "events", "events-topic", "json", None, 0, 0).unwrap();
        assert_eq!(row.batch_size, CONSUMER_BATCH_SIZE);
        assert_eq!(row.parallelism, DEFAULT_PARALLELISM);
    }

    #[test]
    fn duplicate_relation_topic_pair_is_rejected() {
        let store = InMemoryStore::new();
        let row = ConsumerRow::validate(1, "events", "topic-a", "csv", Some(','), 0, 0).unwrap();
        store.insert_consumer(row.clone()).unwrap();
        let row2 = ConsumerRow::validate(2, "events", "topic-a", "csv", Some(','), 0, 0).unwrap();
        assert!(matches!(store.insert_consumer(row2), Err(CatalogError::DuplicateConsumer { .. })));
    }

    #[test]
    fn duplicate_broker_is_a_typed_error() {
        let store = InMemoryStore::new();
        store
            .upsert_broker("default".into(), BrokerRow { brokers: "localhost:9092".into() })
            .unwrap();
        let err = store.upsert_broker("default".into(), BrokerRow { brokers: "other:9092".into() });
        assert!(matches!(err, Err(CatalogError::DuplicateBroker(_))));
    }

    #[test]
    fn offsets_round_trip() {
        let store = InMemoryStore::new();
        store.commit_offset(OffsetsRow { consumer_id: 1, partition: 0, offset: 42 });
        assert_eq!(store.offset(1, 0), Some(42));
        assert_eq!(store.offset(1, 1), None);
    }

    #[test]
    fn removing_an_unknown_broker_is_a_typed_error() {
        let store = InMemoryStore::new();
        assert!(matches!(store.remove_broker("default"), Err(CatalogError::UnknownBroker(_))));
        store
            .upsert_broker("default".into(), BrokerRow { brokers: "localhost:9092".into() })
            .unwrap();
        store.remove_broker("default").unwrap();
        assert!(store.broker("default").is_none());
    }

    #[test]
    fn all_brokers_lists_every_registered_entry() {
        let store = InMemoryStore::new();
        store
            .upsert_broker("a".into(), BrokerRow { brokers: "host-a:9092".into() })
            .unwrap();
        store
            .upsert_broker("b".into(), BrokerRow { brokers: "host-b:9092".into() })
            .unwrap();
        assert_eq!(store.all_brokers().len(), 2);
    }

    #[test]
    fn stream_registration_is_checked_by_name() {
        let store = InMemoryStore::new();
        assert!(!store.is_stream("events"));
        store.register_stream("events".into());
        assert!(store.is_stream("events"));
    }
}

//! Partitioned, at-least-once message channels with consumer-group offsets.
//!
//! A consumer resumes from its group's committed offset for every assigned partition.
//! Polling advances a local cursor only; a message is acknowledged for the group by
//! `commit`, so anything polled but not committed is delivered again to the next
//! consumer of the same group.

pub mod memory;
pub mod sqlite_log;

#[cfg(feature = "kafka")]
pub mod kafka;

use crate::config::{ChannelBackend, Config};
use crate::db::DatabaseManager;
use crate::error::{Result, ScraperError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryBroker;
pub use sqlite_log::SqliteLog;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn topic(&self) -> &str;

    /// Publish to the next partition in round-robin order.
    async fn publish(&self, payload: &[u8]) -> Result<()>;

    /// Publish to the partition owned by `key`.
    async fn publish_keyed(&self, key: &str, payload: &[u8]) -> Result<()>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn topic(&self) -> &str;

    /// Wait up to `timeout` for the next message. `Ok(None)` is an empty poll, not an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>>;

    /// Acknowledge `message` and everything before it in its partition.
    async fn commit(&mut self, message: &Message) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Who is consuming what.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub group_id: String,
    pub topic: String,
    /// Static partition assignment; `None` consumes every partition.
    pub partitions: Option<Vec<u32>>,
}

impl ConsumerOptions {
    pub fn new(group_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            partitions: None,
        }
    }

    pub fn with_partitions(mut self, partitions: Vec<u32>) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Assigned partitions, filtered to those that exist.
    pub(crate) fn assigned(&self, partition_count: u32) -> Vec<u32> {
        match &self.partitions {
            Some(list) => {
                let mut list: Vec<u32> = list
                    .iter()
                    .copied()
                    .filter(|p| *p < partition_count)
                    .collect();
                list.sort_unstable();
                list.dedup();
                list
            }
            None => (0..partition_count).collect(),
        }
    }
}

/// Stable partition for a message key.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    head % partitions.max(1)
}

/// Split `0..partitions` across `workers` instances, round-robin.
pub fn assign_partitions(partitions: u32, workers: usize) -> Vec<Vec<u32>> {
    let workers = workers.max(1);
    let mut out = vec![Vec::new(); workers];
    for p in 0..partitions {
        out[p as usize % workers].push(p);
    }
    out
}

/// The configured transport, able to hand out producers and consumers for any topic.
#[derive(Clone)]
pub enum Channels {
    Memory(MemoryBroker),
    Sqlite(SqliteLog),
    #[cfg(feature = "kafka")]
    Kafka(crate::config::KafkaConfig),
}

impl Channels {
    /// Build the transport named in the configuration. Failure here is fatal for workers.
    pub async fn from_config(config: &Config) -> Result<Self> {
        match config.channel.backend {
            ChannelBackend::Memory => Ok(Channels::Memory(MemoryBroker::new(config.channel.partitions))),
            ChannelBackend::Sqlite => {
                let db = DatabaseManager::open_file(&config.channel.path, &config.storage)
                    .await
                    .map_err(|e| ScraperError::transport(format!("channel log unavailable: {e}")))?;
                Ok(Channels::Sqlite(SqliteLog::open(&db, config.channel.partitions).await?))
            }
            #[cfg(feature = "kafka")]
            ChannelBackend::Kafka => Ok(Channels::Kafka(config.kafka.clone())),
            #[cfg(not(feature = "kafka"))]
            ChannelBackend::Kafka => Err(ScraperError::Config(
                "kafka backend requires building with the `kafka` feature".to_string(),
            )),
        }
    }

    /// Partition count when known locally; the broker owns it for Kafka.
    pub fn partitions(&self) -> Option<u32> {
        match self {
            Channels::Memory(broker) => Some(broker.partitions()),
            Channels::Sqlite(log) => Some(log.partitions()),
            #[cfg(feature = "kafka")]
            Channels::Kafka(_) => None,
        }
    }

    pub fn producer(&self, topic: &str) -> Result<Arc<dyn Producer>> {
        let producer: Arc<dyn Producer> = match self {
            Channels::Memory(broker) => Arc::new(broker.producer(topic)),
            Channels::Sqlite(log) => Arc::new(log.producer(topic)),
            #[cfg(feature = "kafka")]
            Channels::Kafka(config) => Arc::new(kafka::KafkaProducer::new(config, topic)?),
        };
        Ok(producer)
    }

    pub async fn consumer(&self, options: ConsumerOptions) -> Result<Box<dyn Consumer>> {
        let consumer: Box<dyn Consumer> = match self {
            Channels::Memory(broker) => Box::new(broker.consumer(options)?),
            Channels::Sqlite(log) => Box::new(log.consumer(options).await?),
            #[cfg(feature = "kafka")]
            Channels::Kafka(config) => Box::new(kafka::KafkaConsumer::new(config, &options)?),
        };
        Ok(consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_for_key_is_stable() {
        let a = partition_for_key("r1", 8);
        assert_eq!(a, partition_for_key("r1", 8));
        assert!(a < 8);
        assert_eq!(partition_for_key("anything", 1), 0);
        assert_eq!(partition_for_key("anything", 0), 0);
    }

    #[test]
    fn test_assign_partitions() {
        assert_eq!(assign_partitions(4, 2), vec![vec![0, 2], vec![1, 3]]);
        assert_eq!(assign_partitions(2, 3), vec![vec![0], vec![1], vec![]]);
        assert_eq!(assign_partitions(3, 0), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_assigned_filters_unknown_partitions() {
        let opts = ConsumerOptions::new("g", "t").with_partitions(vec![3, 1, 9, 1]);
        assert_eq!(opts.assigned(4), vec![1, 3]);
        assert_eq!(ConsumerOptions::new("g", "t").assigned(2), vec![0, 1]);
    }
}

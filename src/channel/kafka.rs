use super::{Consumer, ConsumerOptions, Message, Producer};
use crate::config::KafkaConfig;
use crate::error::{Result, ScraperError};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info};

fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.brokers);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        client
            .set("security.protocol", "SASL_PLAINTEXT")
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }
    client
}

/// Kafka producer. Keyed messages are placed by the broker client's partitioner.
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig, topic: &str) -> Result<Self> {
        let producer: FutureProducer = base_config(config)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()?;
        info!("Kafka producer for '{}' connected to {}", topic, config.brokers);
        Ok(Self {
            producer,
            topic: topic.to_string(),
            send_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::<(), [u8]>::to(&self.topic).payload(payload);
        let (partition, offset) = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| ScraperError::from(e))?;
        debug!("Published {}[{}]@{}", self.topic, partition, offset);
        Ok(())
    }

    async fn publish_keyed(&self, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);
        let (partition, offset) = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| ScraperError::from(e))?;
        debug!("Published {}[{}]@{} key={}", self.topic, partition, offset, key);
        Ok(())
    }
}

/// Kafka consumer with auto-commit disabled; offsets move only through `commit`.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig, options: &ConsumerOptions) -> Result<Self> {
        let consumer: StreamConsumer = base_config(config)
            .set("group.id", &options.group_id)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()?;

        match &options.partitions {
            Some(partitions) => {
                let mut assignment = TopicPartitionList::new();
                for p in partitions {
                    assignment.add_partition_offset(&options.topic, *p as i32, Offset::Stored)?;
                }
                consumer.assign(&assignment)?;
            }
            None => consumer.subscribe(&[options.topic.as_str()])?,
        }
        info!(
            "Kafka consumer '{}' attached to '{}'",
            options.group_id, options.topic
        );
        Ok(Self {
            consumer,
            topic: options.topic.clone(),
        })
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(msg)) => {
                let published_at = msg
                    .timestamp()
                    .to_millis()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or_else(Utc::now);
                Ok(Some(Message {
                    topic: msg.topic().to_string(),
                    partition: msg.partition().max(0) as u32,
                    offset: msg.offset(),
                    key: msg
                        .key()
                        .and_then(|k| std::str::from_utf8(k).ok())
                        .map(str::to_string),
                    payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    published_at,
                }))
            }
        }
    }

    async fn commit(&mut self, message: &Message) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &message.topic,
            message.partition as i32,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Sync)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

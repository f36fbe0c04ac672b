use super::{partition_for_key, Consumer, ConsumerOptions, Message, Producer};
use crate::db::{decode_timestamp, encode_timestamp, DatabaseManager, CHANNEL_MIGRATION};
use crate::error::{Result, ScraperError};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// How often an idle consumer re-checks the log while waiting out a poll timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Durable partitioned log in SQLite, shared by every process that opens the same file.
#[derive(Clone)]
pub struct SqliteLog {
    pool: SqlitePool,
    partitions: u32,
}

impl SqliteLog {
    pub async fn open(db: &DatabaseManager, partitions: u32) -> Result<Self> {
        db.run_migration("channel log", CHANNEL_MIGRATION).await?;
        info!("Channel log ready with {} partitions", partitions.max(1));
        Ok(Self {
            pool: db.pool().clone(),
            partitions: partitions.max(1),
        })
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn producer(&self, topic: &str) -> SqliteLogProducer {
        SqliteLogProducer {
            log: self.clone(),
            topic: topic.to_string(),
            next_partition: AtomicU32::new(0),
        }
    }

    pub async fn consumer(&self, options: ConsumerOptions) -> Result<SqliteLogConsumer> {
        let mut positions = Vec::new();
        for partition in options.assigned(self.partitions) {
            let committed = self
                .committed(&options.group_id, &options.topic, partition)
                .await?;
            positions.push((partition, committed.unwrap_or(0)));
        }
        Ok(SqliteLogConsumer {
            log: self.clone(),
            options,
            positions,
            next_index: 0,
            closed: false,
        })
    }

    pub async fn committed(&self, group_id: &str, topic: &str, partition: u32) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT next_offset FROM channel_offsets WHERE group_id = ? AND topic = ? AND partition_id = ?",
        )
        .bind(group_id)
        .bind(topic)
        .bind(partition as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(offset,)| offset))
    }

    async fn append(&self, topic: &str, partition: u32, key: Option<&str>, payload: &[u8]) -> Result<()> {
        // Offset assignment and insert happen in one statement; SQLite serializes writers.
        sqlx::query(
            "INSERT INTO channel_records (topic, partition_id, record_offset, message_key, payload, published_at)
             SELECT ?1, ?2, COALESCE(MAX(record_offset) + 1, 0), ?3, ?4, ?5
             FROM channel_records WHERE topic = ?1 AND partition_id = ?2",
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(key)
        .bind(payload)
        .bind(encode_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_at(&self, topic: &str, partition: u32, offset: i64) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT record_offset, message_key, payload, published_at FROM channel_records
             WHERE topic = ? AND partition_id = ? AND record_offset >= ?
             ORDER BY record_offset LIMIT 1",
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(offset)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let published_at: String = row.try_get("published_at")?;
        Ok(Some(Message {
            topic: topic.to_string(),
            partition,
            offset: row.try_get("record_offset")?,
            key: row.try_get("message_key")?,
            payload: row.try_get("payload")?,
            published_at: decode_timestamp(&published_at).unwrap_or_else(Utc::now),
        }))
    }
}

pub struct SqliteLogProducer {
    log: SqliteLog,
    topic: String,
    next_partition: AtomicU32,
}

#[async_trait]
impl Producer for SqliteLogProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, payload: &[u8]) -> Result<()> {
        let partition = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.log.partitions;
        self.log.append(&self.topic, partition, None, payload).await?;
        debug!("Published to {}[{}]", self.topic, partition);
        Ok(())
    }

    async fn publish_keyed(&self, key: &str, payload: &[u8]) -> Result<()> {
        let partition = partition_for_key(key, self.log.partitions);
        self.log.append(&self.topic, partition, Some(key), payload).await?;
        debug!("Published to {}[{}] key={}", self.topic, partition, key);
        Ok(())
    }
}

pub struct SqliteLogConsumer {
    log: SqliteLog,
    options: ConsumerOptions,
    positions: Vec<(u32, i64)>,
    next_index: usize,
    closed: bool,
}

impl SqliteLogConsumer {
    async fn try_next(&mut self) -> Result<Option<Message>> {
        let count = self.positions.len();
        for step in 0..count {
            let idx = (self.next_index + step) % count;
            let (partition, position) = self.positions[idx];
            if let Some(message) = self
                .log
                .read_at(&self.options.topic, partition, position)
                .await?
            {
                self.positions[idx].1 = message.offset + 1;
                self.next_index = (idx + 1) % count;
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Consumer for SqliteLogConsumer {
    fn topic(&self) -> &str {
        &self.options.topic
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if self.closed {
            return Err(ScraperError::transport("consumer is closed"));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_next().await? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn commit(&mut self, message: &Message) -> Result<()> {
        if self.closed {
            return Err(ScraperError::transport("consumer is closed"));
        }
        sqlx::query(
            "INSERT INTO channel_offsets (group_id, topic, partition_id, next_offset, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(group_id, topic, partition_id) DO UPDATE SET
                next_offset = MAX(channel_offsets.next_offset, excluded.next_offset),
                updated_at = excluded.updated_at",
        )
        .bind(&self.options.group_id)
        .bind(&message.topic)
        .bind(message.partition as i64)
        .bind(message.offset + 1)
        .bind(encode_timestamp(&Utc::now()))
        .execute(&self.log.pool)
        .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

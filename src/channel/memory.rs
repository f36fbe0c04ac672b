use super::{partition_for_key, Consumer, ConsumerOptions, Message, Producer};
use crate::error::{Result, ScraperError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// In-process broker. Records and group offsets live as long as the broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    partitions: u32,
    state: Mutex<BrokerState>,
    published: Notify,
}

#[derive(Default)]
struct BrokerState {
    // topic -> partition -> records (index == offset)
    logs: HashMap<String, Vec<Vec<Message>>>,
    // (group, topic, partition) -> next offset to deliver
    offsets: HashMap<(String, String, u32), i64>,
}

impl MemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                published: Notify::new(),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    pub fn producer(&self, topic: &str) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
            topic: topic.to_string(),
            next_partition: AtomicU32::new(0),
        }
    }

    pub fn consumer(&self, options: ConsumerOptions) -> Result<MemoryConsumer> {
        let assigned = options.assigned(self.inner.partitions);
        let state = self.lock()?;
        let positions = assigned
            .into_iter()
            .map(|p| {
                let key = (options.group_id.clone(), options.topic.clone(), p);
                (p, state.offsets.get(&key).copied().unwrap_or(0))
            })
            .collect();
        drop(state);
        Ok(MemoryConsumer {
            broker: self.clone(),
            options,
            positions,
            next_index: 0,
            closed: false,
        })
    }

    /// Committed offset (next offset to deliver) for a group, if any.
    pub fn committed(&self, group_id: &str, topic: &str, partition: u32) -> Option<i64> {
        let state = self.lock().ok()?;
        state
            .offsets
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Total records published to `topic` across partitions.
    pub fn len(&self, topic: &str) -> usize {
        self.lock()
            .map(|s| s.logs.get(topic).map(|l| l.iter().map(Vec::len).sum()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Every record of `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Message> {
        self.lock()
            .map(|s| s.logs.get(topic).map(|l| l.concat()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| ScraperError::transport("memory broker state poisoned"))
    }

    fn append(&self, topic: &str, partition: u32, key: Option<&str>, payload: &[u8]) -> Result<i64> {
        let mut state = self.lock()?;
        let log = state
            .logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.inner.partitions as usize]);
        let records = &mut log[partition as usize];
        let offset = records.len() as i64;
        records.push(Message {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.map(str::to_string),
            payload: payload.to_vec(),
            published_at: Utc::now(),
        });
        drop(state);
        self.inner.published.notify_waiters();
        Ok(offset)
    }
}

pub struct MemoryProducer {
    broker: MemoryBroker,
    topic: String,
    next_partition: AtomicU32,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, payload: &[u8]) -> Result<()> {
        let partition = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.broker.partitions();
        let offset = self.broker.append(&self.topic, partition, None, payload)?;
        debug!("Published {}[{}]@{}", self.topic, partition, offset);
        Ok(())
    }

    async fn publish_keyed(&self, key: &str, payload: &[u8]) -> Result<()> {
        let partition = partition_for_key(key, self.broker.partitions());
        let offset = self.broker.append(&self.topic, partition, Some(key), payload)?;
        debug!("Published {}[{}]@{} key={}", self.topic, partition, offset, key);
        Ok(())
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    options: ConsumerOptions,
    // (partition, next offset to read)
    positions: Vec<(u32, i64)>,
    next_index: usize,
    closed: bool,
}

impl MemoryConsumer {
    fn try_next(&mut self) -> Result<Option<Message>> {
        if self.positions.is_empty() {
            return Ok(None);
        }
        let state = self.broker.lock()?;
        let Some(log) = state.logs.get(&self.options.topic) else {
            return Ok(None);
        };
        let count = self.positions.len();
        for step in 0..count {
            let idx = (self.next_index + step) % count;
            let (partition, position) = self.positions[idx];
            if let Some(message) = log[partition as usize].get(position as usize) {
                let message = message.clone();
                self.positions[idx].1 = position + 1;
                self.next_index = (idx + 1) % count;
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn topic(&self) -> &str {
        &self.options.topic
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if self.closed {
            return Err(ScraperError::transport("consumer is closed"));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let broker = self.broker.clone();
        loop {
            // Register for wakeups before checking so a concurrent publish is not missed.
            let notified = broker.inner.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_next()? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, message: &Message) -> Result<()> {
        if self.closed {
            return Err(ScraperError::transport("consumer is closed"));
        }
        let mut state = self.broker.lock()?;
        let key = (
            self.options.group_id.clone(),
            message.topic.clone(),
            message.partition,
        );
        let next = message.offset + 1;
        let entry = state.offsets.entry(key).or_insert(next);
        *entry = (*entry).max(next);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

//! In-process broker
//!
//! Partitioned append-only logs with a delivery cursor and per-entry acks.
//! [`MemoryBroker::reset_delivery`] behaves like a consumer restart: every
//! entry that was never committed is delivered again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{BusError, Message, MessageSource, Publisher, partition_for};

struct Entry {
    key: String,
    value: String,
    timestamp: DateTime<Utc>,
    acked: bool,
}

#[derive(Default)]
struct PartitionLog {
    entries: Vec<Entry>,
    /// Next entry to deliver
    cursor: usize,
}

pub struct MemoryBroker {
    partitions: u32,
    logs: Mutex<HashMap<String, Vec<PartitionLog>>>,
    notify: Notify,
    block: Duration,
    batch: usize,
    closed: AtomicBool,
    fail_publish: AtomicBool,
    fail_poll: AtomicBool,
}

impl MemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            logs: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            block: Duration::from_millis(500),
            batch: 64,
            closed: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            fail_poll: AtomicBool::new(false),
        }
    }

    /// Maximum wait for new messages in one poll
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_poll(&self, fail: bool) {
        self.fail_poll.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Rewind every partition so unacked entries are delivered again
    pub fn reset_delivery(&self) {
        let mut logs = self.lock_logs();
        for log in logs.values_mut().flatten() {
            log.cursor = 0;
        }
        drop(logs);
        self.notify.notify_one();
    }

    /// `(key, value)` pairs published to `topic`, partition by partition
    pub fn published(&self, topic: &str) -> Vec<(String, String)> {
        self.lock_logs()
            .get(topic)
            .map(|parts| {
                parts
                    .iter()
                    .flat_map(|p| p.entries.iter())
                    .map(|e| (e.key.clone(), e.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn committed_count(&self, topic: &str) -> usize {
        self.lock_logs()
            .get(topic)
            .map(|parts| {
                parts
                    .iter()
                    .flat_map(|p| p.entries.iter())
                    .filter(|e| e.acked)
                    .count()
            })
            .unwrap_or(0)
    }

    fn lock_logs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<PartitionLog>>> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.logs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_ready(&self, topics: &[String]) -> Vec<Message> {
        let mut logs = self.lock_logs();
        let mut out = Vec::new();
        for topic in topics {
            let Some(parts) = logs.get_mut(topic) else {
                continue;
            };
            for (partition, log) in parts.iter_mut().enumerate() {
                while log.cursor < log.entries.len() && out.len() < self.batch {
                    let offset = log.cursor;
                    log.cursor += 1;
                    let entry = &log.entries[offset];
                    if entry.acked {
                        continue;
                    }
                    out.push(Message {
                        topic: topic.clone(),
                        partition: partition as i32,
                        offset: offset.to_string(),
                        key: entry.key.clone(),
                        value: entry.value.clone(),
                        timestamp: entry.timestamp,
                    });
                }
            }
        }
        out
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, key: &str, value: &str) -> Result<i32, BusError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("memory broker rejected message".into()));
        }
        let partition = partition_for(key, self.partitions);
        {
            let mut logs = self.lock_logs();
            let parts = logs.entry(topic.to_string()).or_insert_with(|| {
                (0..self.partitions).map(|_| PartitionLog::default()).collect()
            });
            parts[partition as usize].entries.push(Entry {
                key: key.to_string(),
                value: value.to_string(),
                timestamp: Utc::now(),
                acked: false,
            });
        }
        self.notify.notify_one();
        Ok(partition)
    }
}

#[async_trait]
impl MessageSource for MemoryBroker {
    async fn subscribe(&self, _topics: &[String]) -> Result<(), BusError> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(&self, topics: &[String]) -> Result<Vec<Message>, BusError> {
        if self.fail_poll.load(Ordering::SeqCst) {
            return Err(BusError::Poll("memory broker unavailable".into()));
        }
        let ready = self.take_ready(topics);
        if !ready.is_empty() {
            return Ok(ready);
        }
        // Notify keeps a permit, so a publish between the check and here is not lost
        let _ = tokio::time::timeout(self.block, self.notify.notified()).await;
        Ok(self.take_ready(topics))
    }

    async fn commit(&self, message: &Message) -> Result<(), BusError> {
        let offset: usize = message
            .offset
            .parse()
            .map_err(|_| BusError::Commit(format!("bad offset {}", message.offset)))?;
        let mut logs = self.lock_logs();
        let entry = logs
            .get_mut(&message.topic)
            .and_then(|parts| parts.get_mut(message.partition as usize))
            .and_then(|log| log.entries.get_mut(offset))
            .ok_or_else(|| BusError::Commit(format!("unknown offset {}", message.offset)))?;
        entry.acked = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

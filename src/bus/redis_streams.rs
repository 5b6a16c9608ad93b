//! Redis Streams broker
//!
//! Each topic is split into `partitions` streams named `{topic}:{partition}`.
//! Consumption uses a consumer group; commit is `XACK`. Entries read but never
//! acknowledged stay in the group's pending list and are re-read once when a
//! consumer with the same name starts again.
//!
//! `close` drops the broker's connection; later calls fail with
//! [`BusError::Closed`] until `subscribe` reconnects.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tracing::{debug, info, warn};

use super::{BusError, Message, MessageSource, Publisher, partition_for};

const FIELD_KEY: &str = "key";
const FIELD_VALUE: &str = "value";
const FIELD_TS: &str = "ts";

/// Consumer-side settings
#[derive(Debug, Clone)]
pub struct StreamsConsumerConfig {
    pub group: String,
    pub consumer: String,
    pub block_ms: usize,
    pub batch: usize,
}

impl Default for StreamsConsumerConfig {
    fn default() -> Self {
        Self {
            group: "transfer_jobs".to_string(),
            consumer: "transfer_jobs-1".to_string(),
            block_ms: 1000,
            batch: 64,
        }
    }
}

pub struct RedisStreamsBroker {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
    partitions: u32,
    config: StreamsConsumerConfig,
    /// Own pending entries are replayed before new ones
    replay_pending: AtomicBool,
}

impl RedisStreamsBroker {
    pub async fn connect(
        url: &str,
        partitions: u32,
        config: StreamsConsumerConfig,
    ) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(connection_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(connection_err)?;
        info!(partitions, group = %config.group, "Connected to Redis Streams");
        Ok(Self {
            client,
            conn: RwLock::new(Some(conn)),
            partitions: partitions.max(1),
            config,
            replay_pending: AtomicBool::new(true),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.conn.read().unwrap_or_else(|p| p.into_inner()).is_none()
    }

    /// Handle to the shared connection; the lock is never held across `.await`
    fn conn(&self) -> Result<ConnectionManager, BusError> {
        self.conn
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(BusError::Closed)
    }

    pub fn stream_name(topic: &str, partition: i32) -> String {
        format!("{}:{}", topic, partition)
    }

    fn streams(&self, topics: &[String]) -> Vec<String> {
        topics
            .iter()
            .flat_map(|t| (0..self.partitions as i32).map(move |p| Self::stream_name(t, p)))
            .collect()
    }

    fn to_message(stream: &str, entry: &StreamId) -> Option<Message> {
        let (topic, partition) = stream.rsplit_once(':')?;
        let partition = partition.parse().ok()?;
        let key: String = entry.get(FIELD_KEY)?;
        let value: String = entry.get(FIELD_VALUE)?;
        let timestamp = entry
            .get::<i64>(FIELD_TS)
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        Some(Message {
            topic: topic.to_string(),
            partition,
            offset: entry.id.clone(),
            key,
            value,
            timestamp,
        })
    }

    async fn ack(
        &self,
        mut conn: ConnectionManager,
        stream: &str,
        id: &str,
    ) -> Result<(), RedisError> {
        let _: i64 = conn.xack(stream, &self.config.group, &[id]).await?;
        Ok(())
    }
}

fn connection_err(e: RedisError) -> BusError {
    BusError::Connection(e.to_string())
}

#[async_trait]
impl Publisher for RedisStreamsBroker {
    async fn publish(&self, topic: &str, key: &str, value: &str) -> Result<i32, BusError> {
        let partition = partition_for(key, self.partitions);
        let stream = Self::stream_name(topic, partition);
        let ts = Utc::now().timestamp_millis().to_string();
        let mut conn = self.conn()?;

        // XADD reply is the broker ack
        let id: String = conn
            .xadd(
                &stream,
                "*",
                &[(FIELD_KEY, key), (FIELD_VALUE, value), (FIELD_TS, ts.as_str())],
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        debug!(stream = %stream, id = %id, key, "Published");
        Ok(partition)
    }
}

#[async_trait]
impl MessageSource for RedisStreamsBroker {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BusError> {
        let mut conn = match self.conn() {
            Ok(conn) => conn,
            Err(_) => {
                let conn = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(connection_err)?;
                *self.conn.write().unwrap_or_else(|p| p.into_inner()) = Some(conn.clone());
                self.replay_pending.store(true, Ordering::SeqCst);
                info!("Reconnected to Redis Streams");
                conn
            }
        };
        for stream in self.streams(topics) {
            let res: Result<(), RedisError> = conn
                .xgroup_create_mkstream(&stream, &self.config.group, "0")
                .await;
            match res {
                Ok(()) => info!(stream = %stream, group = %self.config.group, "Created consumer group"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(connection_err(e)),
            }
        }
        Ok(())
    }

    async fn poll(&self, topics: &[String]) -> Result<Vec<Message>, BusError> {
        let streams = self.streams(topics);
        let replay = self.replay_pending.swap(false, Ordering::SeqCst);

        let (ids, opts) = if replay {
            // History of this consumer's pending list; BLOCK has no effect here
            (
                vec!["0"; streams.len()],
                StreamReadOptions::default().group(&self.config.group, &self.config.consumer),
            )
        } else {
            (
                vec![">"; streams.len()],
                StreamReadOptions::default()
                    .group(&self.config.group, &self.config.consumer)
                    .count(self.config.batch)
                    .block(self.config.block_ms),
            )
        };

        let mut conn = self.conn()?;
        let reply: Option<StreamReadReply> = conn
            .xread_options(&streams, &ids, &opts)
            .await
            .map_err(|e| {
                if replay {
                    self.replay_pending.store(true, Ordering::SeqCst);
                }
                BusError::Poll(e.to_string())
            })?;

        let mut out = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in &stream.ids {
                match Self::to_message(&stream.key, entry) {
                    Some(message) => out.push(message),
                    None => {
                        // Trimmed or foreign entry: nothing to hand out, drop it from the PEL
                        warn!(stream = %stream.key, id = %entry.id, "Skipping malformed entry");
                        if let Err(e) = self.ack(conn.clone(), &stream.key, &entry.id).await {
                            warn!(error = %e, "Failed to ack malformed entry");
                        }
                    }
                }
            }
        }
        if replay && !out.is_empty() {
            info!(count = out.len(), "Replaying pending entries");
        }
        Ok(out)
    }

    async fn commit(&self, message: &Message) -> Result<(), BusError> {
        let stream = Self::stream_name(&message.topic, message.partition);
        self.ack(self.conn()?, &stream, &message.offset)
            .await
            .map_err(|e| BusError::Commit(e.to_string()))
    }

    async fn close(&self) -> Result<(), BusError> {
        // In-flight calls hold their own clones; the connection ends with the last one
        let conn = self.conn.write().unwrap_or_else(|p| p.into_inner()).take();
        if conn.is_some() {
            info!("Redis Streams connection released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_stream_name() {
        assert_eq!(RedisStreamsBroker::stream_name("transfer", 3), "transfer:3");
    }

    #[test]
    fn test_to_message() {
        let mut map = HashMap::new();
        map.insert(FIELD_KEY.to_string(), redis::Value::Data(b"pubTransfer:x".to_vec()));
        map.insert(FIELD_VALUE.to_string(), redis::Value::Data(b"{}".to_vec()));
        map.insert(FIELD_TS.to_string(), redis::Value::Data(b"1700000000000".to_vec()));
        let entry = StreamId {
            id: "1700000000000-0".to_string(),
            map,
        };

        let msg = RedisStreamsBroker::to_message("transfer:with:colon:2", &entry).unwrap();
        assert_eq!(msg.topic, "transfer:with:colon");
        assert_eq!(msg.partition, 2);
        assert_eq!(msg.offset, "1700000000000-0");
        assert_eq!(msg.key, "pubTransfer:x");
        assert_eq!(msg.timestamp.timestamp_millis(), 1_700_000_000_000);

        let empty = StreamId {
            id: "1-0".to_string(),
            map: HashMap::new(),
        };
        assert!(RedisStreamsBroker::to_message("transfer:0", &empty).is_none());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_publish_poll_ack() {
        let topic = format!("transfer_jobs_test_{}", ulid::Ulid::new());
        let broker = RedisStreamsBroker::connect(
            "redis://127.0.0.1:6379",
            2,
            StreamsConsumerConfig {
                block_ms: 100,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let topics = vec![topic.clone()];
        broker.subscribe(&topics).await.unwrap();
        broker.publish(&topic, "k", "v").await.unwrap();

        let mut got = broker.poll(&topics).await.unwrap();
        if got.is_empty() {
            got = broker.poll(&topics).await.unwrap();
        }
        assert_eq!(got.len(), 1);
        broker.commit(&got[0]).await.unwrap();

        broker.close().await.unwrap();
        assert!(broker.is_closed());
        assert!(matches!(
            broker.publish(&topic, "k", "v").await,
            Err(BusError::Closed)
        ));
        assert!(matches!(broker.poll(&topics).await, Err(BusError::Closed)));

        broker.subscribe(&topics).await.unwrap();
        assert!(!broker.is_closed());
        broker.publish(&topic, "k", "v2").await.unwrap();
    }
}

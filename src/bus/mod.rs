//! Message Bus
//!
//! Topic-addressed publish/subscribe with manual commit.
//!
//! - [`Publisher`] sends `(key, value)` to a topic and waits for the broker ack.
//! - [`Consumer`] polls a [`MessageSource`], runs each message's handler on its
//!   own task, and commits when the handler asks to (or always, with auto-commit).
//!
//! Delivery is at-least-once: a message that is never committed is delivered
//! again after a restart. Ordering holds within a partition only.

pub mod memory;
pub mod redis_streams;

pub use memory::MemoryBroker;
pub use redis_streams::RedisStreamsBroker;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("bus connection: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("poll failed: {0}")]
    Poll(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("no topics registered")]
    NoTopics,

    #[error("bus closed")]
    Closed,
}

/// Delivered message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    /// Broker-specific position within the partition
    pub offset: String,
    pub key: String,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

/// Commit handle passed to a handler
///
/// Calling [`Commit::commit`] marks the message for offset advance once the
/// handler returns.
#[derive(Debug, Default)]
pub struct Commit {
    committed: AtomicBool,
}

impl Commit {
    pub fn commit(&self) {
        self.committed.store(true, Ordering::SeqCst);
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }
}

/// Stable key -> partition mapping
pub fn partition_for(key: &str, partitions: u32) -> i32 {
    (crc32fast::hash(key.as_bytes()) % partitions.max(1)) as i32
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the partition the message landed on
    async fn publish(&self, topic: &str, key: &str, value: &str) -> Result<i32, BusError>;
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Prepare consumption of `topics` (create groups, etc.)
    async fn subscribe(&self, topics: &[String]) -> Result<(), BusError>;

    /// Fetch the next batch; may block up to a backend-defined timeout
    async fn poll(&self, topics: &[String]) -> Result<Vec<Message>, BusError>;

    async fn commit(&self, message: &Message) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

/// Per-topic message handler
///
/// Handlers own their error reporting; nothing propagates to the poll loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message, commit: &Commit);
}

/// Poll loop dispatching messages to registered handlers
pub struct Consumer {
    source: Arc<dyn MessageSource>,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    auto_commit: bool,
    error_backoff: Duration,
}

impl Consumer {
    pub fn new(source: Arc<dyn MessageSource>, auto_commit: bool) -> Self {
        Self {
            source,
            handlers: HashMap::new(),
            auto_commit,
            error_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn register(&mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(topic.into(), handler);
    }

    /// Run until `stop` flips to `true`
    ///
    /// The flag is checked between polls, so the current poll finishes first.
    /// In-flight handlers are drained and the source is closed before returning.
    pub async fn serve(&self, stop: watch::Receiver<bool>) -> Result<(), BusError> {
        if self.handlers.is_empty() {
            return Err(BusError::NoTopics);
        }
        let topics: Vec<String> = self.handlers.keys().cloned().collect();
        self.source.subscribe(&topics).await?;
        info!(topics = ?topics, auto_commit = self.auto_commit, "Consumer started");

        let mut tasks = JoinSet::new();
        while !*stop.borrow() {
            match self.source.poll(&topics).await {
                Ok(batch) => {
                    for message in batch {
                        self.dispatch(&mut tasks, message);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    tokio::time::sleep(self.error_backoff).await;
                }
            }

            while let Some(res) = tasks.try_join_next() {
                if let Err(e) = res {
                    error!(error = %e, "Handler task panicked");
                }
            }
        }

        info!(in_flight = tasks.len(), "Consumer stopping");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Handler task panicked");
            }
        }
        self.source.close().await?;
        info!("Consumer stopped");
        Ok(())
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, message: Message) {
        let Some(handler) = self.handlers.get(&message.topic).cloned() else {
            warn!(topic = %message.topic, "No handler for topic");
            return;
        };
        let source = self.source.clone();
        let auto_commit = self.auto_commit;

        tasks.spawn(async move {
            let commit = Commit::default();
            handler.handle(&message, &commit).await;

            if commit.is_committed() || auto_commit {
                if let Err(e) = source.commit(&message).await {
                    error!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = %message.offset,
                        error = %e,
                        "Commit failed"
                    );
                }
            } else {
                debug!(
                    topic = %message.topic,
                    offset = %message.offset,
                    "Message left uncommitted"
                );
            }
        });
    }
}

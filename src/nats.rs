//! NATS JetStream backend.
//!
//! [`NatsBucket`] adapts a JetStream key-value store to [`KvBucket`] and
//! [`NatsConsumer`] adapts a durable pull consumer to [`PullConsumer`].
//!
//! ```ignore
//! let client = async_nats::connect("nats://localhost:4222").await?;
//! let js = async_nats::jetstream::new(client);
//!
//! let bucket = NatsBucket::open(&js, "users").await?;
//! let users: KeyValueStore<User> = KeyValueStore::new(Arc::new(bucket), "users")?;
//!
//! let stream = js.get_stream("events").await?;
//! let consumer = stream.get_consumer::<pull::Config>("worker").await?;
//! let processor = BatchProcessor::new(Arc::new(NatsConsumer::new(consumer)), 10, handler)?;
//! ```

use async_nats::jetstream::{
    self,
    consumer::{pull, Consumer},
    kv::{self, UpdateErrorKind},
    AckKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::time::SystemTime;
use tracing::debug;

use crate::bucket::{BrokerResult, BucketEntry, KvBucket, Operation, WatchOptions};
use crate::config::FetchOptions;
use crate::consumer::{ConsumerMessage, PullConsumer};
use crate::error::BrokerError;
use crate::watch::{WatchEvent, WatchStream};

fn entry_from(entry: kv::Entry) -> BucketEntry {
    BucketEntry {
        key: entry.key,
        value: entry.value.to_vec(),
        revision: entry.revision,
        operation: match entry.operation {
            kv::Operation::Put => Operation::Put,
            kv::Operation::Delete => Operation::Delete,
            kv::Operation::Purge => Operation::Purge,
        },
        created_at: SystemTime::from(entry.created),
    }
}

/// A JetStream key-value bucket.
#[derive(Debug, Clone)]
pub struct NatsBucket {
    store: kv::Store,
}

impl NatsBucket {
    /// Wrap an already bound key-value store.
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }

    /// Bind to an existing bucket.
    pub async fn open(context: &jetstream::Context, bucket: &str) -> BrokerResult<Self> {
        let store = context
            .get_key_value(bucket)
            .await
            .map_err(BrokerError::other)?;
        Ok(Self::new(store))
    }
}

#[async_trait]
impl KvBucket for NatsBucket {
    fn name(&self) -> &str {
        &self.store.name
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<BucketEntry>> {
        let entry = self.store.entry(key).await.map_err(BrokerError::other)?;
        Ok(entry.map(entry_from).filter(BucketEntry::is_put))
    }

    async fn get_revision(&self, key: &str, revision: u64) -> BrokerResult<Option<BucketEntry>> {
        let entry = self
            .store
            .entry_for_revision(key, revision)
            .await
            .map_err(BrokerError::other)?;
        Ok(entry.map(entry_from).filter(BucketEntry::is_put))
    }

    async fn history(&self, key: &str) -> BrokerResult<Vec<BucketEntry>> {
        // The history feed of a subject with no messages never completes.
        if self
            .store
            .entry(key)
            .await
            .map_err(BrokerError::other)?
            .is_none()
        {
            return Ok(Vec::new());
        }

        let mut history = self.store.history(key).await.map_err(BrokerError::other)?;
        let mut entries = Vec::new();
        while let Some(entry) = history.next().await {
            entries.push(entry_from(entry.map_err(BrokerError::other)?));
        }
        Ok(entries)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> BrokerResult<u64> {
        self.store
            .put(key, Bytes::from(value))
            .await
            .map_err(BrokerError::other)
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected: u64) -> BrokerResult<u64> {
        self.store
            .update(key, Bytes::from(value), expected)
            .await
            .map_err(|err| match err.kind() {
                UpdateErrorKind::WrongLastRevision => BrokerError::WrongLastRevision {
                    expected,
                    current: None,
                },
                UpdateErrorKind::TimedOut => BrokerError::Timeout,
                _ => BrokerError::other(err),
            })
    }

    async fn delete(&self, key: &str) -> BrokerResult<()> {
        self.store.delete(key).await.map_err(BrokerError::other)
    }

    async fn watch_all(&self, options: WatchOptions) -> BrokerResult<WatchStream> {
        // Count after the watch consumer exists: every message counted is then
        // delivered to it, so a non-empty count guarantees an entry with
        // `delta == 0`. An empty bucket delivers no entry to carry the marker.
        let watch = self.store.watch_all().await.map_err(BrokerError::other)?;
        let empty = self
            .store
            .status()
            .await
            .map_err(BrokerError::other)?
            .values()
            == 0;
        debug!(bucket = %self.store.name, empty, "watching bucket");

        let marker: Option<BrokerResult<WatchEvent>> =
            empty.then_some(Ok(WatchEvent::EndOfInitialValues));
        let mut initial_done = empty;
        let events = watch.flat_map(move |result| {
            let mut events = Vec::with_capacity(2);
            match result {
                Ok(entry) => {
                    let caught_up = !initial_done && entry.delta == 0;
                    let entry = entry_from(entry);
                    if entry.is_put() || !options.ignore_deletes {
                        events.push(Ok(WatchEvent::Entry(entry)));
                    }
                    if caught_up {
                        initial_done = true;
                        events.push(Ok(WatchEvent::EndOfInitialValues));
                    }
                }
                Err(err) => events.push(Err(BrokerError::other(err))),
            }
            stream::iter(events)
        });

        Ok(WatchStream::new(stream::iter(marker).chain(events)))
    }
}

/// A durable JetStream pull consumer.
#[derive(Debug, Clone)]
pub struct NatsConsumer {
    consumer: Consumer<pull::Config>,
}

impl NatsConsumer {
    /// Wrap a bound durable pull consumer.
    pub fn new(consumer: Consumer<pull::Config>) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl PullConsumer for NatsConsumer {
    async fn fetch(
        &self,
        max_messages: usize,
        options: &FetchOptions,
    ) -> BrokerResult<Vec<Box<dyn ConsumerMessage>>> {
        let mut request = self
            .consumer
            .batch()
            .max_messages(max_messages)
            .expires(options.max_wait);
        if let Some(heartbeat) = options.heartbeat {
            request = request.heartbeat(heartbeat);
        }
        if let Some(max_bytes) = options.max_bytes {
            request = request.max_bytes(max_bytes);
        }

        let mut batch = request.messages().await.map_err(BrokerError::other)?;
        let mut messages: Vec<Box<dyn ConsumerMessage>> = Vec::with_capacity(max_messages);
        while let Some(message) = batch.next().await {
            messages.push(Box::new(NatsMessage::new(
                message.map_err(BrokerError::other)?,
            )));
        }
        Ok(messages)
    }
}

/// A message leased from a [`NatsConsumer`].
#[derive(Debug)]
pub struct NatsMessage {
    message: jetstream::Message,
    delivered: u64,
}

impl NatsMessage {
    fn new(message: jetstream::Message) -> Self {
        let delivered = message
            .info()
            .ok()
            .and_then(|info| u64::try_from(info.delivered).ok())
            .unwrap_or(1);
        Self { message, delivered }
    }
}

#[async_trait]
impl ConsumerMessage for NatsMessage {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivered(&self) -> u64 {
        self.delivered
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.message.ack().await.map_err(BrokerError::other)
    }

    async fn nak(&self) -> BrokerResult<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(BrokerError::other)
    }

    async fn term(&self) -> BrokerResult<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(BrokerError::other)
    }
}

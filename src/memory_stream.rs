//! In-memory stream with durable pull consumers.
//!
//! Honours the [`PullConsumer`] contract: messages are delivered in publish
//! order, each durable consumer tracks its own acknowledgement state, `nak`
//! makes a message available again at once and an unresolved lease expires
//! after the consumer's ack wait.
//!
//! This implementation is NOT durable - data is lost on process exit.
//! Use for testing and development only.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::bucket::BrokerResult;
use crate::config::FetchOptions;
use crate::consumer::{ConsumerMessage, PullConsumer};
use crate::error::BrokerError;

/// Ack wait used when a consumer is created without one.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Settings for a durable consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// How long a fetched message stays leased before it is redelivered.
    pub ack_wait: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lease {
    Available,
    InFlight(Instant),
    Done,
}

#[derive(Debug, Clone, Copy)]
struct Delivery {
    lease: Lease,
    delivered: u64,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            lease: Lease::Available,
            delivered: 0,
        }
    }
}

struct ConsumerState {
    config: ConsumerConfig,
    deliveries: HashMap<u64, Delivery>,
}

struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Arc<[u8]>,
}

#[derive(Default)]
struct StreamState {
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
}

/// Snapshot of a consumer's acknowledgement state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Messages waiting to be delivered or redelivered.
    pub available: usize,
    /// Messages leased and not yet resolved.
    pub in_flight: usize,
    /// Messages acknowledged or terminated.
    pub done: usize,
}

/// An in-memory stream.
///
/// Cloning shares the underlying data.
#[derive(Clone)]
pub struct MemoryStream {
    name: String,
    state: Arc<Mutex<StreamState>>,
    notify: Arc<Notify>,
}

impl MemoryStream {
    /// Create a new empty stream.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(StreamState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a raw message. Returns its stream sequence.
    pub fn publish(&self, subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> u64 {
        let payload: Vec<u8> = payload.into();
        let mut state = self.state.lock();
        let sequence = state.messages.len() as u64 + 1;
        state.messages.push(StoredMessage {
            sequence,
            subject: subject.into(),
            payload: Arc::from(payload),
        });
        drop(state);

        self.notify.notify_waiters();
        sequence
    }

    /// Number of messages in the stream.
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// True if nothing was ever published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get or create a durable consumer with default settings.
    pub fn consumer(&self, durable: &str) -> MemoryConsumer {
        self.consumer_with(durable, ConsumerConfig::default())
    }

    /// Get or create a durable consumer. An existing consumer keeps its
    /// original settings and acknowledgement state.
    pub fn consumer_with(&self, durable: &str, config: ConsumerConfig) -> MemoryConsumer {
        self.state
            .lock()
            .consumers
            .entry(durable.to_string())
            .or_insert_with(|| ConsumerState {
                config,
                deliveries: HashMap::new(),
            });

        MemoryConsumer {
            durable: durable.to_string(),
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }
    }

    /// Remove a durable consumer. Existing handles start failing.
    pub fn delete_consumer(&self, durable: &str) -> bool {
        self.state.lock().consumers.remove(durable).is_some()
    }
}

/// Handle to a durable consumer of a [`MemoryStream`].
#[derive(Clone)]
pub struct MemoryConsumer {
    durable: String,
    state: Arc<Mutex<StreamState>>,
    notify: Arc<Notify>,
}

impl MemoryConsumer {
    /// Durable name of this consumer.
    pub fn durable(&self) -> &str {
        &self.durable
    }

    /// Acknowledgement state across every message in the stream.
    pub fn info(&self) -> BrokerResult<ConsumerInfo> {
        let state = self.state.lock();
        let consumer = state
            .consumers
            .get(&self.durable)
            .ok_or_else(|| consumer_gone(&self.durable))?;

        let now = Instant::now();
        let mut info = ConsumerInfo::default();
        for message in &state.messages {
            let delivery = consumer
                .deliveries
                .get(&message.sequence)
                .copied()
                .unwrap_or_default();
            match delivery.lease {
                Lease::Available => info.available += 1,
                Lease::InFlight(deadline) if deadline <= now => info.available += 1,
                Lease::InFlight(_) => info.in_flight += 1,
                Lease::Done => info.done += 1,
            }
        }
        Ok(info)
    }

    /// Lease every available message up to the limits. Returns the leased
    /// messages and the earliest expiry of a lease still outstanding.
    fn lease(
        &self,
        max_messages: usize,
        max_bytes: Option<usize>,
    ) -> BrokerResult<(Vec<Box<dyn ConsumerMessage>>, Option<Instant>)> {
        let mut state = self.state.lock();
        let StreamState {
            messages,
            consumers,
        } = &mut *state;
        let consumer = consumers
            .get_mut(&self.durable)
            .ok_or_else(|| consumer_gone(&self.durable))?;

        let now = Instant::now();
        let ack_wait = consumer.config.ack_wait;
        let mut batch: Vec<Box<dyn ConsumerMessage>> = Vec::new();
        let mut bytes = 0usize;
        let mut next_expiry: Option<Instant> = None;

        for message in messages.iter() {
            let delivery = consumer.deliveries.entry(message.sequence).or_default();
            let eligible = match delivery.lease {
                Lease::Available => true,
                Lease::InFlight(deadline) => deadline <= now,
                Lease::Done => false,
            };
            if !eligible {
                if let Lease::InFlight(deadline) = delivery.lease {
                    next_expiry = Some(next_expiry.map_or(deadline, |e| e.min(deadline)));
                }
                continue;
            }
            if batch.len() == max_messages {
                break;
            }
            if let Some(limit) = max_bytes {
                if !batch.is_empty() && bytes + message.payload.len() > limit {
                    break;
                }
            }

            bytes += message.payload.len();
            delivery.lease = Lease::InFlight(now + ack_wait);
            delivery.delivered += 1;
            batch.push(Box::new(MemoryMessage {
                sequence: message.sequence,
                subject: message.subject.clone(),
                payload: Arc::clone(&message.payload),
                delivered: delivery.delivered,
                durable: self.durable.clone(),
                state: Arc::clone(&self.state),
                notify: Arc::clone(&self.notify),
            }));
        }

        Ok((batch, next_expiry))
    }
}

#[async_trait]
impl PullConsumer for MemoryConsumer {
    async fn fetch(
        &self,
        max_messages: usize,
        options: &FetchOptions,
    ) -> BrokerResult<Vec<Box<dyn ConsumerMessage>>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + options.max_wait;

        loop {
            // Register interest before looking so a publish or nak in
            // between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_expiry) = self.lease(max_messages, options.max_bytes)?;
            if !batch.is_empty() {
                debug!(durable = %self.durable, count = batch.len(), "leased messages");
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

fn consumer_gone(durable: &str) -> BrokerError {
    BrokerError::Closed(format!("consumer {} not found", durable))
}

/// A message leased from a [`MemoryConsumer`].
pub struct MemoryMessage {
    sequence: u64,
    subject: String,
    payload: Arc<[u8]>,
    delivered: u64,
    durable: String,
    state: Arc<Mutex<StreamState>>,
    notify: Arc<Notify>,
}

impl MemoryMessage {
    /// Stream sequence of this message.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn resolve(&self, lease: Lease) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(&self.durable)
            .ok_or_else(|| consumer_gone(&self.durable))?;
        let delivery = consumer.deliveries.entry(self.sequence).or_default();
        if delivery.lease != Lease::Done {
            delivery.lease = lease;
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerMessage for MemoryMessage {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivered(&self) -> u64 {
        self.delivered
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.resolve(Lease::Done)
    }

    async fn nak(&self) -> BrokerResult<()> {
        self.resolve(Lease::Available)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn term(&self) -> BrokerResult<()> {
        self.resolve(Lease::Done)
    }
}

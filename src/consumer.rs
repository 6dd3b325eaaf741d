//! Pull consumer traits - the durable, ack-tracked subscription the broker
//! provides.
//!
//! A fetched message stays leased to the consumer until it is resolved:
//! - `ack`: processed, never redelivered.
//! - `nak`: redeliver as soon as possible.
//! - `term`: never redeliver, without claiming success.
//!
//! A message that is never resolved is redelivered once the consumer's ack
//! wait expires.

use async_trait::async_trait;

use crate::bucket::BrokerResult;
use crate::config::FetchOptions;

/// A message leased from a pull consumer.
#[async_trait]
pub trait ConsumerMessage: Send + Sync {
    /// Subject the message was published to.
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    /// How many times this message has been delivered, starting at 1.
    fn delivered(&self) -> u64;

    async fn ack(&self) -> BrokerResult<()>;

    async fn nak(&self) -> BrokerResult<()>;

    async fn term(&self) -> BrokerResult<()>;
}

/// A durable pull consumer.
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Fetch up to `max_messages`, waiting at most `options.max_wait` for the
    /// first one. An empty batch is not an error.
    async fn fetch(
        &self,
        max_messages: usize,
        options: &FetchOptions,
    ) -> BrokerResult<Vec<Box<dyn ConsumerMessage>>>;
}

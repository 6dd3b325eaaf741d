//! Fetch, decode, dispatch and acknowledge batches from a pull consumer.
//!
//! One [`BatchProcessor::process`] call is one unit of work:
//!
//! 1. Fetch up to `batch_size` messages.
//! 2. Decode each payload as JSON. Messages that do not decode are poison:
//!    they are acknowledged at once and never reach the handler.
//! 3. Hand every decoded value to the [`BatchHandler`] in a single call.
//! 4. Resolve each message from its outcome: ack on success, nak (or term,
//!    past `max_deliveries`) on failure.
//!
//! Dispatch is whole-batch so a handler can amortise work across messages;
//! acknowledgement is per message so one failure only redelivers that one
//! message.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument, Span};

use crate::config::{BatchConfig, FetchOption};
use crate::consumer::{ConsumerMessage, PullConsumer};
use crate::error::{AckErrors, AckFailure, AckKind, BoxError, Error, Result};

/// Why a handler could not process one message.
pub type HandlerError = BoxError;

/// Per-message result returned by a [`BatchHandler`].
pub type Outcome = std::result::Result<(), HandlerError>;

/// Processes a whole batch of decoded messages.
///
/// Must return exactly one outcome per message, in the same order.
#[async_trait]
pub trait BatchHandler<T>: Send + Sync {
    async fn handle(&self, messages: &[T], cancel: &CancellationToken) -> Vec<Outcome>;
}

#[async_trait]
impl<T, F> BatchHandler<T> for F
where
    T: Sync + 'static,
    F: Fn(&[T]) -> Vec<Outcome> + Send + Sync,
{
    async fn handle(&self, messages: &[T], _cancel: &CancellationToken) -> Vec<Outcome> {
        self(messages)
    }
}

/// A message the handler failed, as seen by the failure hook.
#[derive(Debug)]
pub struct FailedMessage<'a, T> {
    pub value: &'a T,
    pub error: &'a HandlerError,
    /// Deliveries so far, including this one.
    pub delivered: u64,
    /// True if the message is being terminated rather than redelivered.
    pub terminal: bool,
}

/// Observes handler failures. Cannot change the outcome.
pub type FailureHook<T> = Box<dyn Fn(&FailedMessage<'_, T>) + Send + Sync>;

/// What one `process` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Messages returned by the fetch.
    pub fetched: usize,
    /// Undecodable messages acknowledged and dropped.
    pub poisoned: usize,
    pub acked: usize,
    pub nacked: usize,
    pub terminated: usize,
}

impl BatchSummary {
    /// Messages handed to the handler.
    pub fn dispatched(&self) -> usize {
        self.fetched - self.poisoned
    }

    fn record(&mut self, kind: AckKind) {
        match kind {
            AckKind::Ack => self.acked += 1,
            AckKind::Nak => self.nacked += 1,
            AckKind::Term => self.terminated += 1,
        }
    }
}

/// Pulls batches from a consumer and drives a [`BatchHandler`].
pub struct BatchProcessor<T> {
    consumer: Arc<dyn PullConsumer>,
    config: BatchConfig,
    handler: Box<dyn BatchHandler<T>>,
    on_failure: Option<FailureHook<T>>,
    span: Span,
}

impl<T> std::fmt::Debug for BatchProcessor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .field("on_failure", &self.on_failure.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`BatchProcessor`].
pub struct BatchProcessorBuilder<T> {
    consumer: Arc<dyn PullConsumer>,
    config: BatchConfig,
    handler: Box<dyn BatchHandler<T>>,
    on_failure: Option<FailureHook<T>>,
    span: Option<Span>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BatchProcessorBuilder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Replace the whole configuration.
    pub fn config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Maximum messages per fetch.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Append a fetch option. Later options override earlier ones.
    pub fn fetch_option(mut self, option: FetchOption) -> Self {
        self.config.fetch.apply(option);
        self
    }

    /// Upper bound on how long a fetch waits for messages.
    pub fn max_wait(self, max_wait: Duration) -> Self {
        self.fetch_option(FetchOption::MaxWait(max_wait))
    }

    /// Terminate failing messages once delivered this many times.
    pub fn max_deliveries(mut self, max_deliveries: u64) -> Self {
        self.config.max_deliveries = Some(max_deliveries);
        self
    }

    /// Span every event of this processor is recorded under.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Observe handler failures before they are nak'd or terminated.
    pub fn on_failure(
        mut self,
        hook: impl Fn(&FailedMessage<'_, T>) + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    /// Validate the configuration and build the processor.
    pub fn build(self) -> Result<BatchProcessor<T>> {
        self.config.validate()?;
        Ok(BatchProcessor {
            consumer: self.consumer,
            config: self.config,
            handler: self.handler,
            on_failure: self.on_failure,
            span: self
                .span
                .unwrap_or_else(|| tracing::debug_span!("batch_processor")),
        })
    }
}

impl<T> BatchProcessor<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Start building a processor with the default [`BatchConfig`].
    pub fn builder(
        consumer: Arc<dyn PullConsumer>,
        handler: impl BatchHandler<T> + 'static,
    ) -> BatchProcessorBuilder<T> {
        BatchProcessorBuilder {
            consumer,
            config: BatchConfig::default(),
            handler: Box::new(handler),
            on_failure: None,
            span: None,
            _marker: PhantomData,
        }
    }

    /// Processor with the given batch size and default settings otherwise.
    pub fn new(
        consumer: Arc<dyn PullConsumer>,
        batch_size: usize,
        handler: impl BatchHandler<T> + 'static,
    ) -> Result<Self> {
        Self::builder(consumer, handler)
            .batch_size(batch_size)
            .build()
    }

    /// Effective configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Fetch, dispatch and acknowledge one batch.
    ///
    /// Returns once every fetched message is resolved, or with the error that
    /// stopped it. Messages left unresolved by an error are redelivered by the
    /// broker after its ack wait.
    pub async fn process(&self, cancel: &CancellationToken) -> Result<BatchSummary> {
        self.process_batch(cancel)
            .instrument(self.span.clone())
            .await
    }

    async fn process_batch(&self, cancel: &CancellationToken) -> Result<BatchSummary> {
        debug!(batch_size = self.config.batch_size, "fetching batch");
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            fetched = self.consumer.fetch(self.config.batch_size, &self.config.fetch) => {
                fetched.map_err(Error::Fetch)?
            }
        };

        let mut summary = BatchSummary {
            fetched: fetched.len(),
            ..Default::default()
        };
        let mut values = Vec::with_capacity(fetched.len());
        let mut messages = Vec::with_capacity(fetched.len());
        for message in fetched {
            match serde_json::from_slice::<T>(message.payload()) {
                Ok(value) => {
                    values.push(value);
                    messages.push(message);
                }
                Err(decode) => {
                    warn!(
                        subject = message.subject(),
                        error = %decode,
                        "failed to decode, skipping invalid message"
                    );
                    if let Err(ack) = message.ack().await {
                        return Err(Error::PoisonAck { decode, ack });
                    }
                    summary.poisoned += 1;
                }
            }
        }
        if messages.is_empty() {
            debug!(poisoned = summary.poisoned, "no messages, returning");
            return Ok(summary);
        }

        debug!(count = messages.len(), "processing messages");
        let outcomes = self.handler.handle(&values, cancel).await;
        if outcomes.len() != messages.len() {
            return Err(Error::HandlerContract {
                expected: messages.len(),
                actual: outcomes.len(),
            });
        }

        let mut failures = Vec::new();
        for (index, ((message, value), outcome)) in messages
            .iter()
            .zip(&values)
            .zip(outcomes)
            .enumerate()
        {
            if cancel.is_cancelled() {
                warn!(resolved = index, failed = failures.len(), "cancelled while acknowledging");
                if failures.is_empty() {
                    return Err(Error::Cancelled);
                }
                return Err(Error::CancelledAcknowledging(AckErrors(failures)));
            }

            let kind = match outcome {
                Ok(()) => AckKind::Ack,
                Err(error) => {
                    let delivered = message.delivered();
                    let terminal = self
                        .config
                        .max_deliveries
                        .is_some_and(|max| delivered >= max);
                    warn!(
                        subject = message.subject(),
                        delivered,
                        terminal,
                        error = %error,
                        "error processing message"
                    );
                    if let Some(hook) = &self.on_failure {
                        hook(&FailedMessage {
                            value,
                            error: &error,
                            delivered,
                            terminal,
                        });
                    }
                    if terminal {
                        AckKind::Term
                    } else {
                        AckKind::Nak
                    }
                }
            };

            match resolve(&**message, kind).await {
                Ok(()) => summary.record(kind),
                Err(source) => failures.push(AckFailure {
                    index,
                    kind,
                    source,
                }),
            }
        }

        debug!(
            acks = summary.acked,
            nacks = summary.nacked,
            terms = summary.terminated,
            failed = failures.len(),
            "acknowledged messages"
        );
        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(Error::Acknowledgement(AckErrors(failures)))
        }
    }
}

async fn resolve(
    message: &dyn ConsumerMessage,
    kind: AckKind,
) -> std::result::Result<(), crate::error::BrokerError> {
    match kind {
        AckKind::Ack => message.ack().await,
        AckKind::Nak => message.nak().await,
        AckKind::Term => message.term().await,
    }
}

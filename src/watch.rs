//! Watch feed types for bucket subscriptions.
//!
//! A watch is push-based: the broker sends the latest entry of every subject,
//! a marker once that snapshot is complete, then live updates for as long as
//! the stream is held. Dropping the [`WatchStream`] releases the subscription.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::bucket::{BrokerResult, BucketEntry, WatchOptions};
use crate::error::BrokerError;

/// One item of a watch feed.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// An entry, from the initial snapshot or a live update.
    Entry(BucketEntry),
    /// Every entry present at subscription time has been delivered.
    EndOfInitialValues,
}

/// A live subscription to a bucket.
pub struct WatchStream {
    inner: BoxStream<'static, BrokerResult<WatchEvent>>,
}

impl WatchStream {
    /// Wrap any feed of watch events.
    pub fn new(stream: impl Stream<Item = BrokerResult<WatchEvent>> + Send + 'static) -> Self {
        Self {
            inner: stream.boxed(),
        }
    }

    /// Feed built from a snapshot followed by a live broadcast receiver.
    ///
    /// The receiver must have been subscribed before the snapshot was taken,
    /// under the same lock, or updates in between are lost.
    pub fn snapshot_then_live(
        initial: Vec<BucketEntry>,
        live: broadcast::Receiver<BucketEntry>,
        options: WatchOptions,
    ) -> Self {
        let ignore_deletes = options.ignore_deletes;
        let keep = move |entry: &BucketEntry| !ignore_deletes || entry.is_put();

        let head = stream::iter(
            initial
                .into_iter()
                .filter(keep)
                .map(|entry| Ok(WatchEvent::Entry(entry)))
                .chain(std::iter::once(Ok(WatchEvent::EndOfInitialValues))),
        );
        let live = BroadcastStream::new(live).filter_map(move |item| {
            future::ready(match item {
                Ok(entry) if keep(&entry) => Some(Ok(WatchEvent::Entry(entry))),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(BrokerError::Closed(
                    format!("watcher lagged behind by {} updates", skipped),
                ))),
            })
        });

        Self::new(head.chain(live))
    }
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream").finish_non_exhaustive()
    }
}

impl Stream for WatchStream {
    type Item = BrokerResult<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Handle for fanning live bucket updates out to watchers.
#[derive(Clone)]
pub struct WatchSender {
    sender: broadcast::Sender<BucketEntry>,
}

impl WatchSender {
    /// Create a new watch sender with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an update to all watchers.
    pub fn send(&self, entry: BucketEntry) {
        // No watchers is not an error.
        let _ = self.sender.send(entry);
    }

    /// Subscribe to updates sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BucketEntry> {
        self.sender.subscribe()
    }

    /// Get the number of live watchers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for WatchSender {
    fn default() -> Self {
        Self::new(1024)
    }
}

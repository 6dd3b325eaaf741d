//! Pull-based cursor over a push-based feed.
//!
//! A [`Cursor`] is advanced explicitly with [`Cursor::next`]. It moves between
//! three states:
//!
//! - [`CursorState::Ready`]: more items may follow.
//! - [`CursorState::Exhausted`]: the feed ended or the cursor was stopped.
//! - [`CursorState::Failed`]: the feed reported an error, returned once from
//!   the `next` call that hit it.
//!
//! Once a cursor leaves `Ready`, `next` returns `Ok(None)` without waiting.
//! Cursors are not restartable.

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Lifecycle state of a [`Cursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Ready,
    Exhausted,
    Failed,
}

/// Stops a [`Cursor`] from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    /// Stop the cursor. A `next` call waiting on the feed returns `Ok(None)`.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// True once the cursor has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum Polled<T> {
    Stopped,
    Item(Option<Result<T>>),
}

/// Lazy, finite or unbounded sequence of decoded values.
pub struct Cursor<T> {
    source: Option<BoxStream<'static, Result<T>>>,
    pending_error: Option<Error>,
    state: CursorState,
    stop: CancellationToken,
}

impl<T: Send + 'static> Cursor<T> {
    /// Cursor over a fallible stream.
    pub fn new(source: impl Stream<Item = Result<T>> + Send + 'static) -> Self {
        Self {
            source: Some(source.boxed()),
            pending_error: None,
            state: CursorState::Ready,
            stop: CancellationToken::new(),
        }
    }

    /// Cursor that yields nothing and reports `err` on its first advance.
    pub fn failed(err: Error) -> Self {
        Self {
            source: None,
            pending_error: Some(err),
            state: CursorState::Ready,
            stop: CancellationToken::new(),
        }
    }

    /// Advance the cursor.
    ///
    /// Waits for the next item. Returns `Ok(None)` once the feed ends or the
    /// cursor is stopped, and `Err` exactly once if the feed fails.
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.state != CursorState::Ready {
            return Ok(None);
        }
        if self.stop.is_cancelled() {
            self.terminate(CursorState::Exhausted);
            return Ok(None);
        }
        if let Some(err) = self.pending_error.take() {
            self.terminate(CursorState::Failed);
            return Err(err);
        }

        let polled = match self.source.as_mut() {
            Some(source) => tokio::select! {
                biased;
                _ = self.stop.cancelled() => Polled::Stopped,
                item = source.next() => Polled::Item(item),
            },
            None => Polled::Item(None),
        };

        match polled {
            Polled::Item(Some(Ok(value))) => Ok(Some(value)),
            Polled::Item(Some(Err(err))) => {
                self.terminate(CursorState::Failed);
                Err(err)
            }
            Polled::Item(None) | Polled::Stopped => {
                self.terminate(CursorState::Exhausted);
                Ok(None)
            }
        }
    }

    /// Drain the remaining items.
    pub async fn try_collect(&mut self) -> Result<Vec<T>> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }
}

impl<T> Cursor<T> {
    /// Current lifecycle state.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Handle that stops this cursor from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    /// Release the underlying subscription. Idempotent.
    pub fn stop(&mut self) {
        self.stop.cancel();
        if self.state == CursorState::Ready {
            self.terminate(CursorState::Exhausted);
        }
        self.source = None;
    }

    fn terminate(&mut self, state: CursorState) {
        self.state = state;
        self.source = None;
        self.pending_error = None;
    }
}

impl<T> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("state", &self.state)
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use futures::stream;
    use std::time::Duration;

    fn backend_error() -> Error {
        Error::Backend(BrokerError::Closed("watch closed".to_string()))
    }

    #[tokio::test]
    async fn test_yields_items_then_exhausts() {
        let mut cursor = Cursor::new(stream::iter(vec![Ok(1), Ok(2), Ok(3)]));

        assert_eq!(cursor.next().await.unwrap(), Some(1));
        assert_eq!(cursor.next().await.unwrap(), Some(2));
        assert_eq!(cursor.next().await.unwrap(), Some(3));
        assert_eq!(cursor.state(), CursorState::Ready);
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_is_reported_once() {
        let mut cursor = Cursor::new(stream::iter(vec![Ok(1), Err(backend_error()), Ok(3)]));

        assert_eq!(cursor.next().await.unwrap(), Some(1));
        assert!(matches!(cursor.next().await, Err(Error::Backend(_))));
        assert_eq!(cursor.state(), CursorState::Failed);
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_cursor_surfaces_error_on_first_advance() {
        let mut cursor: Cursor<u32> = Cursor::failed(backend_error());
        assert_eq!(cursor.state(), CursorState::Ready);

        assert!(cursor.next().await.is_err());
        assert_eq!(cursor.state(), CursorState::Failed);
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut cursor = Cursor::new(stream::iter(vec![Ok(1)]));
        cursor.stop();
        cursor.stop();
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert_eq!(cursor.next().await.unwrap(), None);

        let mut never_started: Cursor<u32> = Cursor::failed(backend_error());
        never_started.stop();
        assert_eq!(never_started.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_handle_discards_pending_error() {
        let mut cursor: Cursor<u32> = Cursor::failed(backend_error());
        cursor.stop_handle().stop();

        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.state(), CursorState::Exhausted);
    }

    #[tokio::test]
    async fn test_stop_handle_before_first_advance() {
        let mut cursor = Cursor::new(stream::iter(vec![Ok(1), Ok(2)]));
        cursor.stop_handle().stop();

        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.state(), CursorState::Exhausted);
    }

    #[tokio::test]
    async fn test_stop_after_failure_keeps_failed_state() {
        let mut cursor: Cursor<u32> = Cursor::new(stream::iter(vec![Err(backend_error())]));
        assert!(cursor.next().await.is_err());
        cursor.stop();
        assert_eq!(cursor.state(), CursorState::Failed);
    }

    #[tokio::test]
    async fn test_stop_handle_unblocks_pending_next() {
        let mut cursor: Cursor<u32> = Cursor::new(stream::pending());
        let handle = cursor.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.stop();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), cursor.next())
            .await
            .expect("stop handle did not unblock next");
        assert_eq!(result.unwrap(), None);
        assert_eq!(cursor.state(), CursorState::Exhausted);
    }

    #[tokio::test]
    async fn test_try_collect() {
        let mut cursor = Cursor::new(stream::iter(vec![Ok("a"), Ok("b")]));
        assert_eq!(cursor.try_collect().await.unwrap(), vec!["a", "b"]);
        assert!(cursor.try_collect().await.unwrap().is_empty());
    }
}

//! Typed key-value store over a revisioned bucket.
//!
//! Values are JSON-encoded `T`. Keys are hashed into subjects with
//! [`KeyCodec`] before they reach the bucket, so any string is a valid key.
//!
//! Optimistic concurrency is the bucket's compare-and-swap: read a value with
//! its revision, then [`KeyValueStore::update`] with that revision. If another
//! writer got there first the update fails with
//! [`Error::OptimisticConcurrency`] and nothing is written. Nothing is retried
//! here.

use futures::stream::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use std::future::{self, Future};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::bucket::{BrokerResult, BucketEntry, KvBucket, WatchOptions};
use crate::config::KvConfig;
use crate::cursor::Cursor;
use crate::error::{BrokerError, Error, Result};
use crate::subject::KeyCodec;
use crate::watch::WatchEvent;

/// A decoded value and the revision it was stored at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision<T> {
    pub value: T,
    pub revision: u64,
}

/// Typed, hash-addressed view of a [`KvBucket`].
pub struct KeyValueStore<T> {
    bucket: Arc<dyn KvBucket>,
    codec: KeyCodec,
    request_timeout: Option<Duration>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for KeyValueStore<T> {
    fn clone(&self) -> Self {
        Self {
            bucket: Arc::clone(&self.bucket),
            codec: self.codec.clone(),
            request_timeout: self.request_timeout,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for KeyValueStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("bucket", &self.bucket.name())
            .field("prefix", &self.codec.prefix())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(Error::Decode)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Error::Encode)
}

/// Treat an adapter's not-found fault as an absent value.
fn found<V>(result: BrokerResult<Option<V>>) -> Result<Option<V>> {
    match result {
        Ok(value) => Ok(value),
        Err(BrokerError::KeyNotFound) => Ok(None),
        Err(err) => Err(Error::Backend(err)),
    }
}

impl<T> KeyValueStore<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a store whose subjects live under `prefix`.
    pub fn new(bucket: Arc<dyn KvBucket>, prefix: impl Into<String>) -> Result<Self> {
        Self::with_config(bucket, KvConfig::new(prefix))
    }

    /// Create a store from a validated [`KvConfig`].
    pub fn with_config(bucket: Arc<dyn KvBucket>, config: KvConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            bucket,
            codec: KeyCodec::new(config.prefix)?,
            request_timeout: config.request_timeout,
            _marker: PhantomData,
        })
    }

    /// Codec translating keys into subjects.
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Subject a key is stored under.
    pub fn subject(&self, key: &str) -> String {
        self.codec.subject(key)
    }

    /// Run a broker call under the configured request timeout.
    async fn call<R>(&self, request: impl Future<Output = R>) -> Result<R> {
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| Error::DeadlineExceeded(limit)),
            None => Ok(request.await),
        }
    }

    /// Latest value and its revision. `None` if the key is absent or deleted.
    pub async fn get(&self, key: &str) -> Result<Option<Revision<T>>> {
        let subject = self.subject(key);
        debug!(bucket = self.bucket.name(), %subject, "get");

        let Some(entry) = found(self.call(self.bucket.get(&subject)).await?)? else {
            return Ok(None);
        };
        Ok(Some(Revision {
            value: decode(&entry.value)?,
            revision: entry.revision,
        }))
    }

    /// Value at a specific revision. `None` if that revision is not retained
    /// or is a delete.
    pub async fn get_revision(&self, key: &str, revision: u64) -> Result<Option<T>> {
        let subject = self.subject(key);
        debug!(bucket = self.bucket.name(), %subject, revision, "get revision");

        match found(self.call(self.bucket.get_revision(&subject, revision)).await?)? {
            Some(entry) => Ok(Some(decode(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Retained values, oldest first. Deletes are left out. `None` if no
    /// value is retained.
    pub async fn history(&self, key: &str) -> Result<Option<Vec<T>>> {
        Ok(self
            .history_entries(key)
            .await?
            .map(|entries| entries.into_iter().map(|entry| entry.value).collect()))
    }

    /// Like [`history`](Self::history), keeping each value's revision.
    pub async fn history_entries(&self, key: &str) -> Result<Option<Vec<Revision<T>>>> {
        let subject = self.subject(key);
        debug!(bucket = self.bucket.name(), %subject, "history");

        let entries = match self.call(self.bucket.history(&subject)).await? {
            Ok(entries) => entries,
            Err(BrokerError::KeyNotFound) => Vec::new(),
            Err(err) => return Err(Error::Backend(err)),
        };

        let values = entries
            .iter()
            .filter(|entry| entry.is_put())
            .map(|entry| -> Result<Revision<T>> {
                Ok(Revision {
                    value: decode(&entry.value)?,
                    revision: entry.revision,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(if values.is_empty() { None } else { Some(values) })
    }

    /// Unconditional write. Returns the new revision.
    pub async fn put(&self, key: &str, value: &T) -> Result<u64> {
        let subject = self.subject(key);
        let bytes = encode(value)?;

        let revision = self
            .call(self.bucket.put(&subject, bytes))
            .await?
            .map_err(Error::Backend)?;
        debug!(bucket = self.bucket.name(), %subject, revision, "put");
        Ok(revision)
    }

    /// Write only if `expected` is the key's current revision. Returns the
    /// new revision.
    pub async fn update(&self, key: &str, value: &T, expected: u64) -> Result<u64> {
        let subject = self.subject(key);
        let bytes = encode(value)?;

        match self.call(self.bucket.update(&subject, bytes, expected)).await? {
            Ok(revision) => {
                debug!(bucket = self.bucket.name(), %subject, revision, "update");
                Ok(revision)
            }
            Err(BrokerError::WrongLastRevision { current, .. }) => {
                debug!(
                    bucket = self.bucket.name(),
                    %subject,
                    expected,
                    ?current,
                    "optimistic concurrency check failed"
                );
                Err(Error::OptimisticConcurrency {
                    subject,
                    expected,
                    current,
                })
            }
            Err(err) => Err(Error::Backend(err)),
        }
    }

    /// Write a delete tombstone. Later reads see the key as absent.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let subject = self.subject(key);
        self.call(self.bucket.delete(&subject))
            .await?
            .map_err(Error::Backend)?;
        debug!(bucket = self.bucket.name(), %subject, "delete");
        Ok(())
    }

    /// Cursor over every live value in the bucket at the time of the call.
    ///
    /// Never fails: if the watch cannot be established the cursor reports
    /// the error on its first [`next`](Cursor::next).
    pub async fn list(&self) -> Cursor<T> {
        debug!(bucket = self.bucket.name(), "list");
        let watch = match self
            .call(self.bucket.watch_all(WatchOptions::ignore_deletes()))
            .await
        {
            Ok(Ok(watch)) => watch,
            Ok(Err(err)) => return Cursor::failed(Error::Backend(err)),
            Err(err) => return Cursor::failed(err),
        };

        let values = watch
            .take_while(|event| {
                future::ready(!matches!(event, Ok(WatchEvent::EndOfInitialValues)))
            })
            .filter_map(|event| {
                future::ready(match event {
                    Ok(WatchEvent::Entry(entry)) => live_value(entry),
                    Ok(WatchEvent::EndOfInitialValues) => None,
                    Err(err) => Some(Err(Error::Backend(err))),
                })
            });
        Cursor::new(values)
    }
}

fn live_value<T: DeserializeOwned>(entry: BucketEntry) -> Option<Result<T>> {
    entry.is_put().then(|| decode(&entry.value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Operation;
    use crate::cursor::CursorState;
    use crate::memory::MemoryBucket;
    use crate::watch::WatchStream;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
        age: u32,
    }

    fn user(name: &str, age: u32) -> User {
        User {
            name: name.to_string(),
            age,
        }
    }

    fn store() -> (MemoryBucket, KeyValueStore<User>) {
        let bucket = MemoryBucket::with_history("test_kv", 10);
        let store = KeyValueStore::new(Arc::new(bucket.clone()), "users").unwrap();
        (bucket, store)
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let (_, db) = store();
        assert!(db.get("non-existent-key").await.unwrap().is_none());
        assert!(db.get_revision("non-existent-key", 1).await.unwrap().is_none());
        assert!(db.history("non-existent-key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_, db) = store();

        assert_eq!(db.put("user1", &user("john", 42)).await.unwrap(), 1);
        let got = db.get("user1").await.unwrap().unwrap();
        assert_eq!(got.value, user("john", 42));
        assert_eq!(got.revision, 1);

        assert_eq!(db.put("user1", &user("john", 43)).await.unwrap(), 2);
        let got = db.get("user1").await.unwrap().unwrap();
        assert_eq!(
            got,
            Revision {
                value: user("john", 43),
                revision: 2
            }
        );
    }

    #[tokio::test]
    async fn test_keys_are_hashed_into_subjects() {
        let (bucket, db) = store();
        db.put("user1", &user("john", 42)).await.unwrap();

        let subject = crate::subject::to_subject("users", "user1");
        assert_eq!(db.subject("user1"), subject);
        let raw = bucket.get(&subject).await.unwrap().unwrap();
        assert_eq!(raw.value, br#"{"name":"john","age":42}"#);
    }

    #[tokio::test]
    async fn test_get_revision() {
        let (_, db) = store();
        db.put("user1", &user("john", 42)).await.unwrap();
        db.put("user1", &user("john", 43)).await.unwrap();

        assert_eq!(
            db.get_revision("user1", 1).await.unwrap(),
            Some(user("john", 42))
        );
        assert_eq!(
            db.get_revision("user1", 2).await.unwrap(),
            Some(user("john", 43))
        );
        assert_eq!(db.get_revision("user1", 3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_history_in_write_order() {
        let (_, db) = store();
        let versions = [user("john", 42), user("john", 43), user("john", 44)];
        for version in &versions {
            db.put("user1", version).await.unwrap();
        }

        assert_eq!(db.history("user1").await.unwrap(), Some(versions.to_vec()));

        let revisions: Vec<u64> = db
            .history_entries("user1")
            .await
            .unwrap()
            .unwrap()
            .iter()
            .map(|entry| entry.revision)
            .collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_history_truncated_to_retention() {
        let bucket = MemoryBucket::with_history("short", 2);
        let db: KeyValueStore<User> = KeyValueStore::new(Arc::new(bucket), "users").unwrap();
        for age in 1..=4 {
            db.put("user1", &user("john", age)).await.unwrap();
        }
        assert_eq!(
            db.history("user1").await.unwrap(),
            Some(vec![user("john", 3), user("john", 4)])
        );
    }

    #[tokio::test]
    async fn test_history_skips_deletes() {
        let (_, db) = store();
        db.put("user1", &user("john", 42)).await.unwrap();
        db.delete("user1").await.unwrap();
        db.put("user1", &user("john", 50)).await.unwrap();

        let history = db.history_entries("user1").await.unwrap().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].revision, 1);
        assert_eq!(history[1].revision, 3);
    }

    #[tokio::test]
    async fn test_update_with_stale_revision_fails() {
        let (_, db) = store();
        db.put("user1", &user("john", 42)).await.unwrap();
        db.put("user1", &user("john", 43)).await.unwrap();

        let err = db.update("user1", &user("john", 44), 1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::OptimisticConcurrency {
                expected: 1,
                current: Some(2),
                ..
            }
        ));

        // Stored state is untouched.
        let got = db.get("user1").await.unwrap().unwrap();
        assert_eq!(got.value, user("john", 43));
        assert_eq!(got.revision, 2);
    }

    #[tokio::test]
    async fn test_update_with_current_revision() {
        let (_, db) = store();
        db.put("user1", &user("john", 42)).await.unwrap();
        db.put("user1", &user("john", 43)).await.unwrap();

        assert_eq!(db.update("user1", &user("john", 44), 2).await.unwrap(), 3);
        assert_eq!(db.get("user1").await.unwrap().unwrap().value, user("john", 44));
    }

    #[tokio::test]
    async fn test_concurrent_updates_one_winner() {
        let (_, db) = store();
        db.put("counter", &user("c", 0)).await.unwrap();

        let mut handles = Vec::new();
        for age in 1..=8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.update("counter", &user("c", age), 1).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(revision) => {
                    assert_eq!(revision, 2);
                    winners += 1;
                }
                Err(err) => assert!(err.is_conflict()),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_, db) = store();
        db.put("user5", &user("thomas", 48)).await.unwrap();
        db.delete("user5").await.unwrap();
        assert!(db.get("user5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decode_error() {
        let (bucket, db) = store();
        bucket
            .put(&db.subject("broken"), b"{ not json }".to_vec())
            .await
            .unwrap();

        assert!(matches!(db.get("broken").await, Err(Error::Decode(_))));
        assert!(matches!(db.history("broken").await, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_unserialisable_value_is_encode_error() {
        let bucket = MemoryBucket::with_history("test_kv", 10);
        let db: KeyValueStore<HashMap<Vec<u8>, u32>> =
            KeyValueStore::new(Arc::new(bucket.clone()), "maps").unwrap();
        // JSON object keys must be strings.
        let value = HashMap::from([(vec![1u8, 2], 3u32)]);

        assert!(matches!(db.put("m", &value).await, Err(Error::Encode(_))));
        assert!(matches!(
            db.update("m", &value, 0).await,
            Err(Error::Encode(_))
        ));

        assert!(bucket.is_empty());
        assert!(bucket.history(&db.subject("m")).await.unwrap().is_empty());
        assert!(db.get("m").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_iterates_live_values() {
        let (_, db) = store();
        db.put("user1", &user("john", 42)).await.unwrap();
        db.put("user1", &user("john", 44)).await.unwrap();
        db.put("user5", &user("thomas", 48)).await.unwrap();
        db.delete("user5").await.unwrap();
        db.put("user2", &user("paul", 45)).await.unwrap();
        db.put("user3", &user("ringo", 46)).await.unwrap();
        db.put("user4", &user("george", 47)).await.unwrap();

        let mut cursor = db.list().await;
        let mut actual = Vec::new();
        while let Some(value) = cursor.next().await.unwrap() {
            actual.push(value);
        }
        cursor.stop();

        assert_eq!(
            actual,
            vec![
                user("john", 44),
                user("paul", 45),
                user("ringo", 46),
                user("george", 47)
            ]
        );
    }

    #[tokio::test]
    async fn test_list_empty_bucket() {
        let (_, db) = store();
        let mut cursor = db.list().await;
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.state(), CursorState::Exhausted);
    }

    #[tokio::test]
    async fn test_list_decode_failure_fails_cursor() {
        let (bucket, db) = store();
        db.put("user1", &user("john", 42)).await.unwrap();
        bucket
            .put(&db.subject("broken"), b"not json".to_vec())
            .await
            .unwrap();
        db.put("user2", &user("paul", 45)).await.unwrap();

        let mut cursor = db.list().await;
        assert_eq!(cursor.next().await.unwrap(), Some(user("john", 42)));
        assert!(matches!(cursor.next().await, Err(Error::Decode(_))));
        assert_eq!(cursor.state(), CursorState::Failed);
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    /// A bucket whose every call fails.
    struct BrokenBucket;

    #[async_trait]
    impl KvBucket for BrokenBucket {
        fn name(&self) -> &str {
            "broken"
        }

        async fn get(&self, _key: &str) -> BrokerResult<Option<BucketEntry>> {
            Err(BrokerError::Timeout)
        }

        async fn get_revision(&self, _key: &str, _revision: u64) -> BrokerResult<Option<BucketEntry>> {
            Err(BrokerError::KeyNotFound)
        }

        async fn history(&self, _key: &str) -> BrokerResult<Vec<BucketEntry>> {
            Err(BrokerError::KeyNotFound)
        }

        async fn put(&self, _key: &str, _value: Vec<u8>) -> BrokerResult<u64> {
            Err(BrokerError::other("disk full"))
        }

        async fn update(&self, _key: &str, _value: Vec<u8>, _expected: u64) -> BrokerResult<u64> {
            Err(BrokerError::other("disk full"))
        }

        async fn delete(&self, _key: &str) -> BrokerResult<()> {
            Err(BrokerError::Closed("connection lost".to_string()))
        }

        async fn watch_all(&self, _options: WatchOptions) -> BrokerResult<WatchStream> {
            Err(BrokerError::Closed("connection lost".to_string()))
        }
    }

    #[tokio::test]
    async fn test_backend_errors_are_wrapped() {
        let db: KeyValueStore<User> = KeyValueStore::new(Arc::new(BrokenBucket), "users").unwrap();

        assert!(matches!(
            db.get("k").await,
            Err(Error::Backend(BrokerError::Timeout))
        ));
        assert!(matches!(
            db.put("k", &user("a", 1)).await,
            Err(Error::Backend(BrokerError::Other(_)))
        ));
        assert!(matches!(
            db.update("k", &user("a", 1), 1).await,
            Err(Error::Backend(_))
        ));
        assert!(matches!(db.delete("k").await, Err(Error::Backend(_))));
    }

    #[tokio::test]
    async fn test_key_not_found_fault_means_absent() {
        let db: KeyValueStore<User> = KeyValueStore::new(Arc::new(BrokenBucket), "users").unwrap();
        assert_eq!(db.get_revision("k", 1).await.unwrap(), None);
        assert_eq!(db.history("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_fails_closed() {
        let db: KeyValueStore<User> = KeyValueStore::new(Arc::new(BrokenBucket), "users").unwrap();

        let mut cursor = db.list().await;
        assert!(matches!(
            cursor.next().await,
            Err(Error::Backend(BrokerError::Closed(_)))
        ));
        assert_eq!(cursor.next().await.unwrap(), None);
        cursor.stop();
    }

    /// A bucket that never answers.
    struct StalledBucket;

    #[async_trait]
    impl KvBucket for StalledBucket {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn get(&self, _key: &str) -> BrokerResult<Option<BucketEntry>> {
            future::pending().await
        }

        async fn get_revision(&self, _key: &str, _revision: u64) -> BrokerResult<Option<BucketEntry>> {
            future::pending().await
        }

        async fn history(&self, _key: &str) -> BrokerResult<Vec<BucketEntry>> {
            future::pending().await
        }

        async fn put(&self, _key: &str, _value: Vec<u8>) -> BrokerResult<u64> {
            future::pending().await
        }

        async fn update(&self, _key: &str, _value: Vec<u8>, _expected: u64) -> BrokerResult<u64> {
            future::pending().await
        }

        async fn delete(&self, _key: &str) -> BrokerResult<()> {
            future::pending().await
        }

        async fn watch_all(&self, _options: WatchOptions) -> BrokerResult<WatchStream> {
            future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let config = KvConfig::new("users").with_request_timeout(Duration::from_millis(50));
        let db: KeyValueStore<User> =
            KeyValueStore::with_config(Arc::new(StalledBucket), config).unwrap();

        assert!(matches!(
            db.get("k").await,
            Err(Error::DeadlineExceeded(_))
        ));
        assert!(matches!(
            db.put("k", &user("a", 1)).await,
            Err(Error::DeadlineExceeded(_))
        ));

        let mut cursor = db.list().await;
        assert!(matches!(
            cursor.next().await,
            Err(Error::DeadlineExceeded(_))
        ));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let bucket = Arc::new(MemoryBucket::new("test"));
        assert!(matches!(
            KeyValueStore::<User>::new(bucket, "users.>"),
            Err(Error::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_live_value_skips_tombstones() {
        let entry = BucketEntry {
            key: "users.x".to_string(),
            value: Vec::new(),
            revision: 2,
            operation: Operation::Delete,
            created_at: std::time::SystemTime::now(),
        };
        assert!(live_value::<User>(entry).is_none());
    }
}

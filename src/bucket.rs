//! KvBucket trait - the revisioned key-value primitive the broker provides.
//!
//! Everything below [`KeyValueStore`](crate::KeyValueStore) goes through this
//! trait. Keys at this level are already subjects; values are opaque bytes.
//!
//! Semantics every implementation must honour:
//! - Revisions are per subject, start at 1 and grow by one on every write,
//!   including delete tombstones.
//! - `update` is an atomic compare-and-swap on the subject's current revision
//!   and reports a mismatch as [`BrokerError::WrongLastRevision`].
//! - History is bounded by the bucket's retention depth, oldest first, and
//!   includes tombstones.
//! - `watch_all` delivers the latest entry of every subject, then
//!   [`WatchEvent::EndOfInitialValues`], then live updates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::error::BrokerError;
use crate::watch::WatchStream;

/// Result type for broker primitives.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// What kind of write produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// A value was written.
    Put,
    /// The value was deleted; history is kept.
    Delete,
    /// The value and its history were removed.
    Purge,
}

/// A stored revision of one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketEntry {
    /// The subject.
    pub key: String,
    /// The value (opaque bytes, empty for tombstones).
    pub value: Vec<u8>,
    /// Revision of this entry.
    pub revision: u64,
    pub operation: Operation,
    /// When the entry was written.
    pub created_at: SystemTime,
}

impl BucketEntry {
    /// True for entries that carry a live value.
    pub fn is_put(&self) -> bool {
        self.operation == Operation::Put
    }
}

/// Options for [`KvBucket::watch_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Suppress delete and purge entries from the feed.
    pub ignore_deletes: bool,
}

impl WatchOptions {
    /// Options that suppress delete and purge entries.
    pub fn ignore_deletes() -> Self {
        Self {
            ignore_deletes: true,
        }
    }
}

/// The revisioned key-value primitive.
///
/// Object safe; the store holds it as `Arc<dyn KvBucket>`.
#[async_trait]
pub trait KvBucket: Send + Sync {
    /// Bucket name, for logging.
    fn name(&self) -> &str;

    /// Latest live entry for a subject.
    ///
    /// Returns `None` if the subject was never written or its latest entry is
    /// a tombstone.
    async fn get(&self, key: &str) -> BrokerResult<Option<BucketEntry>>;

    /// A specific revision of a subject.
    ///
    /// Returns `None` if the revision is not retained or is a tombstone.
    async fn get_revision(&self, key: &str, revision: u64) -> BrokerResult<Option<BucketEntry>>;

    /// Every retained entry of a subject, oldest first, tombstones included.
    ///
    /// Returns an empty vector if nothing is retained.
    async fn history(&self, key: &str) -> BrokerResult<Vec<BucketEntry>>;

    /// Unconditional write. Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> BrokerResult<u64>;

    /// Write only if `expected` is the subject's current revision (0 for a
    /// subject that was never written). Returns the new revision.
    async fn update(&self, key: &str, value: Vec<u8>, expected: u64) -> BrokerResult<u64>;

    /// Write a delete tombstone.
    async fn delete(&self, key: &str) -> BrokerResult<()>;

    /// Watch every subject in the bucket.
    async fn watch_all(&self, options: WatchOptions) -> BrokerResult<WatchStream>;
}

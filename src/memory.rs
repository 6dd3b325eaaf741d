//! In-memory bucket implementation.
//!
//! Honours the [`KvBucket`] contract: per-subject revisions, bounded history
//! with tombstones, atomic compare-and-swap and snapshot-then-live watches.
//!
//! This implementation is NOT durable - data is lost on process exit.
//! Use for testing and development only.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use crate::bucket::{BrokerResult, BucketEntry, KvBucket, Operation, WatchOptions};
use crate::error::BrokerError;
use crate::watch::{WatchSender, WatchStream};

/// Retained revisions per subject when none is configured.
pub const DEFAULT_HISTORY: usize = 1;

/// Largest retention depth a bucket accepts.
pub const MAX_HISTORY: usize = 64;

#[derive(Default)]
struct SubjectLog {
    entries: VecDeque<BucketEntry>,
    revision: u64,
    /// Bucket-wide sequence of the latest write, orders watch snapshots.
    sequence: u64,
}

#[derive(Default)]
struct BucketState {
    subjects: HashMap<String, SubjectLog>,
    sequence: u64,
}

/// In-memory implementation of [`KvBucket`].
///
/// Cloning shares the underlying data.
#[derive(Clone)]
pub struct MemoryBucket {
    name: String,
    history: usize,
    data: Arc<RwLock<BucketState>>,
    watcher: WatchSender,
}

impl MemoryBucket {
    /// Create a new empty bucket keeping only the latest revision.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_history(name, DEFAULT_HISTORY)
    }

    /// Create a new empty bucket retaining up to `history` revisions per
    /// subject, clamped to `1..=MAX_HISTORY`.
    pub fn with_history(name: impl Into<String>, history: usize) -> Self {
        Self {
            name: name.into(),
            history: history.clamp(1, MAX_HISTORY),
            data: Arc::new(RwLock::new(BucketState::default())),
            watcher: WatchSender::new(1024),
        }
    }

    /// Retained revisions per subject.
    pub fn history_depth(&self) -> usize {
        self.history
    }

    /// Number of subjects holding a live value.
    pub fn len(&self) -> usize {
        self.data
            .read()
            .subjects
            .values()
            .filter(|log| log.entries.back().is_some_and(BucketEntry::is_put))
            .count()
    }

    /// True if no subject holds a live value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a write to a subject. The caller holds the write lock, so
    /// watchers never observe a gap between snapshot and live updates.
    fn append(
        &self,
        state: &mut BucketState,
        key: &str,
        value: Vec<u8>,
        operation: Operation,
    ) -> u64 {
        state.sequence += 1;
        let sequence = state.sequence;

        let log = state.subjects.entry(key.to_string()).or_default();
        log.revision += 1;
        log.sequence = sequence;

        let entry = BucketEntry {
            key: key.to_string(),
            value,
            revision: log.revision,
            operation,
            created_at: SystemTime::now(),
        };
        log.entries.push_back(entry.clone());
        while log.entries.len() > self.history {
            log.entries.pop_front();
        }

        self.watcher.send(entry);
        log.revision
    }
}

fn check_key(key: &str) -> BrokerResult<()> {
    if key.is_empty()
        || key.split('.').any(str::is_empty)
        || key.contains(['*', '>'])
        || key.chars().any(char::is_whitespace)
    {
        return Err(BrokerError::other(format!("invalid key {:?}", key)));
    }
    Ok(())
}

#[async_trait]
impl KvBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<BucketEntry>> {
        check_key(key)?;
        let data = self.data.read();
        Ok(data
            .subjects
            .get(key)
            .and_then(|log| log.entries.back())
            .filter(|entry| entry.is_put())
            .cloned())
    }

    async fn get_revision(&self, key: &str, revision: u64) -> BrokerResult<Option<BucketEntry>> {
        check_key(key)?;
        let data = self.data.read();
        Ok(data.subjects.get(key).and_then(|log| {
            log.entries
                .iter()
                .find(|entry| entry.revision == revision && entry.is_put())
                .cloned()
        }))
    }

    async fn history(&self, key: &str) -> BrokerResult<Vec<BucketEntry>> {
        check_key(key)?;
        let data = self.data.read();
        Ok(data
            .subjects
            .get(key)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> BrokerResult<u64> {
        check_key(key)?;
        let mut data = self.data.write();
        Ok(self.append(&mut data, key, value, Operation::Put))
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected: u64) -> BrokerResult<u64> {
        check_key(key)?;
        let mut data = self.data.write();
        let current = data.subjects.get(key).map(|log| log.revision).unwrap_or(0);
        if current != expected {
            return Err(BrokerError::WrongLastRevision {
                expected,
                current: Some(current),
            });
        }
        Ok(self.append(&mut data, key, value, Operation::Put))
    }

    async fn delete(&self, key: &str) -> BrokerResult<()> {
        check_key(key)?;
        let mut data = self.data.write();
        self.append(&mut data, key, Vec::new(), Operation::Delete);
        Ok(())
    }

    async fn watch_all(&self, options: WatchOptions) -> BrokerResult<WatchStream> {
        let data = self.data.read();
        let mut latest: Vec<(u64, BucketEntry)> = data
            .subjects
            .values()
            .filter_map(|log| log.entries.back().map(|entry| (log.sequence, entry.clone())))
            .collect();
        latest.sort_by_key(|(sequence, _)| *sequence);
        let live = self.watcher.subscribe();
        drop(data);

        let initial = latest.into_iter().map(|(_, entry)| entry).collect();
        Ok(WatchStream::snapshot_then_live(initial, live, options))
    }
}

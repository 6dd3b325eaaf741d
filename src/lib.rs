//! # univrs-natsjson
//!
//! Typed JSON storage and batch consumption over a message broker.
//!
//! Two components share one broker connection:
//!
//! - **[`KeyValueStore`]**: a typed key-value store. Keys are hashed into
//!   subjects, values are JSON, every write gets a revision, and
//!   [`update`](KeyValueStore::update) is an optimistic compare-and-swap.
//! - **[`BatchProcessor`]**: pulls batches from a durable consumer, decodes
//!   them, hands the whole batch to a handler and acknowledges each message
//!   from its outcome.
//!
//! ## Backends
//!
//! The broker is reached through [`KvBucket`] and [`PullConsumer`].
//!
//! - [`MemoryBucket`] / [`MemoryStream`]: in-process, for tests and development
//! - `NatsBucket` / `NatsConsumer`: NATS JetStream (feature `nats`)
//!
//! ## Key-Value Store
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use univrs_natsjson::{KeyValueStore, MemoryBucket};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Person {
//!     name: String,
//!     age: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> univrs_natsjson::Result<()> {
//!     let people: KeyValueStore<Person> =
//!         KeyValueStore::new(Arc::new(MemoryBucket::with_history("people", 10)), "people")?;
//!
//!     let ada = Person { name: "ada".to_string(), age: 36 };
//!     let revision = people.put("ada", &ada).await?;
//!
//!     // Only succeeds if nobody wrote "ada" since we did
//!     let older = Person { age: 37, ..ada };
//!     match people.update("ada", &older, revision).await {
//!         Ok(revision) => println!("updated to revision {}", revision),
//!         Err(e) if e.is_conflict() => println!("lost the race, reload and retry"),
//!         Err(e) => return Err(e),
//!     }
//!
//!     let mut all = people.list().await;
//!     while let Some(person) = all.next().await? {
//!         println!("{:?}", person);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Batch Processing
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use univrs_natsjson::{BatchProcessor, MemoryStream, Outcome};
//!
//! #[derive(Debug, Deserialize)]
//! struct Event {
//!     id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> univrs_natsjson::Result<()> {
//!     let stream = MemoryStream::new("events");
//!     stream.publish("events.created", br#"{"id": 1}"#.to_vec());
//!
//!     let handler = |events: &[Event]| -> Vec<Outcome> {
//!         events.iter().map(|event| {
//!             println!("event {}", event.id);
//!             Ok(())
//!         }).collect()
//!     };
//!     let processor =
//!         BatchProcessor::<Event>::new(Arc::new(stream.consumer("worker")), 10, handler)?;
//!
//!     let cancel = CancellationToken::new();
//!     let summary = processor.process(&cancel).await?;
//!     println!("acked {} of {}", summary.acked, summary.fetched);
//!
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod bucket;
pub mod config;
pub mod consumer;
pub mod cursor;
pub mod error;
pub mod kv;
pub mod memory;
pub mod memory_stream;
#[cfg(feature = "nats")]
pub mod nats;
pub mod subject;
pub mod watch;

// Re-export main types
pub use batch::{
    BatchHandler, BatchProcessor, BatchProcessorBuilder, BatchSummary, FailedMessage,
    FailureHook, HandlerError, Outcome,
};
pub use bucket::{BrokerResult, BucketEntry, KvBucket, Operation, WatchOptions};
pub use config::{BatchConfig, FetchOption, FetchOptions, KvConfig};
pub use consumer::{ConsumerMessage, PullConsumer};
pub use cursor::{Cursor, CursorState, StopHandle};
pub use error::{AckErrors, AckFailure, AckKind, BrokerError, Error, Result};
pub use kv::{KeyValueStore, Revision};
pub use memory::MemoryBucket;
pub use memory_stream::{ConsumerConfig, ConsumerInfo, MemoryConsumer, MemoryMessage, MemoryStream};
#[cfg(feature = "nats")]
pub use nats::{NatsBucket, NatsConsumer, NatsMessage};
pub use subject::{to_subject, KeyCodec};
pub use watch::{WatchEvent, WatchStream};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::batch::{BatchHandler, BatchProcessor, Outcome};
    pub use crate::bucket::KvBucket;
    pub use crate::config::{BatchConfig, FetchOption, KvConfig};
    pub use crate::consumer::PullConsumer;
    pub use crate::cursor::Cursor;
    pub use crate::error::{Error, Result};
    pub use crate::kv::{KeyValueStore, Revision};
    pub use crate::memory::MemoryBucket;
    pub use crate::memory_stream::MemoryStream;
}

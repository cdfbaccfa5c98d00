//! Expiring key-value dictionaries over a partitioned entity row-store.
//!
//! A [`TableDictionary`] stores each entry as one row: the dictionary name
//! is the partition key, the entry key is the row key, and the value is
//! flattened into typed row properties. Entries may carry a time-to-live;
//! expired entries are invisible to every read and are reaped on demand.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        TableDictionary<C, V>   /   BlockingTableDictionary  │
//! │   (key normalization, validation, expiry, paging, batches)  │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │            codec             │        TableBatchWriter      │
//! │  (V <-> property bag, cycle  │   (partition grouping,       │
//! │   detection, leaf "Value")   │    per-operation results)    │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                      TableClient trait                      │
//! │   (point read/write, paged query, atomic batch, ETags)      │
//! ├──────────────────┬──────────────────────────────────────────┤
//! │ MemoryTableClient│  RetryingTableClient<C>  │ your client   │
//! └──────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use table_dictionary::{MemoryTableClient, TableDictionary, impl_entity_value};
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Session {
//!     user: String,
//!     visits: i32,
//! }
//!
//! impl_entity_value!(Session { user, visits });
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let sessions: TableDictionary<_, Session> =
//!     TableDictionary::new(MemoryTableClient::new(), "Dictionaries", "sessions")?;
//! sessions.ensure_table().await?;
//!
//! let session = Session { user: "alice".into(), visits: 3 };
//! sessions.add_or_update("s-1", &session, Some(Duration::from_secs(3600))).await?;
//!
//! assert_eq!(sessions.get("s-1").await?, session);
//! assert!(!sessions.contains_key("s-2").await?);
//! # Ok::<(), table_dictionary::StorageError>(())
//! # }).unwrap();
//! ```
//!
//! # Error Handling
//!
//! Every operation returns [`StorageResult<T>`]. Validation errors are
//! raised locally before any store call; store failures are mapped by each
//! [`TableClient`] onto [`StorageError`]. Transient failures can be retried
//! transparently by wrapping a client in [`RetryingTableClient`].
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (counting client, assertion macros) and the
//!   [`TableClient`] `conformance` suite. Enable this in `[dev-dependencies]` for integration
//!   tests.
//! - **`failpoints`**: Activates `fail_point!` injection sites for fault-injection tests.

#![deny(unsafe_code)]

pub mod batch;
pub mod blocking;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod dictionary;
pub mod entity;
pub mod error;
pub mod memory;
pub mod retry;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod validation;

// Re-export primary types at crate root for convenience
pub use batch::{
    BatchFlushStats, BatchResult, DEFAULT_MAX_BATCH_SIZE, OperationGroup, TableBatchWriter,
    group_operations,
};
pub use blocking::{BlockingStreamIter, BlockingTableDictionary};
pub use client::{MAX_BATCH_OPERATIONS, TableClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{EntityReader, EntityValue, EntityWriter, Field, FieldShape};
pub use config::{DEFAULT_PAGE_SIZE, DictionaryConfig, KeyCase};
pub use dictionary::{EXPIRES_AT_PROPERTY, TableDictionary};
pub use entity::{
    ContinuationToken, ETag, Entity, EntityQuery, PropertyKind, PropertyMap, PropertyValue,
    QueryPage, RowAddress, TableOperation,
};
pub use error::{BoxError, ConfigError, ErrorKind, StorageError, StorageResult};
pub use memory::MemoryTableClient;
pub use retry::{RetryConfig, RetryingTableClient};
pub use validation::PropertyLimits;

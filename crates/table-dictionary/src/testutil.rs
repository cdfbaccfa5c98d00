//! Shared test utilities for dictionary and client testing.
//!
//! Feature-gated behind `testutil` so none of it leaks into production
//! builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! table-dictionary = { path = "../table-dictionary", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use table_dictionary::testutil::{CountingTableClient, make_key, memory_dictionary};
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;

use crate::{
    StorageResult,
    client::TableClient,
    codec::EntityValue,
    dictionary::TableDictionary,
    entity::{ContinuationToken, ETag, Entity, EntityQuery, QueryPage, TableOperation},
    memory::MemoryTableClient,
};

/// Table used by the helpers in this module.
pub const TEST_TABLE: &str = "Dictionaries";

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"`. The zero-padding keeps row-key
/// order equal to numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> String {
    format!("{prefix}:{idx:06}")
}

/// Create a dictionary named `name` over a fresh [`MemoryTableClient`],
/// with [`TEST_TABLE`] already created.
///
/// # Panics
///
/// Panics if `name` is not a valid dictionary name.
#[allow(clippy::expect_used)]
pub async fn memory_dictionary<V: EntityValue>(name: &str) -> TableDictionary<MemoryTableClient, V> {
    let dict = TableDictionary::new(MemoryTableClient::new(), TEST_TABLE, name)
        .expect("valid dictionary name");
    dict.ensure_table().await.expect("memory table creation");
    dict
}

/// Per-method call counters of a [`CountingTableClient`].
#[derive(Debug, Default)]
pub struct CallCounts {
    create_table: AtomicUsize,
    delete_table: AtomicUsize,
    get: AtomicUsize,
    upsert: AtomicUsize,
    merge: AtomicUsize,
    delete: AtomicUsize,
    query: AtomicUsize,
    batch: AtomicUsize,
}

impl CallCounts {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// `get_entity` calls.
    #[must_use]
    pub fn gets(&self) -> usize {
        self.get.load(Ordering::Relaxed)
    }

    /// `upsert_entity` calls.
    #[must_use]
    pub fn upserts(&self) -> usize {
        self.upsert.load(Ordering::Relaxed)
    }

    /// `merge_entity` calls.
    #[must_use]
    pub fn merges(&self) -> usize {
        self.merge.load(Ordering::Relaxed)
    }

    /// `delete_entity` calls.
    #[must_use]
    pub fn deletes(&self) -> usize {
        self.delete.load(Ordering::Relaxed)
    }

    /// `query_entities` calls (one per page).
    #[must_use]
    pub fn queries(&self) -> usize {
        self.query.load(Ordering::Relaxed)
    }

    /// `execute_batch` calls.
    #[must_use]
    pub fn batches(&self) -> usize {
        self.batch.load(Ordering::Relaxed)
    }

    /// Every call, table management included.
    #[must_use]
    pub fn total(&self) -> usize {
        [
            &self.create_table,
            &self.delete_table,
            &self.get,
            &self.upsert,
            &self.merge,
            &self.delete,
            &self.query,
            &self.batch,
        ]
        .iter()
        .map(|counter| counter.load(Ordering::Relaxed))
        .sum()
    }
}

/// A [`TableClient`] wrapper that counts the calls reaching the store.
///
/// Clones share their counters.
#[derive(Debug, Clone)]
pub struct CountingTableClient<C> {
    inner: C,
    counts: Arc<CallCounts>,
}

impl<C> CountingTableClient<C> {
    /// Wraps `inner` with zeroed counters.
    pub fn new(inner: C) -> Self {
        Self { inner, counts: Arc::new(CallCounts::default()) }
    }

    /// The counters.
    #[must_use]
    pub fn counts(&self) -> &CallCounts {
        &self.counts
    }

    /// The wrapped client.
    #[must_use]
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: TableClient> TableClient for CountingTableClient<C> {
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool> {
        CallCounts::bump(&self.counts.create_table);
        self.inner.create_table_if_not_exists(table).await
    }

    async fn delete_table(&self, table: &str) -> StorageResult<()> {
        CallCounts::bump(&self.counts.delete_table);
        self.inner.delete_table(table).await
    }

    async fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Entity> {
        CallCounts::bump(&self.counts.get);
        self.inner.get_entity(table, partition_key, row_key).await
    }

    async fn upsert_entity(&self, table: &str, entity: Entity) -> StorageResult<ETag> {
        CallCounts::bump(&self.counts.upsert);
        self.inner.upsert_entity(table, entity).await
    }

    async fn merge_entity(
        &self,
        table: &str,
        entity: Entity,
        expected: Option<&ETag>,
    ) -> StorageResult<ETag> {
        CallCounts::bump(&self.counts.merge);
        self.inner.merge_entity(table, entity, expected).await
    }

    async fn delete_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected: Option<&ETag>,
    ) -> StorageResult<()> {
        CallCounts::bump(&self.counts.delete);
        self.inner.delete_entity(table, partition_key, row_key, expected).await
    }

    async fn query_entities(
        &self,
        table: &str,
        query: &EntityQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QueryPage> {
        CallCounts::bump(&self.counts.query);
        self.inner.query_entities(table, query, continuation).await
    }

    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> StorageResult<Vec<Option<ETag>>> {
        CallCounts::bump(&self.counts.batch);
        self.inner.execute_batch(table, operations).await
    }
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`](crate::StorageError::Conflict).
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use table_dictionary::{StorageError, StorageResult, assert_conflict};
///
/// let result: StorageResult<()> = Err(StorageError::Conflict);
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::NotFound`](crate::StorageError::NotFound).
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NotFound { .. })),
            "expected StorageError::NotFound, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NotFound { .. })),
            "{}: expected StorageError::NotFound, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] failed local validation (including size
/// limits and configuration errors).
#[macro_export]
macro_rules! assert_validation {
    ($result:expr) => {{
        let result = &$result;
        assert!(
            matches!(result, Err(e) if e.is_validation()),
            "expected a validation error, got: {:?}",
            result,
        );
    }};
}

/// Assert that a [`StorageResult`] is `Ok`, returning the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StorageError: {e:?}", $msg),
        }
    };
}

//! Row-store client trait.
//!
//! [`TableClient`] is the seam between the dictionary and a concrete
//! partitioned row-store. Implementations map their transport and service
//! errors onto [`StorageError`](crate::StorageError) so the layers above
//! never see store-specific types.
//!
//! # Implementing a Client
//!
//! 1. Implement every method of [`TableClient`].
//! 2. Report a missing row or table as [`StorageError::NotFound`](crate::StorageError::NotFound),
//!    a failed version check as [`StorageError::Conflict`](crate::StorageError::Conflict).
//! 3. Run the contract suite from [`conformance`](crate::conformance) (behind the `testutil`
//!    feature) against it.
//!
//! See [`MemoryTableClient`](crate::MemoryTableClient) for a reference
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    StorageResult,
    entity::{ContinuationToken, ETag, Entity, EntityQuery, QueryPage, TableOperation},
};

/// Maximum operations a store accepts in one atomic batch.
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// Abstract partitioned row-store client.
///
/// Clients must be thread-safe and are usually cheap to clone or are
/// shared behind an [`Arc`].
///
/// # Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`create_table_if_not_exists`](TableClient::create_table_if_not_exists) | Idempotent table creation |
/// | [`delete_table`](TableClient::delete_table) | Drop a table and its rows |
/// | [`get_entity`](TableClient::get_entity) | Point read |
/// | [`upsert_entity`](TableClient::upsert_entity) | Insert or replace |
/// | [`merge_entity`](TableClient::merge_entity) | Merge properties into a row |
/// | [`delete_entity`](TableClient::delete_entity) | Point delete |
/// | [`query_entities`](TableClient::query_entities) | Paged range scan |
/// | [`execute_batch`](TableClient::execute_batch) | Atomic single-partition batch |
#[async_trait]
pub trait TableClient: Send + Sync {
    /// Creates `table` if it does not exist.
    ///
    /// Returns `true` if the table was created by this call.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool>;

    /// Deletes `table` and every row in it.
    ///
    /// # Errors
    ///
    /// [`NotFound`](crate::StorageError::NotFound) if the table does not exist.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete_table(&self, table: &str) -> StorageResult<()>;

    /// Reads one row.
    ///
    /// # Errors
    ///
    /// [`NotFound`](crate::StorageError::NotFound) if the table or row does
    /// not exist.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Entity>;

    /// Inserts `entity`, replacing any existing row at its address.
    ///
    /// Returns the new version token.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn upsert_entity(&self, table: &str, entity: Entity) -> StorageResult<ETag>;

    /// Merges `entity`'s properties into the row at its address.
    ///
    /// With `expected: None` a missing row is created. With a token the row
    /// must exist and match it ([`ETag::any`] matches any existing row).
    ///
    /// # Errors
    ///
    /// [`Conflict`](crate::StorageError::Conflict) on a version mismatch,
    /// [`NotFound`](crate::StorageError::NotFound) if a version was supplied
    /// and the row does not exist.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn merge_entity(
        &self,
        table: &str,
        entity: Entity,
        expected: Option<&ETag>,
    ) -> StorageResult<ETag>;

    /// Deletes one row.
    ///
    /// # Errors
    ///
    /// [`NotFound`](crate::StorageError::NotFound) if the row does not
    /// exist, [`Conflict`](crate::StorageError::Conflict) if `expected` does
    /// not match.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected: Option<&ETag>,
    ) -> StorageResult<()>;

    /// Returns one page of rows matching `query`, in (partition key, row
    /// key) order, starting at `continuation`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn query_entities(
        &self,
        table: &str,
        query: &EntityQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QueryPage>;

    /// Applies `operations` atomically.
    ///
    /// All operations must share one partition key, touch distinct rows,
    /// and number between 1 and [`MAX_BATCH_OPERATIONS`]. Returns one entry
    /// per operation: the new version token for writes, `None` for deletes.
    ///
    /// # Errors
    ///
    /// [`InvalidArgument`](crate::StorageError::InvalidArgument) if the
    /// batch shape is invalid. If any single operation fails, nothing is
    /// applied and the error is [`BatchOperation`](crate::StorageError::BatchOperation)
    /// carrying the failing operation's position.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> StorageResult<Vec<Option<ETag>>>;
}

#[async_trait]
impl<C: TableClient + ?Sized> TableClient for Arc<C> {
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool> {
        (**self).create_table_if_not_exists(table).await
    }

    async fn delete_table(&self, table: &str) -> StorageResult<()> {
        (**self).delete_table(table).await
    }

    async fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Entity> {
        (**self).get_entity(table, partition_key, row_key).await
    }

    async fn upsert_entity(&self, table: &str, entity: Entity) -> StorageResult<ETag> {
        (**self).upsert_entity(table, entity).await
    }

    async fn merge_entity(
        &self,
        table: &str,
        entity: Entity,
        expected: Option<&ETag>,
    ) -> StorageResult<ETag> {
        (**self).merge_entity(table, entity, expected).await
    }

    async fn delete_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected: Option<&ETag>,
    ) -> StorageResult<()> {
        (**self).delete_entity(table, partition_key, row_key, expected).await
    }

    async fn query_entities(
        &self,
        table: &str,
        query: &EntityQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QueryPage> {
        (**self).query_entities(table, query, continuation).await
    }

    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> StorageResult<Vec<Option<ETag>>> {
        (**self).execute_batch(table, operations).await
    }
}

#[async_trait]
impl<C: TableClient + ?Sized> TableClient for &C {
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool> {
        (**self).create_table_if_not_exists(table).await
    }

    async fn delete_table(&self, table: &str) -> StorageResult<()> {
        (**self).delete_table(table).await
    }

    async fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Entity> {
        (**self).get_entity(table, partition_key, row_key).await
    }

    async fn upsert_entity(&self, table: &str, entity: Entity) -> StorageResult<ETag> {
        (**self).upsert_entity(table, entity).await
    }

    async fn merge_entity(
        &self,
        table: &str,
        entity: Entity,
        expected: Option<&ETag>,
    ) -> StorageResult<ETag> {
        (**self).merge_entity(table, entity, expected).await
    }

    async fn delete_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected: Option<&ETag>,
    ) -> StorageResult<()> {
        (**self).delete_entity(table, partition_key, row_key, expected).await
    }

    async fn query_entities(
        &self,
        table: &str,
        query: &EntityQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QueryPage> {
        (**self).query_entities(table, query, continuation).await
    }

    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> StorageResult<Vec<Option<ETag>>> {
        (**self).execute_batch(table, operations).await
    }
}

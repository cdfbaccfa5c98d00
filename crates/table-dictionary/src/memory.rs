//! In-memory row-store client.
//!
//! [`MemoryTableClient`] implements [`TableClient`] over nested
//! [`BTreeMap`]s guarded by a [`parking_lot::RwLock`]. It is the reference
//! implementation used by the test suite and is suitable for development.
//!
//! # Example
//!
//! ```
//! use table_dictionary::{Entity, MemoryTableClient, PropertyValue, TableClient};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let client = MemoryTableClient::new();
//! client.create_table_if_not_exists("Items").await.unwrap();
//!
//! let entity = Entity::new("p", "r").with_property("n", PropertyValue::Int32(1));
//! client.upsert_entity("Items", entity).await.unwrap();
//!
//! let stored = client.get_entity("Items", "p", "r").await.unwrap();
//! assert_eq!(stored.property("n"), Some(&PropertyValue::Int32(1)));
//! # });
//! ```
//!
//! # Semantics
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | any row operation on a missing table | `NotFound` |
//! | `get_entity` / `delete_entity` on a missing row | `NotFound` |
//! | version token mismatch | `Conflict` |
//! | `Insert` over an existing row | `Conflict` |
//! | batch with mixed partitions, repeated rows, 0 or >100 operations | `InvalidArgument` |
//!
//! # Limitations
//!
//! - Data is not persisted.
//! - Rows never expire on their own; expiry is the dictionary's concern.

use std::{
    collections::{BTreeMap, HashSet},
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fail::fail_point;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::{
    StorageError, StorageResult,
    client::{MAX_BATCH_OPERATIONS, TableClient},
    config::DEFAULT_PAGE_SIZE,
    entity::{
        ContinuationToken, ETag, Entity, EntityQuery, PropertyMap, QueryPage, RowAddress,
        TableOperation,
    },
};

type RowKey = (String, String);
type Rows = BTreeMap<RowKey, StoredRow>;

#[derive(Debug, Clone)]
struct StoredRow {
    properties: PropertyMap,
    etag: ETag,
    timestamp: DateTime<Utc>,
}

/// The outcome of one operation, computed before anything is applied.
struct Planned {
    key: RowKey,
    row: Option<StoredRow>,
}

/// In-memory [`TableClient`].
///
/// # Cloning
///
/// Clones share the same tables.
#[derive(Debug, Clone)]
pub struct MemoryTableClient {
    tables: Arc<RwLock<BTreeMap<String, Rows>>>,
    version: Arc<AtomicU64>,
    page_size: usize,
}

impl MemoryTableClient {
    /// Creates an empty store with the default page size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty store that returns at most `page_size` rows per
    /// query page. A zero page size is treated as 1.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tables: Arc::new(RwLock::new(BTreeMap::new())),
            version: Arc::new(AtomicU64::new(0)),
            page_size: page_size.max(1),
        }
    }

    /// Returns `true` if a row is physically present, expired or not.
    #[must_use]
    pub fn contains_row(&self, table: &str, partition_key: &str, row_key: &str) -> bool {
        self.tables.read().get(table).is_some_and(|rows| {
            rows.contains_key(&(partition_key.to_owned(), row_key.to_owned()))
        })
    }

    /// Number of rows physically present in `table`.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    fn next_etag(&self) -> ETag {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        ETag::new(format!("W/\"{version}\""))
    }

    fn stored(&self, properties: PropertyMap) -> StoredRow {
        StoredRow { properties, etag: self.next_etag(), timestamp: Utc::now() }
    }

    /// Computes the effect of `operation` against the current rows.
    fn plan(&self, rows: &Rows, operation: TableOperation) -> StorageResult<Planned> {
        let key = (operation.partition_key().to_owned(), operation.row_key().to_owned());
        let existing = rows.get(&key);
        let missing = || StorageError::not_found(RowAddress::new(&key.0, &key.1).to_string());

        let row = match operation {
            TableOperation::Insert(entity) => {
                if existing.is_some() {
                    return Err(StorageError::conflict());
                }
                Some(self.stored(entity.properties))
            },
            TableOperation::Upsert(entity) => Some(self.stored(entity.properties)),
            TableOperation::Merge { entity, expected } => match existing {
                None if expected.is_some() => return Err(missing()),
                None => Some(self.stored(entity.properties)),
                Some(current) => {
                    if let Some(expected) = &expected {
                        check_version(current, expected)?;
                    }
                    let mut properties = current.properties.clone();
                    properties.extend(entity.properties);
                    Some(self.stored(properties))
                },
            },
            TableOperation::Replace { entity, expected } => {
                let current = existing.ok_or_else(missing)?;
                check_version(current, &expected)?;
                Some(self.stored(entity.properties))
            },
            TableOperation::Delete { expected, .. } => {
                let current = existing.ok_or_else(missing)?;
                if let Some(expected) = &expected {
                    check_version(current, expected)?;
                }
                None
            },
        };
        Ok(Planned { key, row })
    }

    /// Plans and applies a single operation under the write lock.
    fn apply_one(&self, table: &str, operation: TableOperation) -> StorageResult<Option<ETag>> {
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| StorageError::not_found(table))?;
        let planned = self.plan(rows, operation)?;
        Ok(commit(rows, planned))
    }
}

impl Default for MemoryTableClient {
    fn default() -> Self {
        Self::new()
    }
}

fn check_version(current: &StoredRow, expected: &ETag) -> StorageResult<()> {
    if expected.is_any() || *expected == current.etag {
        Ok(())
    } else {
        Err(StorageError::conflict())
    }
}

fn commit(rows: &mut Rows, planned: Planned) -> Option<ETag> {
    match planned.row {
        Some(row) => {
            let etag = row.etag.clone();
            rows.insert(planned.key, row);
            Some(etag)
        },
        None => {
            rows.remove(&planned.key);
            None
        },
    }
}

fn to_entity(key: &RowKey, row: &StoredRow, select: Option<&[String]>) -> Entity {
    let properties = match select {
        Some(columns) => row
            .properties
            .iter()
            .filter(|(name, _)| columns.iter().any(|c| c == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
        None => row.properties.clone(),
    };
    Entity {
        partition_key: key.0.clone(),
        row_key: key.1.clone(),
        timestamp: Some(row.timestamp),
        etag: Some(row.etag.clone()),
        properties,
    }
}

/// Rejects batches the store would refuse outright.
fn check_batch_shape(operations: &[TableOperation]) -> StorageResult<()> {
    let Some(first) = operations.first() else {
        return Err(StorageError::invalid_argument("batch must contain at least one operation"));
    };
    if operations.len() > MAX_BATCH_OPERATIONS {
        return Err(StorageError::invalid_argument(format!(
            "batch has {} operations, limit is {MAX_BATCH_OPERATIONS}",
            operations.len()
        )));
    }
    let partition_key = first.partition_key();
    let mut seen = HashSet::with_capacity(operations.len());
    for operation in operations {
        if operation.partition_key() != partition_key {
            return Err(StorageError::invalid_argument(
                "all operations in a batch must share one partition key",
            ));
        }
        if !seen.insert(operation.row_key()) {
            return Err(StorageError::invalid_argument(format!(
                "row '{}' appears more than once in the batch",
                operation.row_key()
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl TableClient for MemoryTableClient {
    #[tracing::instrument(skip(self))]
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        if tables.contains_key(table) {
            return Ok(false);
        }
        tables.insert(table.to_owned(), Rows::new());
        debug!("table created");
        Ok(true)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_table(&self, table: &str) -> StorageResult<()> {
        match self.tables.write().remove(table) {
            Some(_) => Ok(()),
            None => Err(StorageError::not_found(table)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Entity> {
        let tables = self.tables.read();
        let rows = tables.get(table).ok_or_else(|| StorageError::not_found(table))?;
        let key = (partition_key.to_owned(), row_key.to_owned());
        match rows.get(&key) {
            Some(row) => Ok(to_entity(&key, row, None)),
            None => Err(StorageError::not_found(RowAddress::new(partition_key, row_key).to_string())),
        }
    }

    #[tracing::instrument(
        skip(self, entity),
        fields(partition_key = %entity.partition_key, row_key = %entity.row_key)
    )]
    async fn upsert_entity(&self, table: &str, entity: Entity) -> StorageResult<ETag> {
        let etag = self.apply_one(table, TableOperation::Upsert(entity))?;
        etag.ok_or_else(|| StorageError::internal("upsert produced no version"))
    }

    #[tracing::instrument(
        skip(self, entity),
        fields(partition_key = %entity.partition_key, row_key = %entity.row_key)
    )]
    async fn merge_entity(
        &self,
        table: &str,
        entity: Entity,
        expected: Option<&ETag>,
    ) -> StorageResult<ETag> {
        let operation = TableOperation::Merge { entity, expected: expected.cloned() };
        let etag = self.apply_one(table, operation)?;
        etag.ok_or_else(|| StorageError::internal("merge produced no version"))
    }

    #[tracing::instrument(skip(self))]
    async fn delete_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected: Option<&ETag>,
    ) -> StorageResult<()> {
        let operation = TableOperation::Delete {
            address: RowAddress::new(partition_key, row_key),
            expected: expected.cloned(),
        };
        self.apply_one(table, operation).map(|_| ())
    }

    #[tracing::instrument(skip(self, continuation), fields(resume = continuation.is_some()))]
    async fn query_entities(
        &self,
        table: &str,
        query: &EntityQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QueryPage> {
        fail_point!("table-query-page", |_| {
            Err(StorageError::unavailable("injected failure while reading a query page"))
        });

        let page_size = query.page_size.map_or(self.page_size, |n| n.min(self.page_size)).max(1);
        let tables = self.tables.read();
        let rows = tables.get(table).ok_or_else(|| StorageError::not_found(table))?;

        let start = match (continuation, &query.partition_key) {
            (Some(token), _) => Bound::Included((
                token.next_partition_key().to_owned(),
                token.next_row_key().to_owned(),
            )),
            (None, Some(partition_key)) => Bound::Included((partition_key.clone(), String::new())),
            (None, None) => Bound::Unbounded,
        };

        let mut matching = rows
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| query.partition_key.as_ref().is_none_or(|pk| key.0 == *pk));

        let select = query.select.as_deref();
        let entities: Vec<Entity> = matching
            .by_ref()
            .take(page_size)
            .map(|(key, row)| to_entity(key, row, select))
            .collect();
        let continuation =
            matching.next().map(|(key, _)| ContinuationToken::new(key.0.clone(), key.1.clone()));

        trace!(rows = entities.len(), more = continuation.is_some(), "query page read");
        Ok(QueryPage { entities, continuation })
    }

    #[tracing::instrument(skip(self, operations), fields(operations = operations.len()))]
    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> StorageResult<Vec<Option<ETag>>> {
        check_batch_shape(&operations)?;

        fail_point!("table-batch-before-commit", |_| {
            Err(StorageError::unavailable("injected failure before batch commit"))
        });

        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| StorageError::not_found(table))?;

        // Rows are distinct, so every operation can be planned against the
        // same snapshot before anything is applied.
        let mut plans = Vec::with_capacity(operations.len());
        for (index, operation) in operations.into_iter().enumerate() {
            let planned = self
                .plan(rows, operation)
                .map_err(|e| StorageError::batch_operation(index, e))?;
            plans.push(planned);
        }

        let etags: Vec<Option<ETag>> = plans.into_iter().map(|p| commit(rows, p)).collect();
        debug!(applied = etags.len(), "batch committed");
        Ok(etags)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::PropertyValue;

    const TABLE: &str = "Items";

    async fn client_with_table() -> MemoryTableClient {
        let client = MemoryTableClient::new();
        client.create_table_if_not_exists(TABLE).await.unwrap();
        client
    }

    fn row(pk: &str, rk: &str, n: i32) -> Entity {
        Entity::new(pk, rk).with_property("n", PropertyValue::Int32(n))
    }

    #[tokio::test]
    async fn create_table_is_idempotent() {
        let client = MemoryTableClient::new();
        assert!(client.create_table_if_not_exists(TABLE).await.unwrap());
        assert!(!client.create_table_if_not_exists(TABLE).await.unwrap());
    }

    #[tokio::test]
    async fn missing_table_is_not_found() {
        let client = MemoryTableClient::new();
        let err = client.get_entity("Nope", "p", "r").await.unwrap_err();
        assert!(err.is_not_found());
        let err = client.upsert_entity("Nope", row("p", "r", 1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn upsert_replaces_whole_row() {
        let client = client_with_table().await;
        client
            .upsert_entity(TABLE, row("p", "r", 1).with_property("extra", PropertyValue::Bool(true)))
            .await
            .unwrap();
        client.upsert_entity(TABLE, row("p", "r", 2)).await.unwrap();

        let stored = client.get_entity(TABLE, "p", "r").await.unwrap();
        assert_eq!(stored.property("n"), Some(&PropertyValue::Int32(2)));
        assert!(stored.property("extra").is_none());
        assert!(stored.etag.is_some());
        assert!(stored.timestamp.is_some());
    }

    #[tokio::test]
    async fn merge_keeps_untouched_properties() {
        let client = client_with_table().await;
        client
            .upsert_entity(TABLE, row("p", "r", 1).with_property("keep", PropertyValue::Bool(true)))
            .await
            .unwrap();
        client.merge_entity(TABLE, row("p", "r", 5), None).await.unwrap();

        let stored = client.get_entity(TABLE, "p", "r").await.unwrap();
        assert_eq!(stored.property("n"), Some(&PropertyValue::Int32(5)));
        assert_eq!(stored.property("keep"), Some(&PropertyValue::Bool(true)));
    }

    #[tokio::test]
    async fn merge_with_version_requires_existing_row() {
        let client = client_with_table().await;
        let err = client.merge_entity(TABLE, row("p", "r", 1), Some(&ETag::any())).await;
        assert!(err.unwrap_err().is_not_found());

        assert!(client.merge_entity(TABLE, row("p", "r", 1), None).await.is_ok());
    }

    #[tokio::test]
    async fn version_tokens_guard_writes() {
        let client = client_with_table().await;
        let first = client.upsert_entity(TABLE, row("p", "r", 1)).await.unwrap();
        let second = client.upsert_entity(TABLE, row("p", "r", 2)).await.unwrap();
        assert_ne!(first, second);

        let err = client.delete_entity(TABLE, "p", "r", Some(&first)).await.unwrap_err();
        assert!(err.is_conflict());
        client.delete_entity(TABLE, "p", "r", Some(&second)).await.unwrap();
        assert!(!client.contains_row(TABLE, "p", "r"));
    }

    #[tokio::test]
    async fn delete_missing_row_is_not_found() {
        let client = client_with_table().await;
        let err = client.delete_entity(TABLE, "p", "r", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn query_pages_within_partition() {
        let client = MemoryTableClient::with_page_size(2);
        client.create_table_if_not_exists(TABLE).await.unwrap();
        for (pk, rk) in [("a", "1"), ("b", "1"), ("b", "2"), ("b", "3"), ("c", "1")] {
            client.upsert_entity(TABLE, row(pk, rk, 0)).await.unwrap();
        }

        let query = EntityQuery::partition("b");
        let first = client.query_entities(TABLE, &query, None).await.unwrap();
        assert_eq!(first.entities.len(), 2);
        let token = first.continuation.expect("more rows in partition b");
        assert_eq!(token.next_row_key(), "3");

        let second = client.query_entities(TABLE, &query, Some(&token)).await.unwrap();
        assert_eq!(second.entities.len(), 1);
        assert_eq!(second.entities[0].row_key, "3");
        assert!(second.continuation.is_none());
    }

    #[tokio::test]
    async fn query_without_partition_spans_table() {
        let client = client_with_table().await;
        for (pk, rk) in [("a", "1"), ("b", "1")] {
            client.upsert_entity(TABLE, row(pk, rk, 0)).await.unwrap();
        }
        let page = client.query_entities(TABLE, &EntityQuery::all(), None).await.unwrap();
        assert_eq!(page.entities.len(), 2);
    }

    #[tokio::test]
    async fn query_projection_limits_columns() {
        let client = client_with_table().await;
        client
            .upsert_entity(TABLE, row("p", "r", 1).with_property("other", PropertyValue::Bool(true)))
            .await
            .unwrap();
        let query = EntityQuery::partition("p").select(["other"]);
        let page = client.query_entities(TABLE, &query, None).await.unwrap();
        let entity = &page.entities[0];
        assert_eq!(entity.properties.len(), 1);
        assert!(entity.property("other").is_some());
    }

    #[tokio::test]
    async fn batch_rejects_bad_shapes() {
        let client = client_with_table().await;

        let err = client.execute_batch(TABLE, Vec::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument { .. }));

        let mixed = vec![
            TableOperation::Upsert(row("a", "1", 0)),
            TableOperation::Upsert(row("b", "1", 0)),
        ];
        let err = client.execute_batch(TABLE, mixed).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument { .. }));

        let repeated = vec![
            TableOperation::Upsert(row("a", "1", 0)),
            TableOperation::Upsert(row("a", "1", 1)),
        ];
        let err = client.execute_batch(TABLE, repeated).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument { .. }));

        let too_many: Vec<_> = (0..=MAX_BATCH_OPERATIONS)
            .map(|i| TableOperation::Upsert(row("a", &i.to_string(), 0)))
            .collect();
        let err = client.execute_batch(TABLE, too_many).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let client = client_with_table().await;
        client.upsert_entity(TABLE, row("p", "exists", 0)).await.unwrap();

        let operations = vec![
            TableOperation::Upsert(row("p", "new", 1)),
            TableOperation::Insert(row("p", "exists", 1)),
        ];
        let err = client.execute_batch(TABLE, operations).await.unwrap_err();
        match err {
            StorageError::BatchOperation { index, source } => {
                assert_eq!(index, 1);
                assert!(source.is_conflict());
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(!client.contains_row(TABLE, "p", "new"));
        assert_eq!(client.row_count(TABLE), 1);
    }

    #[tokio::test]
    async fn batch_returns_versions_per_operation() {
        let client = client_with_table().await;
        client.upsert_entity(TABLE, row("p", "old", 0)).await.unwrap();

        let operations = vec![
            TableOperation::Upsert(row("p", "a", 1)),
            TableOperation::Delete { address: RowAddress::new("p", "old"), expected: None },
        ];
        let etags = client.execute_batch(TABLE, operations).await.unwrap();
        assert_eq!(etags.len(), 2);
        assert!(etags[0].is_some());
        assert!(etags[1].is_none());
        assert!(!client.contains_row(TABLE, "p", "old"));
    }

    #[tokio::test]
    async fn delete_table_drops_rows() {
        let client = client_with_table().await;
        client.upsert_entity(TABLE, row("p", "r", 0)).await.unwrap();
        client.delete_table(TABLE).await.unwrap();
        assert_eq!(client.row_count(TABLE), 0);
        assert!(client.delete_table(TABLE).await.unwrap_err().is_not_found());
    }
}

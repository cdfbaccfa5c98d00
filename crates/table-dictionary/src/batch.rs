//! Batch grouping and batched writes.
//!
//! The row-store only accepts atomic batches whose operations share one
//! partition key, touch distinct rows, and number at most
//! [`MAX_BATCH_OPERATIONS`]. [`group_operations`] splits an arbitrary
//! operation list into such groups, and [`TableBatchWriter`] accumulates
//! operations and executes one batch per group.
//!
//! # Grouping Rules
//!
//! - every group holds operations for exactly one partition key;
//! - no group exceeds `max_batch_size`, and none is empty;
//! - a row key never appears twice in one group (a repeat starts a new group);
//! - groups for a partition key appear in the order that partition key first
//!   appears in the input, and input order is kept inside and across them;
//! - every grouped operation remembers its position in the input.
//!
//! # Example
//!
//! ```
//! use table_dictionary::{Entity, MemoryTableClient, TableBatchWriter, TableClient};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let client = MemoryTableClient::new();
//! client.create_table_if_not_exists("Items").await.unwrap();
//!
//! let mut writer = TableBatchWriter::new(client.clone(), "Items", 100).unwrap();
//! writer.upsert(Entity::new("a", "1"));
//! writer.upsert(Entity::new("b", "1"));
//! writer.upsert(Entity::new("a", "2"));
//!
//! let stats = writer.flush_all().await.unwrap();
//! assert_eq!(stats.operations_count, 3);
//! assert_eq!(stats.batches_count, 2);
//! # });
//! ```

use std::{
    collections::{HashMap, HashSet},
    mem,
    sync::Arc,
    time::{Duration, Instant},
};

use fail::fail_point;
use tracing::{debug, trace, warn};

use crate::{
    ConfigError, StorageError, StorageResult,
    client::{MAX_BATCH_OPERATIONS, TableClient},
    entity::{ETag, Entity, RowAddress, TableOperation},
};

/// Default maximum operations per group.
pub const DEFAULT_MAX_BATCH_SIZE: usize = MAX_BATCH_OPERATIONS;

/// Operations for one partition key that can be executed as one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationGroup {
    partition_key: String,
    indices: Vec<usize>,
    operations: Vec<TableOperation>,
}

impl OperationGroup {
    fn new(partition_key: String) -> Self {
        Self { partition_key, indices: Vec::new(), operations: Vec::new() }
    }

    fn push(&mut self, index: usize, operation: TableOperation) {
        self.indices.push(index);
        self.operations.push(operation);
    }

    /// The partition key every operation in this group targets.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Positions of the grouped operations in the original input.
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// The grouped operations, in input order.
    #[must_use]
    pub fn operations(&self) -> &[TableOperation] {
        &self.operations
    }

    /// Number of operations in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Always `false` for groups produced by [`group_operations`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Splits the group into input positions and operations.
    #[must_use]
    pub fn into_parts(self) -> (Vec<usize>, Vec<TableOperation>) {
        (self.indices, self.operations)
    }
}

/// Groups `operations` into store-acceptable batches.
///
/// An empty input yields no groups.
///
/// # Errors
///
/// Returns [`ConfigError::BelowMinimum`] if `max_batch_size` is zero.
pub fn group_operations(
    operations: Vec<TableOperation>,
    max_batch_size: usize,
) -> Result<Vec<OperationGroup>, ConfigError> {
    if max_batch_size == 0 {
        return Err(ConfigError::BelowMinimum {
            field: "max_batch_size",
            min: "1".into(),
            value: "0".into(),
        });
    }

    // Bucket by partition key, keeping first-appearance order.
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<(usize, TableOperation)>> = HashMap::new();
    for (index, operation) in operations.into_iter().enumerate() {
        let partition_key = operation.partition_key();
        match buckets.get_mut(partition_key) {
            Some(bucket) => bucket.push((index, operation)),
            None => {
                let partition_key = partition_key.to_owned();
                order.push(partition_key.clone());
                buckets.insert(partition_key, vec![(index, operation)]);
            },
        }
    }

    let mut groups = Vec::new();
    for partition_key in order {
        let Some(bucket) = buckets.remove(&partition_key) else {
            continue;
        };
        let mut current = OperationGroup::new(partition_key.clone());
        let mut rows: HashSet<String> = HashSet::new();
        for (index, operation) in bucket {
            if current.len() == max_batch_size || rows.contains(operation.row_key()) {
                groups.push(mem::replace(&mut current, OperationGroup::new(partition_key.clone())));
                rows.clear();
            }
            rows.insert(operation.row_key().to_owned());
            current.push(index, operation);
        }
        if !current.is_empty() {
            groups.push(current);
        }
    }
    Ok(groups)
}

/// Statistics from a batch flush.
#[derive(Debug, Clone, Default)]
pub struct BatchFlushStats {
    /// Number of operations flushed.
    pub operations_count: usize,
    /// Number of operations that succeeded.
    pub succeeded_count: usize,
    /// Number of operations that failed.
    pub failed_count: usize,
    /// Number of groups executed.
    pub batches_count: usize,
    /// Time taken to flush.
    pub duration: Duration,
}

/// Per-operation outcome of a batch flush.
///
/// Entry `i` belongs to the `i`-th operation submitted. A successful write
/// carries the row's new version token, a successful delete `None`. When a
/// group fails, every operation in it shares the same error via `Arc`.
#[derive(Debug, Clone)]
pub struct BatchResult {
    results: Vec<Result<Option<ETag>, Arc<StorageError>>>,
    stats: BatchFlushStats,
}

impl BatchResult {
    /// Returns the per-operation results.
    #[must_use = "per-operation results indicate which operations succeeded or failed"]
    pub fn results(&self) -> &[Result<Option<ETag>, Arc<StorageError>>] {
        &self.results
    }

    /// Returns the flush statistics.
    #[must_use]
    pub fn stats(&self) -> &BatchFlushStats {
        &self.stats
    }

    /// Returns `true` if any operation failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.results.iter().any(Result::is_err)
    }

    /// Returns `true` if all operations succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    /// Returns the input positions of failed operations.
    #[must_use]
    pub fn failed_indices(&self) -> Vec<usize> {
        self.results.iter().enumerate().filter(|(_, r)| r.is_err()).map(|(i, _)| i).collect()
    }

    /// Returns the number of operations that succeeded.
    #[must_use]
    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    /// Returns the number of operations that failed.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_err()).count()
    }

    /// Collapses the result, returning the first error if any operation
    /// failed.
    ///
    /// # Errors
    ///
    /// The first failed operation's error.
    pub fn into_result(self) -> StorageResult<BatchFlushStats> {
        let mut first_err: Option<Arc<StorageError>> = None;
        for result in self.results {
            if let Err(e) = result
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        match first_err {
            None => Ok(self.stats),
            Some(arc_err) => match Arc::try_unwrap(arc_err) {
                Ok(e) => Err(e),
                Err(arc_err) => Err(StorageError::internal(arc_err.to_string())),
            },
        }
    }

    fn empty() -> Self {
        Self { results: Vec::new(), stats: BatchFlushStats::default() }
    }
}

/// Rewrites a batch-relative failure index to the caller's input position.
fn remap_index(err: StorageError, indices: &[usize]) -> StorageError {
    match err {
        StorageError::BatchOperation { index, source } => match indices.get(index) {
            Some(&original) => StorageError::BatchOperation { index: original, source },
            None => StorageError::BatchOperation { index, source },
        },
        other => other,
    }
}

/// Accumulates operations for one table and executes them group by group.
///
/// Each group is atomic; groups are not atomic with respect to each other.
#[derive(Debug)]
pub struct TableBatchWriter<C> {
    client: C,
    table: String,
    operations: Vec<TableOperation>,
    max_batch_size: usize,
}

impl<C: TableClient> TableBatchWriter<C> {
    /// Creates a writer for `table`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::BelowMinimum`] if `max_batch_size` is zero.
    /// - [`ConfigError::Inconsistent`] if it exceeds [`MAX_BATCH_OPERATIONS`].
    pub fn new(
        client: C,
        table: impl Into<String>,
        max_batch_size: usize,
    ) -> Result<Self, ConfigError> {
        check_max_batch_size(max_batch_size)?;
        Ok(Self { client, table: table.into(), operations: Vec::new(), max_batch_size })
    }

    /// Adds an operation.
    pub fn push(&mut self, operation: TableOperation) {
        self.operations.push(operation);
    }

    /// Adds an insert.
    pub fn insert(&mut self, entity: Entity) {
        self.push(TableOperation::Insert(entity));
    }

    /// Adds an insert-or-replace.
    pub fn upsert(&mut self, entity: Entity) {
        self.push(TableOperation::Upsert(entity));
    }

    /// Adds a merge.
    pub fn merge(&mut self, entity: Entity, expected: Option<ETag>) {
        self.push(TableOperation::Merge { entity, expected });
    }

    /// Adds a version-checked replace.
    pub fn replace(&mut self, entity: Entity, expected: ETag) {
        self.push(TableOperation::Replace { entity, expected });
    }

    /// Adds a delete.
    pub fn delete(&mut self, address: RowAddress, expected: Option<ETag>) {
        self.push(TableOperation::Delete { address, expected });
    }

    /// Returns the number of pending operations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.operations.len()
    }

    /// Returns the pending operations.
    #[must_use]
    pub fn pending_operations(&self) -> &[TableOperation] {
        &self.operations
    }

    /// Discards pending operations without executing them.
    pub fn clear(&mut self) {
        self.operations.clear();
    }

    async fn execute_group(
        &self,
        operations: Vec<TableOperation>,
    ) -> StorageResult<Vec<Option<ETag>>> {
        fail_point!("batch-before-execute", |_| {
            Err(StorageError::unavailable("injected failure before batch execute"))
        });
        self.client.execute_batch(&self.table, operations).await
    }

    /// Executes all pending operations with per-operation error reporting.
    ///
    /// A failing group marks every operation in it failed and processing
    /// continues with the remaining groups. Use [`flush_all`](Self::flush_all)
    /// for the all-or-nothing API.
    #[must_use = "flush results contain per-operation errors that must be inspected"]
    pub async fn flush(&mut self) -> BatchResult {
        if self.operations.is_empty() {
            return BatchResult::empty();
        }

        let start = Instant::now();
        let operations = mem::take(&mut self.operations);
        let total_ops = operations.len();

        let groups = match group_operations(operations, self.max_batch_size) {
            Ok(groups) => groups,
            Err(e) => {
                let err = Arc::new(StorageError::from(e));
                return BatchResult {
                    results: vec![Err(err); total_ops],
                    stats: BatchFlushStats {
                        operations_count: total_ops,
                        failed_count: total_ops,
                        duration: start.elapsed(),
                        ..BatchFlushStats::default()
                    },
                };
            },
        };
        let batches_count = groups.len();

        debug!(
            table = %self.table,
            operations = total_ops,
            batches = batches_count,
            "Flushing batch writes"
        );

        let mut results: Vec<Result<Option<ETag>, Arc<StorageError>>> = vec![Ok(None); total_ops];
        let mut succeeded_count = 0usize;
        let mut failed_count = 0usize;

        for (batch_idx, group) in groups.into_iter().enumerate() {
            let (indices, operations) = group.into_parts();

            let outcome = self.execute_group(operations).await.and_then(|etags| {
                if etags.len() == indices.len() {
                    Ok(etags)
                } else {
                    Err(StorageError::internal(format!(
                        "store returned {} results for a batch of {} operations",
                        etags.len(),
                        indices.len()
                    )))
                }
            });

            match outcome {
                Ok(etags) => {
                    succeeded_count += indices.len();
                    for (idx, etag) in indices.iter().zip(etags) {
                        results[*idx] = Ok(etag);
                    }
                    trace!(batch = batch_idx, ops = indices.len(), "Batch committed successfully");
                },
                Err(e) => {
                    let arc_err = Arc::new(remap_index(e, &indices));
                    warn!(batch = batch_idx, error = %arc_err, "Batch commit failed");
                    failed_count += indices.len();
                    for idx in indices {
                        results[idx] = Err(Arc::clone(&arc_err));
                    }
                },
            }
        }

        let stats = BatchFlushStats {
            operations_count: total_ops,
            succeeded_count,
            failed_count,
            batches_count,
            duration: start.elapsed(),
        };

        debug!(
            operations = stats.operations_count,
            succeeded = stats.succeeded_count,
            failed = stats.failed_count,
            batches = stats.batches_count,
            duration_ms = u64::try_from(stats.duration.as_millis()).unwrap_or(u64::MAX),
            "Batch flush complete"
        );

        BatchResult { results, stats }
    }

    /// Executes all pending operations, failing if any operation fails.
    ///
    /// # Errors
    ///
    /// Returns the first [`StorageError`] encountered across all groups.
    #[must_use = "flush may fail and partial results must be handled"]
    pub async fn flush_all(&mut self) -> StorageResult<BatchFlushStats> {
        self.flush().await.into_result()
    }
}

pub(crate) fn check_max_batch_size(max_batch_size: usize) -> Result<(), ConfigError> {
    if max_batch_size == 0 {
        return Err(ConfigError::BelowMinimum {
            field: "max_batch_size",
            min: "1".into(),
            value: "0".into(),
        });
    }
    if max_batch_size > MAX_BATCH_OPERATIONS {
        return Err(ConfigError::Inconsistent {
            field: "max_batch_size",
            reason: format!("{max_batch_size} exceeds the store limit of {MAX_BATCH_OPERATIONS}"),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::MemoryTableClient;

    const TABLE: &str = "Items";

    fn upsert(pk: &str, rk: &str) -> TableOperation {
        TableOperation::Upsert(Entity::new(pk, rk))
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(group_operations(Vec::new(), 10).unwrap().is_empty());
    }

    #[test]
    fn zero_max_rejected() {
        let err = group_operations(vec![upsert("a", "1")], 0).unwrap_err();
        assert!(err.to_string().contains("max_batch_size"), "{err}");
    }

    #[test]
    fn groups_follow_first_appearance_order() {
        let ops = vec![upsert("b", "1"), upsert("a", "1"), upsert("b", "2"), upsert("c", "1")];
        let groups = group_operations(ops, 10).unwrap();

        let keys: Vec<&str> = groups.iter().map(OperationGroup::partition_key).collect();
        assert_eq!(keys, ["b", "a", "c"]);
        assert_eq!(groups[0].indices(), &[0, 2]);
        assert_eq!(groups[1].indices(), &[1]);
        assert_eq!(groups[2].indices(), &[3]);
    }

    #[test]
    fn oversized_partition_is_chunked() {
        let ops: Vec<_> = (0..250).map(|i| upsert("p", &i.to_string())).collect();
        let groups = group_operations(ops, 100).unwrap();
        let sizes: Vec<usize> = groups.iter().map(OperationGroup::len).collect();
        assert_eq!(sizes, [100, 100, 50]);
        assert_eq!(groups[1].indices()[0], 100);
    }

    #[test]
    fn repeated_row_starts_new_group() {
        let ops = vec![
            upsert("p", "1"),
            upsert("p", "2"),
            TableOperation::Delete { address: RowAddress::new("p", "1"), expected: None },
        ];
        let groups = group_operations(ops, 10).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].indices(), &[0, 1]);
        assert_eq!(groups[1].indices(), &[2]);
    }

    fn arb_operations() -> impl Strategy<Value = Vec<TableOperation>> {
        prop::collection::vec((0u8..4, 0u8..20), 0..300).prop_map(|pairs| {
            pairs.into_iter().map(|(pk, rk)| upsert(&format!("p{pk}"), &format!("r{rk}"))).collect()
        })
    }

    proptest! {
        #[test]
        fn grouping_invariants(ops in arb_operations(), max in 1usize..=100) {
            let input = ops.clone();
            let groups = group_operations(ops, max).unwrap();

            let mut seen = Vec::new();
            for group in &groups {
                prop_assert!(!group.is_empty());
                prop_assert!(group.len() <= max);

                let mut rows = HashSet::new();
                for (index, operation) in group.indices().iter().zip(group.operations()) {
                    prop_assert_eq!(operation.partition_key(), group.partition_key());
                    prop_assert!(rows.insert(operation.row_key().to_owned()));
                    prop_assert_eq!(&input[*index], operation);
                }
                seen.extend_from_slice(group.indices());
            }

            // Every input appears exactly once.
            let mut sorted = seen.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..input.len()).collect::<Vec<_>>());

            // Per partition key, indices are strictly increasing across groups.
            let mut last: HashMap<&str, usize> = HashMap::new();
            for group in &groups {
                for &index in group.indices() {
                    if let Some(previous) = last.insert(group.partition_key(), index) {
                        prop_assert!(previous < index);
                    }
                }
            }
        }
    }

    #[test]
    fn writer_rejects_bad_batch_size() {
        let client = MemoryTableClient::new();
        assert!(TableBatchWriter::new(client.clone(), TABLE, 0).is_err());
        assert!(TableBatchWriter::new(client, TABLE, MAX_BATCH_OPERATIONS + 1).is_err());
    }

    #[tokio::test]
    async fn flush_writes_every_group() {
        let client = MemoryTableClient::new();
        client.create_table_if_not_exists(TABLE).await.unwrap();
        let mut writer = TableBatchWriter::new(client.clone(), TABLE, 5).unwrap();

        for i in 0..12 {
            writer.upsert(Entity::new("p", format!("r{i:02}")));
        }
        assert_eq!(writer.pending_count(), 12);

        let result = writer.flush().await;
        assert!(result.is_success());
        assert_eq!(result.stats().batches_count, 3);
        assert!(result.results().iter().all(|r| matches!(r, Ok(Some(_)))));
        assert_eq!(writer.pending_count(), 0);
        assert_eq!(client.row_count(TABLE), 12);
    }

    #[tokio::test]
    async fn failed_group_does_not_stop_others() {
        let client = MemoryTableClient::new();
        client.create_table_if_not_exists(TABLE).await.unwrap();
        client.upsert_entity(TABLE, Entity::new("a", "taken")).await.unwrap();

        let mut writer = TableBatchWriter::new(client.clone(), TABLE, 10).unwrap();
        writer.upsert(Entity::new("a", "free"));
        writer.upsert(Entity::new("b", "1"));
        writer.insert(Entity::new("a", "taken"));

        let result = writer.flush().await;
        assert_eq!(result.failed_indices(), [0, 2]);
        assert_eq!(result.succeeded_count(), 1);

        match &**result.results()[2].as_ref().unwrap_err() {
            StorageError::BatchOperation { index, source } => {
                assert_eq!(*index, 2, "index is remapped to the input position");
                assert!(source.is_conflict());
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(client.contains_row(TABLE, "b", "1"));
        assert!(!client.contains_row(TABLE, "a", "free"));
    }

    #[tokio::test]
    async fn flush_all_surfaces_first_error() {
        let client = MemoryTableClient::new();
        let mut writer = TableBatchWriter::new(client, "Missing", 10).unwrap();
        writer.upsert(Entity::new("a", "1"));
        let err = writer.flush_all().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn empty_flush_is_noop() {
        let client = MemoryTableClient::new();
        let mut writer = TableBatchWriter::new(client, TABLE, 10).unwrap();
        let stats = writer.flush_all().await.unwrap();
        assert_eq!(stats.operations_count, 0);
        assert_eq!(stats.batches_count, 0);
    }

    #[test]
    fn clear_discards_pending() {
        let mut writer = TableBatchWriter::new(MemoryTableClient::new(), TABLE, 10).unwrap();
        writer.delete(RowAddress::new("a", "1"), None);
        writer.clear();
        assert!(writer.pending_operations().is_empty());
    }
}

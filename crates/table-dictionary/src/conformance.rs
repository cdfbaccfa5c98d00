//! Conformance test suite for [`TableClient`] implementations.
//!
//! A set of async functions that check a client against the contract the
//! dictionary relies on. Every client, in-memory or remote, can run the
//! same suite.
//!
//! Each function uses its own table, so the functions can share one client
//! and run in any order.
//!
//! # Usage
//!
//! ```no_run
//! use table_dictionary::{MemoryTableClient, conformance};
//!
//! #[tokio::test]
//! async fn point_read_missing_row_is_not_found() {
//!     conformance::point_read_missing_row_is_not_found(&MemoryTableClient::new()).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | Tables | Idempotent creation, deletion |
//! | Point | Read, upsert, merge, delete semantics |
//! | Versions | ETag checks on merge and delete |
//! | Query | Ordering, partition scoping, paging, projection |
//! | Batch | Shape rules, atomicity, per-operation results |
//! | Concurrent | Exactly one winner for version-checked writes |

use std::sync::Arc;

use crate::{
    client::{MAX_BATCH_OPERATIONS, TableClient},
    entity::{ETag, Entity, EntityQuery, PropertyValue, RowAddress, TableOperation},
    error::StorageError,
};

async fn fresh_table<C: TableClient + ?Sized>(client: &C, table: &str) {
    client.create_table_if_not_exists(table).await.expect("create table");
}

fn row(partition_key: &str, row_key: &str, n: i32) -> Entity {
    Entity::new(partition_key, row_key).with_property("N", PropertyValue::Int32(n))
}

// ============================================================================
// Tables
// ============================================================================

/// Creating a table twice reports creation only the first time.
pub async fn table_creation_is_idempotent<C: TableClient + ?Sized>(client: &C) {
    assert!(client.create_table_if_not_exists("ConfCreate").await.expect("first create"));
    assert!(!client.create_table_if_not_exists("ConfCreate").await.expect("second create"));
}

/// Deleting a table removes its rows; deleting it again is `NotFound`.
pub async fn table_deletion_drops_rows<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfDrop").await;
    client.upsert_entity("ConfDrop", row("p", "r", 1)).await.expect("upsert");
    client.delete_table("ConfDrop").await.expect("delete table");

    let missing = client.delete_table("ConfDrop").await;
    assert!(matches!(missing, Err(StorageError::NotFound { .. })), "got {missing:?}");
    let read = client.get_entity("ConfDrop", "p", "r").await;
    assert!(matches!(read, Err(StorageError::NotFound { .. })), "got {read:?}");
}

// ============================================================================
// Point operations
// ============================================================================

/// Reading an absent row is `NotFound`.
pub async fn point_read_missing_row_is_not_found<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfMissing").await;
    let result = client.get_entity("ConfMissing", "p", "nope").await;
    assert!(matches!(result, Err(StorageError::NotFound { .. })), "got {result:?}");
}

/// Upsert then read returns the properties and the version token.
pub async fn upsert_then_read_round_trips<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfUpsert").await;
    let etag = client.upsert_entity("ConfUpsert", row("p", "r", 7)).await.expect("upsert");
    let entity = client.get_entity("ConfUpsert", "p", "r").await.expect("get");

    assert_eq!(entity.property("N"), Some(&PropertyValue::Int32(7)));
    assert_eq!(entity.etag.as_ref(), Some(&etag));
}

/// Upsert replaces the whole row, dropping properties not re-sent.
pub async fn upsert_replaces_all_properties<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfReplace").await;
    let first = row("p", "r", 1).with_property("Extra", PropertyValue::Bool(true));
    client.upsert_entity("ConfReplace", first).await.expect("first upsert");
    client.upsert_entity("ConfReplace", row("p", "r", 2)).await.expect("second upsert");

    let entity = client.get_entity("ConfReplace", "p", "r").await.expect("get");
    assert_eq!(entity.property("Extra"), None);
    assert_eq!(entity.property("N"), Some(&PropertyValue::Int32(2)));
}

/// Merge keeps properties it does not mention.
pub async fn merge_keeps_untouched_properties<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfMerge").await;
    client.upsert_entity("ConfMerge", row("p", "r", 1)).await.expect("upsert");
    let patch = Entity::new("p", "r").with_property("Flag", PropertyValue::Bool(true));
    client.merge_entity("ConfMerge", patch, None).await.expect("merge");

    let entity = client.get_entity("ConfMerge", "p", "r").await.expect("get");
    assert_eq!(entity.property("N"), Some(&PropertyValue::Int32(1)));
    assert_eq!(entity.property("Flag"), Some(&PropertyValue::Bool(true)));
}

/// Deleting an absent row is `NotFound`.
pub async fn delete_missing_row_is_not_found<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfDelete").await;
    let result = client.delete_entity("ConfDelete", "p", "nope", None).await;
    assert!(matches!(result, Err(StorageError::NotFound { .. })), "got {result:?}");
}

// ============================================================================
// Versions
// ============================================================================

/// Every write produces a new version token.
pub async fn writes_change_the_version<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfVersions").await;
    let first = client.upsert_entity("ConfVersions", row("p", "r", 1)).await.expect("upsert");
    let second = client.upsert_entity("ConfVersions", row("p", "r", 2)).await.expect("upsert");
    assert_ne!(first, second);
}

/// A stale token fails merge and delete with `Conflict`; the wildcard
/// token matches any existing row.
pub async fn stale_version_conflicts<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfStale").await;
    let stale = client.upsert_entity("ConfStale", row("p", "r", 1)).await.expect("upsert");
    client.upsert_entity("ConfStale", row("p", "r", 2)).await.expect("upsert");

    let merge = client.merge_entity("ConfStale", row("p", "r", 3), Some(&stale)).await;
    assert!(matches!(merge, Err(StorageError::Conflict)), "got {merge:?}");
    let delete = client.delete_entity("ConfStale", "p", "r", Some(&stale)).await;
    assert!(matches!(delete, Err(StorageError::Conflict)), "got {delete:?}");

    client.delete_entity("ConfStale", "p", "r", Some(&ETag::any())).await.expect("wildcard delete");
}

/// Merge with a token never creates a row.
pub async fn conditional_merge_requires_row<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfCondMerge").await;
    let result = client.merge_entity("ConfCondMerge", row("p", "r", 1), Some(&ETag::any())).await;
    assert!(matches!(result, Err(StorageError::NotFound { .. })), "got {result:?}");
}

// ============================================================================
// Query
// ============================================================================

/// A partition query returns only that partition, in row-key order.
pub async fn query_is_partition_scoped_and_ordered<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfScope").await;
    for (pk, rk) in [("b", "2"), ("a", "9"), ("b", "1"), ("c", "1"), ("b", "3")] {
        client.upsert_entity("ConfScope", row(pk, rk, 0)).await.expect("upsert");
    }

    let page = client
        .query_entities("ConfScope", &EntityQuery::partition("b"), None)
        .await
        .expect("query");
    let keys: Vec<&str> = page.entities.iter().map(|e| e.row_key.as_str()).collect();
    assert_eq!(keys, ["1", "2", "3"]);
    assert!(page.continuation.is_none());
}

/// Following continuation tokens visits every row exactly once.
pub async fn query_pages_cover_partition<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfPaging").await;
    for i in 0..7 {
        client.upsert_entity("ConfPaging", row("p", &format!("r{i}"), i)).await.expect("upsert");
    }

    let query = EntityQuery::partition("p").page_size(3);
    let mut seen = Vec::new();
    let mut continuation = None;
    loop {
        let page = client
            .query_entities("ConfPaging", &query, continuation.as_ref())
            .await
            .expect("query page");
        assert!(page.entities.len() <= 3, "page larger than requested");
        seen.extend(page.entities.into_iter().map(|e| e.row_key));
        match page.continuation {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }
    let expected: Vec<String> = (0..7).map(|i| format!("r{i}")).collect();
    assert_eq!(seen, expected);
}

/// A projection returns only the selected properties, plus keys and
/// version.
pub async fn query_projection_limits_properties<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfSelect").await;
    let entity = row("p", "r", 1).with_property("Keep", PropertyValue::Bool(true));
    client.upsert_entity("ConfSelect", entity).await.expect("upsert");

    let query = EntityQuery::partition("p").select(["Keep", "Absent"]);
    let page = client.query_entities("ConfSelect", &query, None).await.expect("query");
    let entity = &page.entities[0];
    assert_eq!(entity.property("Keep"), Some(&PropertyValue::Bool(true)));
    assert_eq!(entity.property("N"), None);
    assert_eq!(entity.property("Absent"), None);
    assert!(entity.etag.is_some(), "projected rows keep their version");
}

// ============================================================================
// Batch
// ============================================================================

/// Batches that span partitions, repeat a row, are empty, or are too large
/// are rejected as `InvalidArgument` without applying anything.
pub async fn batch_shape_is_enforced<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfShape").await;
    let cases = [
        Vec::new(),
        vec![TableOperation::Upsert(row("a", "1", 0)), TableOperation::Upsert(row("b", "1", 0))],
        vec![TableOperation::Upsert(row("a", "1", 0)), TableOperation::Upsert(row("a", "1", 1))],
        (0..=MAX_BATCH_OPERATIONS)
            .map(|i| TableOperation::Upsert(row("a", &i.to_string(), 0)))
            .collect(),
    ];
    for operations in cases {
        let len = operations.len();
        let result = client.execute_batch("ConfShape", operations).await;
        assert!(
            matches!(result, Err(StorageError::InvalidArgument { .. })),
            "batch of {len} should be rejected, got {result:?}"
        );
    }
    let page =
        client.query_entities("ConfShape", &EntityQuery::all(), None).await.expect("query");
    assert!(page.entities.is_empty());
}

/// A failing operation aborts the whole batch and reports its position.
pub async fn batch_is_atomic<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfAtomic").await;
    client.upsert_entity("ConfAtomic", row("p", "existing", 0)).await.expect("upsert");

    let operations = vec![
        TableOperation::Upsert(row("p", "new", 1)),
        TableOperation::Insert(row("p", "existing", 2)),
    ];
    match client.execute_batch("ConfAtomic", operations).await {
        Err(StorageError::BatchOperation { index, source }) => {
            assert_eq!(index, 1);
            assert!(source.is_conflict(), "insert over an existing row conflicts: {source}");
        },
        other => panic!("expected BatchOperation, got {other:?}"),
    }
    let new = client.get_entity("ConfAtomic", "p", "new").await;
    assert!(matches!(new, Err(StorageError::NotFound { .. })), "batch must not partially apply");
}

/// A successful batch returns a token per write and `None` per delete.
pub async fn batch_reports_per_operation_results<C: TableClient + ?Sized>(client: &C) {
    fresh_table(client, "ConfResults").await;
    client.upsert_entity("ConfResults", row("p", "gone", 0)).await.expect("upsert");

    let operations = vec![
        TableOperation::Upsert(row("p", "a", 1)),
        TableOperation::Delete { address: RowAddress::new("p", "gone"), expected: None },
        TableOperation::Merge { entity: row("p", "b", 2), expected: None },
    ];
    let results = client.execute_batch("ConfResults", operations).await.expect("batch");
    assert_eq!(results.len(), 3);
    assert!(results[0].is_some());
    assert!(results[1].is_none());
    assert!(results[2].is_some());
}

// ============================================================================
// Concurrent
// ============================================================================

/// Version-checked merges racing on one row: exactly one wins.
pub async fn concurrent_conditional_merge_one_winner<C: TableClient + 'static>(client: Arc<C>) {
    fresh_table(client.as_ref(), "ConfRace").await;
    let etag = client.upsert_entity("ConfRace", row("p", "r", 0)).await.expect("upsert");

    let mut handles = Vec::new();
    for i in 1..=10 {
        let client = Arc::clone(&client);
        let etag = etag.clone();
        handles.push(tokio::spawn(async move {
            client.merge_entity("ConfRace", row("p", "r", i), Some(&etag)).await
        }));
    }

    let mut successes = 0u32;
    let mut conflicts = 0u32;
    for handle in handles {
        match handle.await.expect("task join") {
            Ok(_) => successes += 1,
            Err(StorageError::Conflict) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    assert_eq!(successes, 1, "exactly one writer should win");
    assert_eq!(conflicts, 9, "remaining writers should get Conflict");
}

// ============================================================================
// Convenience runner
// ============================================================================

/// Run the full conformance suite against `client`.
pub async fn run_all<C: TableClient + 'static>(client: Arc<C>) {
    let c = client.as_ref();

    table_creation_is_idempotent(c).await;
    table_deletion_drops_rows(c).await;

    point_read_missing_row_is_not_found(c).await;
    upsert_then_read_round_trips(c).await;
    upsert_replaces_all_properties(c).await;
    merge_keeps_untouched_properties(c).await;
    delete_missing_row_is_not_found(c).await;

    writes_change_the_version(c).await;
    stale_version_conflicts(c).await;
    conditional_merge_requires_row(c).await;

    query_is_partition_scoped_and_ordered(c).await;
    query_pages_cover_partition(c).await;
    query_projection_limits_properties(c).await;

    batch_shape_is_enforced(c).await;
    batch_is_atomic(c).await;
    batch_reports_per_operation_results(c).await;

    concurrent_conditional_merge_one_winner(Arc::clone(&client)).await;
}

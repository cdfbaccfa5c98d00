#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p table-dictionary --features failpoints --test failpoint_tests
//! ```

use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use table_dictionary::{
    DictionaryConfig, Entity, MemoryTableClient, RetryConfig, RetryingTableClient, TableBatchWriter,
    TableClient, TableDictionary, testutil::TEST_TABLE,
};

async fn populated<C: TableClient>(client: C, page_size: usize) -> TableDictionary<C, i32> {
    let config = DictionaryConfig::builder().page_size(page_size).build().unwrap();
    let dict = TableDictionary::with_config(client, TEST_TABLE, "faults", config).unwrap();
    dict.ensure_table().await.unwrap();
    for i in 0..6 {
        dict.add_or_update(&format!("k{i}"), &i, None).await.unwrap();
    }
    dict
}

#[tokio::test]
async fn batch_execute_failpoint_marks_group_failed() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("batch-before-execute", "return").expect("failed to configure fail point");

    let client = MemoryTableClient::new();
    client.create_table_if_not_exists(TEST_TABLE).await.unwrap();
    let mut writer = TableBatchWriter::new(client.clone(), TEST_TABLE, 100).unwrap();
    writer.upsert(Entity::new("p", "r"));
    let result = writer.flush().await;

    assert!(result.has_failures(), "flush should fail when the fail point is active");
    assert!(!client.contains_row(TEST_TABLE, "p", "r"));

    scenario.teardown();
}

#[tokio::test]
async fn batch_execute_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();

    let client = MemoryTableClient::new();
    client.create_table_if_not_exists(TEST_TABLE).await.unwrap();
    let mut writer = TableBatchWriter::new(client.clone(), TEST_TABLE, 100).unwrap();
    writer.upsert(Entity::new("p", "r"));
    let result = writer.flush().await;

    assert!(result.is_success(), "flush should succeed without a fail point");

    scenario.teardown();
}

#[tokio::test]
async fn query_failure_mid_scan_ends_the_stream() {
    let scenario = fail::FailScenario::setup();
    let dict = populated(MemoryTableClient::new(), 2).await;
    fail::cfg("table-query-page", "1*off->return").expect("failed to configure fail point");

    let items: Vec<_> = dict.keys().collect().await;

    assert_eq!(items.len(), 3, "two keys from the first page, then the error: {items:?}");
    assert_eq!(items[0].as_ref().unwrap(), "k0");
    assert_eq!(items[1].as_ref().unwrap(), "k1");
    assert!(items[2].as_ref().unwrap_err().is_transient());

    scenario.teardown();
}

#[tokio::test]
async fn retrying_client_recovers_scan() {
    let scenario = fail::FailScenario::setup();
    let retry = RetryConfig::builder()
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(5))
        .build()
        .unwrap();
    let client = RetryingTableClient::new(MemoryTableClient::new(), retry);
    let dict = populated(client, 2).await;
    fail::cfg("table-query-page", "1*return->off").expect("failed to configure fail point");

    let keys: Vec<String> = dict.keys().try_collect().await.expect("retry hides one failure");
    assert_eq!(keys, ["k0", "k1", "k2", "k3", "k4", "k5"]);

    scenario.teardown();
}

#[tokio::test]
async fn retries_exhausted_surface_the_error() {
    let scenario = fail::FailScenario::setup();
    let retry = RetryConfig::builder()
        .max_retries(2)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(2))
        .build()
        .unwrap();
    let client = RetryingTableClient::new(MemoryTableClient::new(), retry);
    let dict = populated(client, 10).await;
    fail::cfg("table-query-page", "return").expect("failed to configure fail point");

    let err = dict.count().await.expect_err("every attempt fails");
    assert!(err.is_transient(), "{err}");

    scenario.teardown();
}

#[tokio::test]
async fn failed_commit_leaves_no_rows() {
    let scenario = fail::FailScenario::setup();
    let dict = populated(MemoryTableClient::new(), 10).await;
    fail::cfg("table-batch-before-commit", "return").expect("failed to configure fail point");

    let values = [10, 11, 12];
    let result = dict
        .add_or_update_many(values.iter().map(|v| (format!("new{v}"), v)), None)
        .await
        .expect("validation passes");

    assert_eq!(result.failed_count(), 3);
    assert!(result.into_result().is_err());
    assert!(!dict.client().contains_row(TEST_TABLE, "faults", "new10"));

    scenario.teardown();
}

#[tokio::test]
async fn bulk_remove_falls_back_to_single_deletes() {
    let scenario = fail::FailScenario::setup();
    let dict = populated(MemoryTableClient::new(), 10).await;
    fail::cfg("table-batch-before-commit", "return").expect("failed to configure fail point");

    let removed = dict.remove_many(["k0", "k1", "missing"]).await.expect("fallback deletes");

    assert_eq!(removed, 2);
    assert_eq!(dict.client().row_count(TEST_TABLE), 4);

    scenario.teardown();
}

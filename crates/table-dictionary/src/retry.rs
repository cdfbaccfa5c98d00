//! Retry layer for transient row-store failures.
//!
//! [`RetryingTableClient`] wraps any [`TableClient`] and re-issues calls that
//! fail with a transient error ([`StorageError::is_transient`]). Everything
//! else, including `Conflict` and `NotFound`, is returned on the first
//! attempt.
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0–50% of the computed delay is added
//! - A `Throttled { retry_after: Some(d) }` hint from the store replaces the computed delay
//!
//! The policy is an explicit [`RetryConfig`] handed to
//! [`RetryingTableClient::new`]; there is no process-wide default.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use fail::fail_point;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    ConfigError, StorageError, StorageResult,
    client::TableClient,
    entity::{ContinuationToken, ETag, Entity, EntityQuery, QueryPage, TableOperation},
};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Retry policy for [`RetryingTableClient`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use table_dictionary::RetryConfig;
///
/// let config = RetryConfig::builder()
///     .max_retries(5)
///     .initial_backoff(Duration::from_millis(50))
///     .build()
///     .unwrap();
/// assert_eq!(config.max_retries(), 5);
///
/// let parsed: RetryConfig =
///     serde_json::from_str(r#"{"max_retries": 2, "initial_backoff": "250ms"}"#).unwrap();
/// assert_eq!(parsed.initial_backoff(), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    #[serde(default = "default_max_retries")]
    max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    initial_backoff: Duration,

    /// Upper bound on the computed delay, before jitter.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

#[bon::bon]
impl RetryConfig {
    /// Creates a validated retry policy.
    ///
    /// # Optional Fields
    ///
    /// * `max_retries` - retries after the first attempt (default: 3).
    /// * `initial_backoff` - first retry delay (default: 100ms).
    /// * `max_backoff` - delay cap (default: 5s).
    ///
    /// # Errors
    ///
    /// - [`ConfigError::BelowMinimum`] if `initial_backoff` is zero.
    /// - [`ConfigError::Inconsistent`] if `max_backoff < initial_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_retries, initial_backoff, max_backoff };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks the policy, e.g. after deserialization.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "initial_backoff",
                min: "1ms".into(),
                value: "0s".into(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::Inconsistent {
                field: "max_backoff",
                reason: format!(
                    "{:?} is shorter than initial_backoff {:?}",
                    self.max_backoff, self.initial_backoff
                ),
            });
        }
        Ok(())
    }

    /// Returns the retry count.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the first retry delay.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the delay cap.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Executes `operation` with automatic retry on transient errors.
///
/// Returns the first success, the first non-transient error, or the last
/// transient error once retries are exhausted.
#[tracing::instrument(skip(config, operation), fields(max_retries = config.max_retries))]
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                let delay = match &err {
                    StorageError::Throttled { retry_after: Some(hint) } => *hint,
                    _ => compute_backoff(config, attempt),
                };
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient error, retrying after backoff",
                );
                fail_point!("retry-before-sleep");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => {
                if attempt > 0 && err.is_transient() {
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %err,
                        "retries exhausted",
                    );
                }
                return Err(err);
            },
        }
    }
}

/// Computes the backoff for the given attempt number:
/// `min(initial_backoff * 2^attempt, max_backoff) + random(0..50% of delay)`.
fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    let jitter_range = u64::try_from(capped.as_millis() / 2).unwrap_or(u64::MAX);
    if jitter_range > 0 {
        let jitter = rand::rng().random_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}

/// A [`TableClient`] decorator that retries transient failures.
///
/// Every operation is retried as a whole. Batches are safe to retry because
/// the store applies them atomically; single-row writes are idempotent
/// except `Insert`, whose retry after a lost response may report `Conflict`.
///
/// Deletes have the same gap: when the store applies a delete but the
/// response is lost, the retry finds no row and reports `NotFound` (or
/// `Conflict` for a version-checked delete). The row is gone either way,
/// so [`TableDictionary::remove`](crate::TableDictionary::remove) may then
/// return `false` for a row it did delete.
#[derive(Debug, Clone)]
pub struct RetryingTableClient<C> {
    inner: C,
    config: RetryConfig,
}

impl<C> RetryingTableClient<C> {
    /// Wraps `inner` with the given policy.
    #[must_use]
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Returns the wrapped client.
    #[must_use]
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Unwraps the decorator.
    #[must_use]
    pub fn into_inner(self) -> C {
        self.inner
    }
}

#[async_trait]
impl<C: TableClient> TableClient for RetryingTableClient<C> {
    async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool> {
        with_retry(&self.config, "create_table_if_not_exists", || {
            self.inner.create_table_if_not_exists(table)
        })
        .await
    }

    async fn delete_table(&self, table: &str) -> StorageResult<()> {
        with_retry(&self.config, "delete_table", || self.inner.delete_table(table)).await
    }

    async fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Entity> {
        with_retry(&self.config, "get_entity", || {
            self.inner.get_entity(table, partition_key, row_key)
        })
        .await
    }

    async fn upsert_entity(&self, table: &str, entity: Entity) -> StorageResult<ETag> {
        with_retry(&self.config, "upsert_entity", || {
            self.inner.upsert_entity(table, entity.clone())
        })
        .await
    }

    async fn merge_entity(
        &self,
        table: &str,
        entity: Entity,
        expected: Option<&ETag>,
    ) -> StorageResult<ETag> {
        with_retry(&self.config, "merge_entity", || {
            self.inner.merge_entity(table, entity.clone(), expected)
        })
        .await
    }

    async fn delete_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected: Option<&ETag>,
    ) -> StorageResult<()> {
        with_retry(&self.config, "delete_entity", || {
            self.inner.delete_entity(table, partition_key, row_key, expected)
        })
        .await
    }

    async fn query_entities(
        &self,
        table: &str,
        query: &EntityQuery,
        continuation: Option<&ContinuationToken>,
    ) -> StorageResult<QueryPage> {
        with_retry(&self.config, "query_entities", || {
            self.inner.query_entities(table, query, continuation)
        })
        .await
    }

    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> StorageResult<Vec<Option<ETag>>> {
        with_retry(&self.config, "execute_batch", || {
            self.inner.execute_batch(table, operations.clone())
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{MemoryTableClient, TableDictionary};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(max_retries)
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[test]
    fn compute_backoff_exponential() {
        let config = RetryConfig::builder()
            .max_retries(5)
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(10))
            .build()
            .unwrap();

        let d0 = compute_backoff(&config, 0);
        assert!(d0 >= Duration::from_millis(100));
        assert!(d0 <= Duration::from_millis(150));

        let d2 = compute_backoff(&config, 2);
        assert!(d2 >= Duration::from_millis(400));
        assert!(d2 <= Duration::from_millis(600));
    }

    #[test]
    fn compute_backoff_capped_at_max() {
        let config = RetryConfig::builder()
            .initial_backoff(Duration::from_secs(1))
            .max_backoff(Duration::from_secs(5))
            .build()
            .unwrap();

        let d = compute_backoff(&config, 40);
        assert!(d >= Duration::from_secs(5));
        assert!(d <= Duration::from_millis(7500));
    }

    #[test]
    fn config_validation() {
        let err = RetryConfig::builder().initial_backoff(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "initial_backoff", .. }));

        let err = RetryConfig::builder()
            .initial_backoff(Duration::from_secs(2))
            .max_backoff(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent { field: "max_backoff", .. }));
    }

    #[test]
    fn config_deserializes_humantime() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"initial_backoff": "10ms", "max_backoff": "2s"}"#).unwrap();
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.initial_backoff(), Duration::from_millis(10));
        assert_eq!(config.max_backoff(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_config(3), "op", || {
            let attempt = calls.fetch_add(1, Ordering::Relaxed);
            async move { if attempt < 2 { Err(StorageError::unavailable("down")) } else { Ok(7) } }
        })
        .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn non_transient_not_retried() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = with_retry(&fast_config(3), "op", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::conflict()) }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Conflict)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = with_retry(&fast_config(2), "op", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::timeout()) }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Timeout)));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn zero_retries_disables_retry() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = with_retry(&fast_config(0), "op", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::unavailable("down")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    /// Applies deletes, then loses the first response.
    #[derive(Debug)]
    struct LostDeleteResponse {
        inner: MemoryTableClient,
        lost: AtomicU32,
    }

    #[async_trait]
    impl TableClient for LostDeleteResponse {
        async fn create_table_if_not_exists(&self, table: &str) -> StorageResult<bool> {
            self.inner.create_table_if_not_exists(table).await
        }

        async fn delete_table(&self, table: &str) -> StorageResult<()> {
            self.inner.delete_table(table).await
        }

        async fn get_entity(&self, table: &str, pk: &str, rk: &str) -> StorageResult<Entity> {
            self.inner.get_entity(table, pk, rk).await
        }

        async fn upsert_entity(&self, table: &str, entity: Entity) -> StorageResult<ETag> {
            self.inner.upsert_entity(table, entity).await
        }

        async fn merge_entity(
            &self,
            table: &str,
            entity: Entity,
            expected: Option<&ETag>,
        ) -> StorageResult<ETag> {
            self.inner.merge_entity(table, entity, expected).await
        }

        async fn delete_entity(
            &self,
            table: &str,
            pk: &str,
            rk: &str,
            expected: Option<&ETag>,
        ) -> StorageResult<()> {
            self.inner.delete_entity(table, pk, rk, expected).await?;
            if self.lost.fetch_add(1, Ordering::Relaxed) == 0 {
                return Err(StorageError::unavailable("response lost"));
            }
            Ok(())
        }

        async fn query_entities(
            &self,
            table: &str,
            query: &EntityQuery,
            continuation: Option<&ContinuationToken>,
        ) -> StorageResult<QueryPage> {
            self.inner.query_entities(table, query, continuation).await
        }

        async fn execute_batch(
            &self,
            table: &str,
            operations: Vec<TableOperation>,
        ) -> StorageResult<Vec<Option<ETag>>> {
            self.inner.execute_batch(table, operations).await
        }
    }

    #[tokio::test]
    async fn retried_delete_after_lost_response_reports_missing_row() {
        let inner = MemoryTableClient::new();
        inner.create_table_if_not_exists("Items").await.unwrap();
        inner.upsert_entity("Items", Entity::new("p", "r")).await.unwrap();
        let client = RetryingTableClient::new(
            LostDeleteResponse { inner: inner.clone(), lost: AtomicU32::new(0) },
            fast_config(2),
        );

        let err = client.delete_entity("Items", "p", "r", None).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!inner.contains_row("Items", "p", "r"), "the first attempt deleted the row");

        let dict: TableDictionary<_, String> =
            TableDictionary::new(client, "Items", "p").unwrap();
        dict.client().inner().inner.upsert_entity("Items", Entity::new("p", "k")).await.unwrap();
        dict.client().inner().lost.store(0, Ordering::Relaxed);
        assert!(!dict.remove("k").await.unwrap(), "deleted row reported as absent");
        assert!(!inner.contains_row("Items", "p", "k"));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_hint_replaces_backoff() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result = with_retry(&fast_config(1), "op", || {
            let attempt = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt == 0 {
                    Err(StorageError::throttled(Some(Duration::from_secs(30))))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}

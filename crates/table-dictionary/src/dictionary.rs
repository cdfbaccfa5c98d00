//! The expiring dictionary over a row-store table.
//!
//! A [`TableDictionary`] is a view over the rows of one table that share a
//! partition key (the dictionary name). Each entry is one row: the key is
//! the row key, the value is spread over the row's properties by the
//! [`codec`](crate::codec), and an optional `ExpiresAt` timestamp carries
//! the entry's time-to-live.
//!
//! Expiry is lazy. Expired rows stay in the table until removed or reaped
//! by [`purge_expired`](TableDictionary::purge_expired), but every lookup,
//! enumeration and count treats them as absent.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use futures::TryStreamExt;
//! use table_dictionary::{MemoryTableClient, TableDictionary};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let client = MemoryTableClient::new();
//! let sessions: TableDictionary<_, String> =
//!     TableDictionary::new(client, "Dictionaries", "sessions").unwrap();
//! sessions.ensure_table().await.unwrap();
//!
//! sessions.add_or_update("alice", &"token-a".to_owned(), None).await.unwrap();
//! sessions.add_or_update("bob", &"token-b".to_owned(), Some(Duration::from_secs(60))).await.unwrap();
//!
//! assert_eq!(sessions.get("alice").await.unwrap(), "token-a");
//! let keys: Vec<String> = sessions.keys().try_collect().await.unwrap();
//! assert_eq!(keys, ["alice", "bob"]);
//! # });
//! ```
//!
//! # Concurrency
//!
//! [`add_or_update`](TableDictionary::add_or_update) is last-writer-wins:
//! concurrent writers to the same key do not see each other. Callers that
//! need compare-and-swap should use [`TableClient::merge_entity`] and
//! [`TableClient::delete_entity`] with version tokens directly.

use std::{borrow::Cow, fmt, future, marker::PhantomData, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, TryStreamExt, stream};
use tracing::{debug, trace};

use crate::{
    StorageError, StorageResult,
    batch::{BatchResult, TableBatchWriter},
    client::TableClient,
    clock::{Clock, SystemClock},
    codec::{EntityValue, decode_value, encode_value},
    config::{DictionaryConfig, KeyCase},
    entity::{
        ContinuationToken, ETag, Entity, EntityQuery, PropertyKind, PropertyValue, RowAddress,
    },
    validation::{
        RESERVED_PROPERTY_NAMES, check_reserved_names, validate_dictionary_name, validate_key,
        validate_properties, validate_table_name,
    },
};

/// Name of the reserved property holding an entry's expiry instant.
pub const EXPIRES_AT_PROPERTY: &str = "ExpiresAt";

/// A key → `V` dictionary with optional per-entry expiry, stored as the
/// rows of one partition of a row-store table.
///
/// Construction validates the table name, the dictionary name and the
/// configuration; no network call is made until the first operation (see
/// [`ensure_table`](Self::ensure_table)).
pub struct TableDictionary<C, V> {
    client: C,
    table: Arc<str>,
    name: Arc<str>,
    config: DictionaryConfig,
    clock: Arc<dyn Clock>,
    _value: PhantomData<fn() -> V>,
}

impl<C: Clone, V> Clone for TableDictionary<C, V> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            table: Arc::clone(&self.table),
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            _value: PhantomData,
        }
    }
}

impl<C, V> fmt::Debug for TableDictionary<C, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDictionary")
            .field("table", &self.table)
            .field("name", &self.name)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Stops a stream after the first error it yields.
fn stop_after_error<S, T>(stream: S) -> impl Stream<Item = StorageResult<T>>
where
    S: Stream<Item = StorageResult<T>>,
{
    stream.scan(false, |failed, item| {
        if *failed {
            return future::ready(None);
        }
        *failed = item.is_err();
        future::ready(Some(item))
    })
}

impl<C: TableClient, V: EntityValue> TableDictionary<C, V> {
    /// Creates a dictionary with the default configuration.
    ///
    /// # Errors
    ///
    /// [`StorageError::Validation`] if `table` or `name` is malformed.
    pub fn new(
        client: C,
        table: impl Into<String>,
        name: impl Into<String>,
    ) -> StorageResult<Self> {
        Self::with_config(client, table, name, DictionaryConfig::default())
    }

    /// Creates a dictionary with an explicit configuration.
    ///
    /// # Errors
    ///
    /// [`StorageError::Validation`] if `table` or `name` is malformed,
    /// [`StorageError::Config`] if `config` is out of range.
    pub fn with_config(
        client: C,
        table: impl Into<String>,
        name: impl Into<String>,
        config: DictionaryConfig,
    ) -> StorageResult<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        let name = name.into();
        validate_dictionary_name(&name)?;
        config.validate()?;

        Ok(Self {
            client,
            table: table.into(),
            name: name.into(),
            config,
            clock: Arc::new(SystemClock),
            _value: PhantomData,
        })
    }

    /// Replaces the time source used for expiry.
    #[must_use]
    pub fn with_clock<K: Clock + 'static>(mut self, clock: K) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Creates the backing table if it does not exist.
    ///
    /// Returns `true` if this call created it.
    pub async fn ensure_table(&self) -> StorageResult<bool> {
        self.client.create_table_if_not_exists(&self.table).await
    }

    /// The dictionary name (the partition key of every entry).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing table.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The key comparison mode.
    #[must_use]
    pub fn key_case(&self) -> KeyCase {
        self.config.key_case()
    }

    /// The configuration this dictionary was built with.
    #[must_use]
    pub fn config(&self) -> &DictionaryConfig {
        &self.config
    }

    /// The underlying row-store client.
    #[must_use]
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Always `false`: a dictionary is writable.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        false
    }

    /// Normalizes and validates `key` into a row key.
    fn row_key<'k>(&self, key: &'k str) -> StorageResult<Cow<'k, str>> {
        let row_key = self.config.key_case().normalize(key);
        validate_key(&row_key)?;
        Ok(row_key)
    }

    fn expires_at(&self, ttl: Duration) -> StorageResult<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.clock.now().checked_add_signed(ttl))
            .ok_or_else(|| StorageError::validation("ttl", format!("{ttl:?} is out of range")))
    }

    /// Encodes `value` into a validated row.
    fn to_entity(&self, row_key: &str, value: &V, ttl: Option<Duration>) -> StorageResult<Entity> {
        let mut properties = encode_value(value)?;
        check_reserved_names(&properties)?;
        if let Some(ttl) = ttl {
            properties
                .insert(EXPIRES_AT_PROPERTY.to_owned(), PropertyValue::Timestamp(self.expires_at(ttl)?));
        }
        validate_properties(&properties, self.config.property_limits())?;
        Ok(Entity::new(&*self.name, row_key).with_properties(properties))
    }

    fn from_entity(mut entity: Entity) -> StorageResult<V> {
        for name in RESERVED_PROPERTY_NAMES {
            entity.properties.remove(*name);
        }
        decode_value(&entity.properties)
    }

    fn is_expired(entity: &Entity, now: DateTime<Utc>) -> StorageResult<bool> {
        match entity.property(EXPIRES_AT_PROPERTY) {
            None => Ok(false),
            Some(PropertyValue::Timestamp(expires_at)) => Ok(*expires_at < now),
            Some(other) => Err(StorageError::type_mismatch(
                EXPIRES_AT_PROPERTY,
                PropertyKind::Timestamp,
                other.kind(),
            )),
        }
    }

    /// Keeps `entity` only if it has not expired.
    fn live(&self, entity: Entity) -> StorageResult<Option<Entity>> {
        if Self::is_expired(&entity, self.clock.now())? {
            trace!(row_key = %entity.row_key, "skipping expired entry");
            Ok(None)
        } else {
            Ok(Some(entity))
        }
    }

    async fn fetch_live(&self, row_key: &str) -> StorageResult<Option<Entity>> {
        match self.client.get_entity(&self.table, &self.name, row_key).await {
            Ok(entity) => self.live(entity),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every row of the partition, page by page, expired ones included.
    fn scan_rows(&self, query: EntityQuery) -> impl Stream<Item = StorageResult<Entity>> + '_ {
        let query = query.page_size(self.config.page_size());
        // `Some(None)` is the first page, `None` means the last page was read.
        let pages = stream::try_unfold(Some(None::<ContinuationToken>), move |state| {
            let query = query.clone();
            async move {
                let Some(continuation) = state else {
                    return Ok::<_, StorageError>(None);
                };
                let page =
                    self.client.query_entities(&self.table, &query, continuation.as_ref()).await?;
                trace!(rows = page.entities.len(), "dictionary page read");
                Ok(Some((page.entities, page.continuation.map(Some))))
            }
        });
        pages.map_ok(|entities| stream::iter(entities.into_iter().map(Ok))).try_flatten()
    }

    /// Live rows of the partition.
    fn scan_live(&self, query: EntityQuery) -> impl Stream<Item = StorageResult<Entity>> + '_ {
        self.scan_rows(query).try_filter_map(move |entity| future::ready(self.live(entity)))
    }

    fn partition_query(&self) -> EntityQuery {
        EntityQuery::partition(&*self.name)
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if the key is absent or expired.
    #[tracing::instrument(skip(self), fields(table = %self.table, dictionary = %self.name))]
    pub async fn get(&self, key: &str) -> StorageResult<V> {
        match self.try_get(key).await? {
            Some(value) => Ok(value),
            None => Err(StorageError::not_found(key)),
        }
    }

    /// Returns the value stored under `key`, or `None` if absent or
    /// expired. Never fails with `NotFound`.
    #[tracing::instrument(skip(self), fields(table = %self.table, dictionary = %self.name))]
    pub async fn try_get(&self, key: &str) -> StorageResult<Option<V>> {
        let row_key = self.row_key(key)?;
        self.fetch_live(&row_key).await?.map(Self::from_entity).transpose()
    }

    /// Returns `true` if `key` holds a live entry.
    #[tracing::instrument(skip(self), fields(table = %self.table, dictionary = %self.name))]
    pub async fn contains_key(&self, key: &str) -> StorageResult<bool> {
        let row_key = self.row_key(key)?;
        Ok(self.fetch_live(&row_key).await?.is_some())
    }

    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// With a `ttl` the entry expires at `now + ttl`; without one any
    /// previous expiry is cleared. The value is fully encoded and validated
    /// before the single write is issued.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Validation`] / [`StorageError::SizeLimitExceeded`] for bad keys, oversized
    ///   values, or values using a reserved property name.
    /// - [`StorageError::UnsupportedShape`] if `value` cannot be encoded.
    #[tracing::instrument(skip(self, value), fields(table = %self.table, dictionary = %self.name))]
    pub async fn add_or_update(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let row_key = self.row_key(key)?;
        let entity = self.to_entity(&row_key, value, ttl)?;
        self.client.upsert_entity(&self.table, entity).await?;
        Ok(())
    }

    /// Deletes `key`.
    ///
    /// Returns `true` if a row (live or expired) was deleted and `false` if
    /// there was nothing to delete.
    #[tracing::instrument(skip(self), fields(table = %self.table, dictionary = %self.name))]
    pub async fn remove(&self, key: &str) -> StorageResult<bool> {
        let row_key = self.row_key(key)?;
        match self.client.delete_entity(&self.table, &self.name, &row_key, None).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Streams the live keys in row-key order.
    ///
    /// Pages are fetched on demand and only the expiry column is requested.
    /// A store error is yielded once and ends the stream. Each call starts
    /// a fresh scan.
    pub fn keys(&self) -> impl Stream<Item = StorageResult<String>> + '_ {
        let query = self.partition_query().select([EXPIRES_AT_PROPERTY]);
        stop_after_error(self.scan_live(query).map_ok(|entity| entity.row_key))
    }

    /// Streams the live values in row-key order.
    pub fn values(&self) -> impl Stream<Item = StorageResult<V>> + '_ {
        stop_after_error(
            self.scan_live(self.partition_query())
                .and_then(|entity| future::ready(Self::from_entity(entity))),
        )
    }

    /// Streams the live `(key, value)` pairs in row-key order.
    pub fn entries(&self) -> impl Stream<Item = StorageResult<(String, V)>> + '_ {
        stop_after_error(self.scan_live(self.partition_query()).and_then(|entity| {
            let key = entity.row_key.clone();
            future::ready(Self::from_entity(entity).map(|value| (key, value)))
        }))
    }

    /// Counts the live entries.
    ///
    /// Linear in the number of rows in the partition, expired ones
    /// included.
    #[tracing::instrument(skip(self), fields(table = %self.table, dictionary = %self.name))]
    pub async fn count(&self) -> StorageResult<usize> {
        self.keys().try_fold(0usize, |count, _| future::ready(Ok(count + 1))).await
    }

    /// Stores many entries, grouped into atomic batches.
    ///
    /// Every item is encoded and validated before anything is written; a
    /// bad item fails the whole call. Later items for a repeated key win.
    ///
    /// # Errors
    ///
    /// Same as [`add_or_update`](Self::add_or_update) for validation and
    /// encoding. Store failures are reported per item in the returned
    /// [`BatchResult`].
    #[tracing::instrument(skip(self, items), fields(table = %self.table, dictionary = %self.name))]
    pub async fn add_or_update_many<'v, I, K>(
        &self,
        items: I,
        ttl: Option<Duration>,
    ) -> StorageResult<BatchResult>
    where
        I: IntoIterator<Item = (K, &'v V)>,
        K: AsRef<str>,
        V: 'v,
    {
        let mut writer =
            TableBatchWriter::new(&self.client, &*self.table, self.config.max_batch_size())?;
        for (key, value) in items {
            let row_key = self.row_key(key.as_ref())?;
            writer.upsert(self.to_entity(&row_key, value, ttl)?);
        }
        Ok(writer.flush().await)
    }

    /// Deletes many keys. Returns how many rows were actually deleted.
    ///
    /// # Errors
    ///
    /// Validation errors for malformed keys, or the first store error that
    /// is not a missing row.
    #[tracing::instrument(skip(self, keys), fields(table = %self.table, dictionary = %self.name))]
    pub async fn remove_many<I, K>(&self, keys: I) -> StorageResult<usize>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let targets = keys
            .into_iter()
            .map(|key| Ok((self.row_key(key.as_ref())?.into_owned(), None)))
            .collect::<StorageResult<Vec<_>>>()?;
        self.delete_rows(targets).await
    }

    /// Physically deletes expired rows. Returns how many were reaped.
    ///
    /// Each delete is conditioned on the version observed during the scan,
    /// so an entry refreshed concurrently is left alone.
    #[tracing::instrument(skip(self), fields(table = %self.table, dictionary = %self.name))]
    pub async fn purge_expired(&self) -> StorageResult<usize> {
        let now = self.clock.now();
        let query = self.partition_query().select([EXPIRES_AT_PROPERTY]);
        let rows: Vec<Entity> = self.scan_rows(query).try_collect().await?;

        let mut targets = Vec::new();
        for entity in rows {
            if Self::is_expired(&entity, now)? {
                targets.push((entity.row_key, entity.etag));
            }
        }
        let reaped = self.delete_rows(targets).await?;
        debug!(reaped, "expired entries purged");
        Ok(reaped)
    }

    /// Deletes every row of the dictionary, expired or not. Returns how
    /// many were deleted.
    #[tracing::instrument(skip(self), fields(table = %self.table, dictionary = %self.name))]
    pub async fn clear(&self) -> StorageResult<usize> {
        let query = self.partition_query().select([EXPIRES_AT_PROPERTY]);
        let targets = self
            .scan_rows(query)
            .map_ok(|entity| (entity.row_key, None))
            .try_collect::<Vec<_>>()
            .await?;
        let removed = self.delete_rows(targets).await?;
        debug!(removed, "dictionary cleared");
        Ok(removed)
    }

    /// Deletes rows in batches, falling back to single deletes for rows in
    /// a failed batch. Rows that are already gone or were changed since
    /// `expected` was read are skipped.
    async fn delete_rows(&self, targets: Vec<(String, Option<ETag>)>) -> StorageResult<usize> {
        if targets.is_empty() {
            return Ok(0);
        }

        let mut writer =
            TableBatchWriter::new(&self.client, &*self.table, self.config.max_batch_size())?;
        for (row_key, expected) in &targets {
            writer.delete(RowAddress::new(&*self.name, row_key), expected.clone());
        }
        let result = writer.flush().await;

        let mut removed = 0;
        for ((row_key, expected), outcome) in targets.iter().zip(result.results()) {
            if outcome.is_ok() {
                removed += 1;
                continue;
            }
            match self.client.delete_entity(&self.table, &self.name, row_key, expected.as_ref()).await
            {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    trace!(row_key = %row_key, "row changed or already gone, skipped");
                },
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{ManualClock, MemoryTableClient, impl_entity_value};

    const TABLE: &str = "Dictionaries";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    async fn dictionary<V: EntityValue>(
        config: DictionaryConfig,
    ) -> (TableDictionary<MemoryTableClient, V>, MemoryTableClient, ManualClock) {
        let client = MemoryTableClient::new();
        let clock = ManualClock::new(start());
        let dict = TableDictionary::with_config(client.clone(), TABLE, "dict1", config)
            .unwrap()
            .with_clock(clock.clone());
        dict.ensure_table().await.unwrap();
        (dict, client, clock)
    }

    #[test]
    fn construction_validates_names() {
        let client = MemoryTableClient::new();
        assert!(TableDictionary::<_, String>::new(client.clone(), "x", "dict").is_err());
        assert!(TableDictionary::<_, String>::new(client.clone(), TABLE, "a/b").is_err());
        assert!(TableDictionary::<_, String>::new(client, TABLE, "").is_err());
    }

    #[tokio::test]
    async fn round_trip_and_overwrite() {
        let (dict, _, _) = dictionary::<String>(DictionaryConfig::default()).await;
        dict.add_or_update("key1", &"a".to_owned(), None).await.unwrap();
        assert_eq!(dict.get("key1").await.unwrap(), "a");

        dict.add_or_update("key1", &"b".to_owned(), None).await.unwrap();
        assert_eq!(dict.get("key1").await.unwrap(), "b");
        assert_eq!(dict.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_key_semantics() {
        let (dict, _, _) = dictionary::<i32>(DictionaryConfig::default()).await;
        assert!(dict.get("nope").await.unwrap_err().is_not_found());
        assert_eq!(dict.try_get("nope").await.unwrap(), None);
        assert!(!dict.contains_key("nope").await.unwrap());
        assert!(!dict.remove("nope").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expires_lazily() {
        let (dict, client, clock) = dictionary::<String>(DictionaryConfig::default()).await;
        dict.add_or_update("k", &"v".to_owned(), Some(Duration::from_secs(1))).await.unwrap();
        assert!(dict.contains_key("k").await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(dict.contains_key("k").await.unwrap(), "live at the expiry instant");

        clock.advance(Duration::from_millis(1));
        assert!(!dict.contains_key("k").await.unwrap());
        assert!(dict.get("k").await.unwrap_err().is_not_found());
        assert_eq!(dict.count().await.unwrap(), 0);
        assert!(client.contains_row(TABLE, "dict1", "k"), "expired rows stay until reaped");

        assert!(dict.remove("k").await.unwrap(), "remove reports the expired row");
    }

    #[tokio::test]
    async fn update_without_ttl_clears_expiry() {
        let (dict, _, clock) = dictionary::<String>(DictionaryConfig::default()).await;
        dict.add_or_update("k", &"v1".to_owned(), Some(Duration::from_secs(5))).await.unwrap();
        dict.add_or_update("k", &"v2".to_owned(), None).await.unwrap();
        clock.advance(Duration::from_secs(60));
        assert_eq!(dict.get("k").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn insensitive_keys_fold_to_lowercase() {
        let config = DictionaryConfig::builder().key_case(KeyCase::Insensitive).build().unwrap();
        let (dict, client, _) = dictionary::<i32>(config).await;
        dict.add_or_update("MixedCase", &1, None).await.unwrap();

        assert_eq!(dict.get("mixedcase").await.unwrap(), 1);
        assert_eq!(dict.get("MIXEDCASE").await.unwrap(), 1);
        assert!(client.contains_row(TABLE, "dict1", "mixedcase"));

        let keys: Vec<String> = dict.keys().try_collect().await.unwrap();
        assert_eq!(keys, ["mixedcase"]);
    }

    #[tokio::test]
    async fn invalid_key_rejected_before_any_call() {
        let (dict, client, _) = dictionary::<i32>(DictionaryConfig::default()).await;
        let err = dict.add_or_update("a#b", &1, None).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(client.row_count(TABLE), 0);
    }

    #[derive(Debug, Default, PartialEq)]
    struct Sneaky {
        #[allow(non_snake_case)]
        ExpiresAt: String,
    }

    impl_entity_value!(Sneaky { ExpiresAt });

    #[tokio::test]
    async fn reserved_member_names_rejected() {
        let (dict, _, _) = dictionary::<Sneaky>(DictionaryConfig::default()).await;
        let err = dict.add_or_update("k", &Sneaky { ExpiresAt: "x".into() }, None).await;
        assert!(err.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn oversized_value_rejected() {
        let (dict, client, _) = dictionary::<String>(DictionaryConfig::default()).await;
        let big = "x".repeat(40_000);
        let err = dict.add_or_update("k", &big, None).await.unwrap_err();
        assert!(matches!(err, StorageError::SizeLimitExceeded { .. }), "{err}");
        assert_eq!(client.row_count(TABLE), 0);
    }

    #[tokio::test]
    async fn streams_page_through_partition() {
        let config = DictionaryConfig::builder().page_size(2).build().unwrap();
        let (dict, _, _) = dictionary::<i32>(config).await;
        for i in 0..5 {
            dict.add_or_update(&format!("k{i}"), &i, None).await.unwrap();
        }

        let keys: Vec<String> = dict.keys().try_collect().await.unwrap();
        assert_eq!(keys, ["k0", "k1", "k2", "k3", "k4"]);
        let values: Vec<i32> = dict.values().try_collect().await.unwrap();
        assert_eq!(values, [0, 1, 2, 3, 4]);
        let entries: Vec<(String, i32)> = dict.entries().try_collect().await.unwrap();
        assert_eq!(entries[4], ("k4".to_owned(), 4));
    }

    #[tokio::test]
    async fn dictionaries_share_a_table_without_mixing() {
        let (dict1, client, _) = dictionary::<i32>(DictionaryConfig::default()).await;
        let dict2: TableDictionary<_, i32> =
            TableDictionary::new(client.clone(), TABLE, "dict2").unwrap();
        dict1.add_or_update("k", &1, None).await.unwrap();
        dict2.add_or_update("k", &2, None).await.unwrap();

        assert_eq!(dict1.get("k").await.unwrap(), 1);
        assert_eq!(dict2.get("k").await.unwrap(), 2);
        assert_eq!(dict1.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn corrupt_expiry_is_type_mismatch() {
        let (dict, client, _) = dictionary::<i32>(DictionaryConfig::default()).await;
        let entity = Entity::new("dict1", "k")
            .with_property(EXPIRES_AT_PROPERTY, PropertyValue::String("tomorrow".into()));
        client.upsert_entity(TABLE, entity).await.unwrap();

        let err = dict.get("k").await.unwrap_err();
        assert!(matches!(err, StorageError::TypeMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn bulk_add_and_remove() {
        let config = DictionaryConfig::builder().max_batch_size(3).build().unwrap();
        let (dict, client, _) = dictionary::<i32>(config).await;
        let values: Vec<(String, i32)> = (0..7).map(|i| (format!("k{i}"), i)).collect();

        let result = dict
            .add_or_update_many(values.iter().map(|(k, v)| (k.as_str(), v)), None)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.stats().batches_count, 3);
        assert_eq!(dict.count().await.unwrap(), 7);

        let removed = dict.remove_many(["k0", "k1", "missing"]).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(client.row_count(TABLE), 5);
    }

    #[tokio::test]
    async fn bulk_add_validates_everything_first() {
        let (dict, client, _) = dictionary::<i32>(DictionaryConfig::default()).await;
        let err = dict.add_or_update_many([("ok", &1), ("bad?", &2)], None).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(client.row_count(TABLE), 0);
    }

    #[tokio::test]
    async fn purge_reaps_only_expired_rows() {
        let (dict, client, clock) = dictionary::<i32>(DictionaryConfig::default()).await;
        dict.add_or_update("short", &1, Some(Duration::from_secs(1))).await.unwrap();
        dict.add_or_update("long", &2, Some(Duration::from_secs(100))).await.unwrap();
        dict.add_or_update("forever", &3, None).await.unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(dict.purge_expired().await.unwrap(), 1);
        assert!(!client.contains_row(TABLE, "dict1", "short"));
        assert_eq!(client.row_count(TABLE), 2);
        assert_eq!(dict.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let (dict, client, clock) = dictionary::<i32>(DictionaryConfig::default()).await;
        dict.add_or_update("a", &1, Some(Duration::from_secs(1))).await.unwrap();
        dict.add_or_update("b", &2, None).await.unwrap();
        clock.advance(Duration::from_secs(5));

        assert_eq!(dict.clear().await.unwrap(), 2);
        assert_eq!(client.row_count(TABLE), 0);
    }

    #[test]
    fn never_read_only() {
        let dict: TableDictionary<_, i32> =
            TableDictionary::new(MemoryTableClient::new(), TABLE, "d").unwrap();
        assert!(!dict.is_read_only());
        assert_eq!(dict.name(), "d");
        assert_eq!(dict.table(), TABLE);
        assert_eq!(dict.key_case(), KeyCase::Sensitive);
    }
}

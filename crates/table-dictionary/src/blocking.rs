//! Synchronous facade over [`TableDictionary`].
//!
//! For callers without an async runtime. Each call drives the async
//! operation to completion on a private current-thread runtime, so it must
//! not be used from inside another runtime's worker thread.

use std::{fmt, time::Duration};

use futures::{StreamExt, stream::LocalBoxStream};
use tokio::runtime::{Builder, Runtime};

use crate::{
    StorageError, StorageResult, batch::BatchResult, client::TableClient, codec::EntityValue,
    dictionary::TableDictionary,
};

/// A [`TableDictionary`] with blocking methods.
pub struct BlockingTableDictionary<C, V> {
    inner: TableDictionary<C, V>,
    runtime: Runtime,
}

impl<C, V> fmt::Debug for BlockingTableDictionary<C, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingTableDictionary").field("inner", &self.inner).finish_non_exhaustive()
    }
}

/// Blocking iterator over a dictionary stream. Each `next` fetches at most
/// one page.
pub struct BlockingStreamIter<'a, T> {
    runtime: &'a Runtime,
    stream: LocalBoxStream<'a, T>,
}

impl<T> Iterator for BlockingStreamIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.runtime.block_on(self.stream.next())
    }
}

impl<C: TableClient, V: EntityValue> BlockingTableDictionary<C, V> {
    /// Wraps `inner`, starting a private runtime.
    ///
    /// # Errors
    ///
    /// [`StorageError::Internal`] if the runtime cannot be started.
    pub fn new(inner: TableDictionary<C, V>) -> StorageResult<Self> {
        let runtime = Builder::new_current_thread().enable_all().build().map_err(|e| {
            StorageError::internal_with_source("failed to start dictionary runtime", e)
        })?;
        Ok(Self { inner, runtime })
    }

    /// The wrapped async dictionary.
    #[must_use]
    pub fn inner(&self) -> &TableDictionary<C, V> {
        &self.inner
    }

    /// Unwraps the async dictionary, shutting the runtime down.
    #[must_use]
    pub fn into_inner(self) -> TableDictionary<C, V> {
        self.inner
    }

    /// See [`TableDictionary::ensure_table`].
    pub fn ensure_table(&self) -> StorageResult<bool> {
        self.runtime.block_on(self.inner.ensure_table())
    }

    /// See [`TableDictionary::get`].
    pub fn get(&self, key: &str) -> StorageResult<V> {
        self.runtime.block_on(self.inner.get(key))
    }

    /// See [`TableDictionary::try_get`].
    pub fn try_get(&self, key: &str) -> StorageResult<Option<V>> {
        self.runtime.block_on(self.inner.try_get(key))
    }

    /// See [`TableDictionary::contains_key`].
    pub fn contains_key(&self, key: &str) -> StorageResult<bool> {
        self.runtime.block_on(self.inner.contains_key(key))
    }

    /// See [`TableDictionary::add_or_update`].
    pub fn add_or_update(&self, key: &str, value: &V, ttl: Option<Duration>) -> StorageResult<()> {
        self.runtime.block_on(self.inner.add_or_update(key, value, ttl))
    }

    /// See [`TableDictionary::remove`].
    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        self.runtime.block_on(self.inner.remove(key))
    }

    /// See [`TableDictionary::count`].
    pub fn count(&self) -> StorageResult<usize> {
        self.runtime.block_on(self.inner.count())
    }

    /// See [`TableDictionary::add_or_update_many`].
    pub fn add_or_update_many<'v, I, K>(
        &self,
        items: I,
        ttl: Option<Duration>,
    ) -> StorageResult<BatchResult>
    where
        I: IntoIterator<Item = (K, &'v V)>,
        K: AsRef<str>,
        V: 'v,
    {
        self.runtime.block_on(self.inner.add_or_update_many(items, ttl))
    }

    /// See [`TableDictionary::remove_many`].
    pub fn remove_many<I, K>(&self, keys: I) -> StorageResult<usize>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.runtime.block_on(self.inner.remove_many(keys))
    }

    /// See [`TableDictionary::purge_expired`].
    pub fn purge_expired(&self) -> StorageResult<usize> {
        self.runtime.block_on(self.inner.purge_expired())
    }

    /// See [`TableDictionary::clear`].
    pub fn clear(&self) -> StorageResult<usize> {
        self.runtime.block_on(self.inner.clear())
    }

    /// See [`TableDictionary::keys`].
    pub fn keys(&self) -> BlockingStreamIter<'_, StorageResult<String>> {
        BlockingStreamIter { runtime: &self.runtime, stream: self.inner.keys().boxed_local() }
    }

    /// See [`TableDictionary::values`].
    pub fn values(&self) -> BlockingStreamIter<'_, StorageResult<V>> {
        BlockingStreamIter { runtime: &self.runtime, stream: self.inner.values().boxed_local() }
    }

    /// See [`TableDictionary::entries`].
    pub fn entries(&self) -> BlockingStreamIter<'_, StorageResult<(String, V)>> {
        BlockingStreamIter { runtime: &self.runtime, stream: self.inner.entries().boxed_local() }
    }
}

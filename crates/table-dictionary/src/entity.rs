//! The row-store's entity model.
//!
//! An [`Entity`] is a property bag of typed leaf values addressed by a
//! partition key and a row key. The store manages the `Timestamp` and
//! `ETag` metadata; callers only ever supply properties and the address.

use std::{collections::BTreeMap, fmt};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered map of property name to value, as stored in one row.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// The primitive kinds a property can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// UTF-8 string.
    String,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit IEEE float.
    Double,
    /// Boolean.
    Bool,
    /// Opaque byte blob.
    Binary,
    /// UTC timestamp.
    Timestamp,
    /// 128-bit globally unique identifier.
    Guid,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "String",
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::Double => "Double",
            Self::Bool => "Bool",
            Self::Binary => "Binary",
            Self::Timestamp => "Timestamp",
            Self::Guid => "Guid",
        };
        f.write_str(name)
    }
}

/// A single typed property value.
///
/// The serde representation is externally tagged (`{"Int32": 5}`) so a
/// serialized bag round-trips without losing the distinction between, for
/// example, `Int32` and `Int64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// UTF-8 string.
    String(String),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit IEEE float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// Opaque byte blob.
    Binary(Bytes),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// Globally unique identifier.
    Guid(Uuid),
}

impl PropertyValue {
    /// Returns the kind of this value.
    #[must_use]
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::String(_) => PropertyKind::String,
            Self::Int32(_) => PropertyKind::Int32,
            Self::Int64(_) => PropertyKind::Int64,
            Self::Double(_) => PropertyKind::Double,
            Self::Bool(_) => PropertyKind::Bool,
            Self::Binary(_) => PropertyKind::Binary,
            Self::Timestamp(_) => PropertyKind::Timestamp,
            Self::Guid(_) => PropertyKind::Guid,
        }
    }
}

/// Opaque optimistic-concurrency token returned by the store.
///
/// [`ETag::any`] is the wildcard: it matches any existing row but still
/// requires the row to exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Wraps a store-issued token.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The wildcard token (`*`).
    #[must_use]
    pub fn any() -> Self {
        Self("*".to_owned())
    }

    /// Returns `true` if this is the wildcard token.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.0 == "*"
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The (partition key, row key) pair that addresses one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowAddress {
    /// Partition key.
    pub partition_key: String,
    /// Row key.
    pub row_key: String,
}

impl RowAddress {
    /// Creates a new address.
    #[must_use]
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self { partition_key: partition_key.into(), row_key: row_key.into() }
    }
}

impl fmt::Display for RowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.row_key)
    }
}

/// One row as read from or written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Partition key.
    pub partition_key: String,
    /// Row key.
    pub row_key: String,
    /// Last-modified time, set by the store on read.
    pub timestamp: Option<DateTime<Utc>>,
    /// Version token, set by the store on read.
    pub etag: Option<ETag>,
    /// User properties.
    pub properties: PropertyMap,
}

impl Entity {
    /// Creates an entity with no properties.
    #[must_use]
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            timestamp: None,
            etag: None,
            properties: PropertyMap::new(),
        }
    }

    /// Replaces the property bag.
    #[must_use]
    pub fn with_properties(mut self, properties: PropertyMap) -> Self {
        self.properties = properties;
        self
    }

    /// Sets a single property, returning `self` for chaining.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Returns a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Returns this entity's address.
    #[must_use]
    pub fn address(&self) -> RowAddress {
        RowAddress::new(self.partition_key.clone(), self.row_key.clone())
    }
}

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TableOperation {
    /// Insert a new row; fails with `Conflict` if it already exists.
    Insert(Entity),
    /// Insert or replace unconditionally.
    Upsert(Entity),
    /// Merge properties into a row. With `expected: None` this is
    /// insert-or-merge; otherwise the row must exist and match.
    Merge {
        /// The properties to merge.
        entity: Entity,
        /// Required version, or `None` for unconditional.
        expected: Option<ETag>,
    },
    /// Replace an existing row whose version matches `expected`.
    Replace {
        /// The replacement row.
        entity: Entity,
        /// Required version ([`ETag::any`] for any existing row).
        expected: ETag,
    },
    /// Delete a row.
    Delete {
        /// The row to delete.
        address: RowAddress,
        /// Required version, or `None` for unconditional.
        expected: Option<ETag>,
    },
}

impl TableOperation {
    /// Returns the partition key this operation targets.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        match self {
            Self::Insert(entity)
            | Self::Upsert(entity)
            | Self::Merge { entity, .. }
            | Self::Replace { entity, .. } => &entity.partition_key,
            Self::Delete { address, .. } => &address.partition_key,
        }
    }

    /// Returns the row key this operation targets.
    #[must_use]
    pub fn row_key(&self) -> &str {
        match self {
            Self::Insert(entity)
            | Self::Upsert(entity)
            | Self::Merge { entity, .. }
            | Self::Replace { entity, .. } => &entity.row_key,
            Self::Delete { address, .. } => &address.row_key,
        }
    }

    /// Short name of the operation, used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Upsert(_) => "upsert",
            Self::Merge { .. } => "merge",
            Self::Replace { .. } => "replace",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Opaque position from which a paged query resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    next_partition_key: String,
    next_row_key: String,
}

impl ContinuationToken {
    /// Creates a token pointing at the first row of the next page.
    #[must_use]
    pub fn new(next_partition_key: impl Into<String>, next_row_key: impl Into<String>) -> Self {
        Self { next_partition_key: next_partition_key.into(), next_row_key: next_row_key.into() }
    }

    /// Partition key of the first row of the next page.
    #[must_use]
    pub fn next_partition_key(&self) -> &str {
        &self.next_partition_key
    }

    /// Row key of the first row of the next page.
    #[must_use]
    pub fn next_row_key(&self) -> &str {
        &self.next_row_key
    }
}

/// A range query over one table.
///
/// Only the two filters the dictionary needs are expressible: an optional
/// exact partition key match, and a column projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityQuery {
    /// Restrict results to this partition. `None` enumerates the table.
    pub partition_key: Option<String>,
    /// Columns to return. `None` returns every property.
    pub select: Option<Vec<String>>,
    /// Maximum rows per page. `None` uses the store default.
    pub page_size: Option<usize>,
}

impl EntityQuery {
    /// Query every row in the table.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Query rows whose partition key equals `partition_key`.
    #[must_use]
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self { partition_key: Some(partition_key.into()), ..Self::default() }
    }

    /// Restrict the returned columns.
    #[must_use]
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Set the page size.
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    /// Rows in this page, in (partition key, row key) order.
    pub entities: Vec<Entity>,
    /// Where the next page starts, or `None` if this was the last page.
    pub continuation: Option<ContinuationToken>,
}

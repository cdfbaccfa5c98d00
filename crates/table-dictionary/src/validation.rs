//! Identifier and property validation.
//!
//! All checks here are pure and synchronous. They run before any batch
//! grouping or client call so malformed input fails fast and is never
//! retried.
//!
//! # Defaults
//!
//! | Limit | Default |
//! |-------|---------|
//! | identifier length | 1024 characters |
//! | string / binary property | 65 536 bytes |
//! | properties per row | 252 |
//! | property name length | 255 characters |

use serde::{Deserialize, Serialize};

use crate::{
    ConfigError, StorageError, StorageResult,
    entity::{PropertyMap, PropertyValue},
};

/// Maximum length of a partition or row key, in characters.
pub const MAX_IDENTIFIER_LENGTH: usize = 1024;

/// Default ceiling for one string or binary property, in bytes.
pub const DEFAULT_MAX_PROPERTY_BYTES: usize = 64 * 1024;

/// Default ceiling on user properties per row.
pub const DEFAULT_MAX_PROPERTY_COUNT: usize = 252;

/// Maximum length of a property name, in characters.
pub const MAX_PROPERTY_NAME_LENGTH: usize = 255;

/// Property names managed by the store or by the dictionary itself.
pub const RESERVED_PROPERTY_NAMES: &[&str] =
    &["PartitionKey", "RowKey", "Timestamp", "ETag", "ExpiresAt"];

/// Which identifier is being validated. Used to label errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    /// A dictionary name (stored as the partition key).
    DictionaryName,
    /// A dictionary key (stored as the row key).
    Key,
}

impl IdentifierKind {
    fn label(self) -> &'static str {
        match self {
            Self::DictionaryName => "dictionary name",
            Self::Key => "key",
        }
    }
}

fn is_forbidden(c: char) -> bool {
    matches!(c, '/' | '\\' | '#' | '?') || c.is_control()
}

/// Validates a partition or row key.
///
/// Rejects empty identifiers, identifiers longer than
/// [`MAX_IDENTIFIER_LENGTH`] characters, and identifiers containing
/// `/`, `\`, `#`, `?`, or any control character.
pub fn validate_identifier(kind: IdentifierKind, value: &str) -> StorageResult<()> {
    if value.is_empty() {
        return Err(StorageError::validation(kind.label(), "must not be empty"));
    }
    let length = value.chars().count();
    if length > MAX_IDENTIFIER_LENGTH {
        return Err(StorageError::size_limit_exceeded(kind.label(), length, MAX_IDENTIFIER_LENGTH));
    }
    if let Some(c) = value.chars().find(|c| is_forbidden(*c)) {
        return Err(StorageError::validation(
            kind.label(),
            format!("contains forbidden character U+{:04X}", u32::from(c)),
        ));
    }
    Ok(())
}

/// Validates a dictionary name.
pub fn validate_dictionary_name(name: &str) -> StorageResult<()> {
    validate_identifier(IdentifierKind::DictionaryName, name)
}

/// Validates a dictionary key.
pub fn validate_key(key: &str) -> StorageResult<()> {
    validate_identifier(IdentifierKind::Key, key)
}

/// Validates a table name: 3 to 63 ASCII alphanumerics, starting with a
/// letter.
pub fn validate_table_name(table: &str) -> StorageResult<()> {
    let length = table.len();
    if !(3..=63).contains(&length) {
        return Err(StorageError::validation(
            "table name",
            format!("length must be between 3 and 63, got {length}"),
        ));
    }
    if !table.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(StorageError::validation("table name", "must start with a letter"));
    }
    if !table.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StorageError::validation("table name", "must be alphanumeric"));
    }
    Ok(())
}

/// Per-row property ceilings.
///
/// Both limits must be at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PropertyLimits {
    max_property_bytes: usize,
    max_property_count: usize,
}

impl PropertyLimits {
    /// Creates limits with the given bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if either limit is zero.
    pub fn new(max_property_bytes: usize, max_property_count: usize) -> Result<Self, ConfigError> {
        let limits = Self { max_property_bytes, max_property_count };
        limits.validate()?;
        Ok(limits)
    }

    /// Re-checks the bounds, e.g. after deserialization.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if either limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_property_bytes == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_property_bytes",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.max_property_count == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_property_count",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Maximum bytes for one string or binary property.
    #[must_use]
    pub fn max_property_bytes(&self) -> usize {
        self.max_property_bytes
    }

    /// Maximum user properties per row.
    #[must_use]
    pub fn max_property_count(&self) -> usize {
        self.max_property_count
    }
}

impl Default for PropertyLimits {
    fn default() -> Self {
        Self {
            max_property_bytes: DEFAULT_MAX_PROPERTY_BYTES,
            max_property_count: DEFAULT_MAX_PROPERTY_COUNT,
        }
    }
}

/// Size of a property as the store accounts for it.
///
/// Strings are stored as UTF-16, two bytes per code unit.
fn stored_size(value: &PropertyValue) -> Option<usize> {
    match value {
        PropertyValue::String(s) => Some(s.encode_utf16().count() * 2),
        PropertyValue::Binary(b) => Some(b.len()),
        _ => None,
    }
}

/// Validates a property name.
pub fn validate_property_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::validation("property name", "must not be empty"));
    }
    let length = name.chars().count();
    if length > MAX_PROPERTY_NAME_LENGTH {
        return Err(StorageError::size_limit_exceeded(
            "property name",
            length,
            MAX_PROPERTY_NAME_LENGTH,
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(StorageError::validation(
            "property name",
            format!("'{}' contains a control character", name.escape_debug()),
        ));
    }
    Ok(())
}

/// Validates an encoded property bag against `limits`.
///
/// Reserved names are not checked here; see [`check_reserved_names`].
pub fn validate_properties(properties: &PropertyMap, limits: &PropertyLimits) -> StorageResult<()> {
    if properties.len() > limits.max_property_count {
        return Err(StorageError::size_limit_exceeded(
            "property count",
            properties.len(),
            limits.max_property_count,
        ));
    }
    for (name, value) in properties {
        validate_property_name(name)?;
        if let Some(size) = stored_size(value)
            && size > limits.max_property_bytes
        {
            return Err(StorageError::size_limit_exceeded(
                format!("property '{name}'"),
                size,
                limits.max_property_bytes,
            ));
        }
    }
    Ok(())
}

/// Rejects property bags that use a name from [`RESERVED_PROPERTY_NAMES`].
pub fn check_reserved_names(properties: &PropertyMap) -> StorageResult<()> {
    match RESERVED_PROPERTY_NAMES.iter().find(|name| properties.contains_key(**name)) {
        Some(name) => Err(StorageError::validation(
            "property name",
            format!("'{name}' is reserved"),
        )),
        None => Ok(()),
    }
}

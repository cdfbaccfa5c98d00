//! Dictionary configuration.
//!
//! [`DictionaryConfig`] can be built in code through its builder or loaded
//! from any serde format:
//!
//! ```
//! use table_dictionary::{DictionaryConfig, KeyCase};
//!
//! let config = DictionaryConfig::builder()
//!     .key_case(KeyCase::Insensitive)
//!     .page_size(250)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.page_size(), 250);
//!
//! let parsed: DictionaryConfig =
//!     serde_json::from_str(r#"{"key_case": "insensitive", "max_batch_size": 50}"#).unwrap();
//! assert_eq!(parsed.max_batch_size(), 50);
//! ```

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::{
    ConfigError,
    batch::{DEFAULT_MAX_BATCH_SIZE, check_max_batch_size},
    validation::PropertyLimits,
};

/// Default number of rows requested per query page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// How dictionary keys are compared.
///
/// Fixed for the lifetime of a dictionary: keys written under one mode are
/// not found under the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyCase {
    /// Keys are stored verbatim.
    #[default]
    Sensitive,
    /// Keys are folded to lowercase before validation and storage.
    Insensitive,
}

impl KeyCase {
    /// Normalizes `key` according to this mode.
    #[must_use]
    pub fn normalize<'k>(self, key: &'k str) -> Cow<'k, str> {
        match self {
            Self::Sensitive => Cow::Borrowed(key),
            Self::Insensitive => {
                let lowered = key.to_lowercase();
                if lowered == key { Cow::Borrowed(key) } else { Cow::Owned(lowered) }
            },
        }
    }
}

/// Tuning knobs for a [`TableDictionary`](crate::TableDictionary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DictionaryConfig {
    #[serde(default)]
    key_case: KeyCase,

    #[serde(default = "default_page_size")]
    page_size: usize,

    #[serde(default = "default_max_batch_size")]
    max_batch_size: usize,

    #[serde(default)]
    property_limits: PropertyLimits,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

#[bon::bon]
impl DictionaryConfig {
    /// Creates a validated configuration.
    ///
    /// # Optional Fields
    ///
    /// * `key_case` - key comparison mode (default: [`KeyCase::Sensitive`]).
    /// * `page_size` - rows per query page (default: 1000).
    /// * `max_batch_size` - operations per atomic batch (default: 100).
    /// * `property_limits` - per-row property ceilings.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::BelowMinimum`] if `page_size` or `max_batch_size` is zero.
    /// - [`ConfigError::Inconsistent`] if `max_batch_size` exceeds
    ///   [`MAX_BATCH_OPERATIONS`](crate::MAX_BATCH_OPERATIONS).
    #[builder]
    pub fn new(
        #[builder(default)] key_case: KeyCase,
        #[builder(default = DEFAULT_PAGE_SIZE)] page_size: usize,
        #[builder(default = DEFAULT_MAX_BATCH_SIZE)] max_batch_size: usize,
        #[builder(default)] property_limits: PropertyLimits,
    ) -> Result<Self, ConfigError> {
        let config = Self { key_case, page_size, max_batch_size, property_limits };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks every bound, e.g. after deserialization.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "page_size",
                min: "1".into(),
                value: "0".into(),
            });
        }
        check_max_batch_size(self.max_batch_size)?;
        self.property_limits.validate()
    }

    /// Returns the key comparison mode.
    #[must_use]
    pub fn key_case(&self) -> KeyCase {
        self.key_case
    }

    /// Returns the rows requested per query page.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the operations per atomic batch.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Returns the per-row property ceilings.
    #[must_use]
    pub fn property_limits(&self) -> &PropertyLimits {
        &self.property_limits
    }
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        Self {
            key_case: KeyCase::default(),
            page_size: DEFAULT_PAGE_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            property_limits: PropertyLimits::default(),
        }
    }
}

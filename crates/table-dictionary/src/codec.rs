//! Entity codec: typed values to flat property bags and back.
//!
//! The row-store only understands a flat bag of leaf properties (see
//! [`PropertyValue`]). This module walks a value through two traits:
//!
//! - [`EntityValue`]: something that fills (or is read from) a whole row.
//! - [`Field`]: one member of such a value.
//!
//! # Mapping
//!
//! | Rust shape | Stored as |
//! |------------|-----------|
//! | leaf (`String`, `i32`, `i64`, `f64`, `bool`, `Bytes`, `DateTime<Utc>`, `Uuid`) as a whole value | one property named [`VALUE_PROPERTY`] |
//! | record (via [`impl_entity_value!`](crate::impl_entity_value)) | one property per member, named after the member |
//! | `Option<T>` member | `T`'s property, or nothing for `None` |
//! | `Vec<T>` member | one string property holding the tagged JSON of the elements |
//! | `Box<T>` / `Rc<T>` / `Arc<T>` member with `T: EntityValue` | one string property holding the tagged JSON of `T`'s bag |
//!
//! Interior mutability (`RefCell<T>`, `parking_lot::Mutex<T>`) is transparent,
//! so `Rc<RefCell<T>>` and `Arc<Mutex<T>>` graphs encode like their targets.
//!
//! Collections of collections are rejected with
//! [`StorageError::UnsupportedShape`]. Shared pointers are tracked by
//! address along the current walk path so a cyclic graph fails with
//! `UnsupportedShape` instead of recursing forever; sharing the same node
//! between siblings is fine. JSON cannot carry NaN or infinity, so a
//! non-finite `f64` inside a collection or nested record is also
//! `UnsupportedShape`; as a top-level member it is stored natively.
//!
//! # Decoding
//!
//! Unknown stored properties are ignored and members without a stored
//! property keep their `Default`. A stored property of the wrong kind fails
//! with [`StorageError::TypeMismatch`]; the only implicit conversion is
//! widening an `Int32` into an `i64` member.
//!
//! # Example
//!
//! ```
//! use table_dictionary::{codec, impl_entity_value};
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Session {
//!     user: String,
//!     hits: i64,
//!     admin: Option<bool>,
//! }
//!
//! impl_entity_value!(Session { user, hits, admin });
//!
//! let session = Session { user: "ada".into(), hits: 3, admin: None };
//! let properties = codec::encode_value(&session).unwrap();
//! assert_eq!(properties.len(), 2);
//!
//! let decoded: Session = codec::decode_value(&properties).unwrap();
//! assert_eq!(decoded, session);
//! ```

use std::{cell::RefCell, collections::HashSet, rc::Rc, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    StorageError, StorageResult,
    entity::{PropertyKind, PropertyMap, PropertyValue},
};

/// Property name used when a whole value is a single leaf or collection.
pub const VALUE_PROPERTY: &str = "Value";

/// Coarse structural class of a [`Field`] type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// A single primitive property.
    Leaf,
    /// A sequence of elements.
    Collection,
    /// A nested record.
    Record,
}

/// Addresses of shared nodes on the current encode path.
#[derive(Debug, Default)]
struct VisitGuard {
    path: HashSet<usize>,
}

impl VisitGuard {
    fn enter(&mut self, address: usize) -> StorageResult<()> {
        if self.path.insert(address) {
            Ok(())
        } else {
            Err(StorageError::unsupported_shape("cyclic reference detected in value graph"))
        }
    }

    fn leave(&mut self, address: usize) {
        self.path.remove(&address);
    }
}

/// Accumulates the properties of one [`EntityValue`].
pub struct EntityWriter<'g> {
    properties: PropertyMap,
    guard: &'g mut VisitGuard,
}

impl<'g> EntityWriter<'g> {
    fn new(guard: &'g mut VisitGuard) -> Self {
        Self { properties: PropertyMap::new(), guard }
    }

    /// Writes a member. `None`-valued members emit nothing.
    ///
    /// # Errors
    ///
    /// Fails if the member cannot be encoded, or if `name` was already
    /// written.
    pub fn member<F: Field>(&mut self, name: &str, value: &F) -> StorageResult<()> {
        if let Some(property) = value.to_property(name, self)? {
            self.property(name, property)?;
        }
        Ok(())
    }

    /// Writes a raw property.
    ///
    /// # Errors
    ///
    /// Fails if `name` was already written.
    pub fn property(&mut self, name: &str, value: PropertyValue) -> StorageResult<()> {
        if self.properties.insert(name.to_owned(), value).is_some() {
            return Err(StorageError::validation(
                "property name",
                format!("'{name}' written more than once"),
            ));
        }
        Ok(())
    }

    /// Runs `write` with the node at `address` marked as being visited.
    fn visit<F>(&mut self, address: usize, write: F) -> StorageResult<()>
    where
        F: FnOnce(&mut Self) -> StorageResult<()>,
    {
        self.guard.enter(address)?;
        let result = write(self);
        self.guard.leave(address);
        result
    }
}

/// Read access to a stored property bag.
#[derive(Debug, Clone, Copy)]
pub struct EntityReader<'a> {
    properties: &'a PropertyMap,
}

impl<'a> EntityReader<'a> {
    /// Wraps a property bag.
    #[must_use]
    pub fn new(properties: &'a PropertyMap) -> Self {
        Self { properties }
    }

    /// Reads a member, returning `None` when no property is stored for it.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::TypeMismatch`] if the stored kind does not
    /// fit `F`.
    pub fn member<F: Field>(&self, name: &str) -> StorageResult<Option<F>> {
        self.properties.get(name).map(|property| F::from_property(name, property)).transpose()
    }

    /// Reads a member, falling back to `F::default()` when absent.
    ///
    /// # Errors
    ///
    /// Same as [`member`](Self::member).
    pub fn member_or_default<F: Field + Default>(&self, name: &str) -> StorageResult<F> {
        Ok(self.member(name)?.unwrap_or_default())
    }

    /// The underlying property bag.
    #[must_use]
    pub fn properties(&self) -> &'a PropertyMap {
        self.properties
    }
}

/// A value that maps onto one whole row.
///
/// Implement it for records with [`impl_entity_value!`](crate::impl_entity_value),
/// or by hand when members need custom property names.
pub trait EntityValue: Sized {
    /// Writes this value's members into `writer`.
    ///
    /// # Errors
    ///
    /// [`StorageError::UnsupportedShape`] for shapes the row model cannot
    /// hold.
    fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()>;

    /// Reconstructs a value from a stored bag.
    ///
    /// # Errors
    ///
    /// [`StorageError::TypeMismatch`] when a stored kind does not fit.
    fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self>;
}

/// One member of an [`EntityValue`].
pub trait Field: Sized {
    /// Structural class, used to reject collections of collections.
    const SHAPE: FieldShape;

    /// Encodes this member. `Ok(None)` means "store nothing".
    ///
    /// # Errors
    ///
    /// [`StorageError::UnsupportedShape`] for unrepresentable members.
    fn to_property(&self, name: &str, writer: &mut EntityWriter<'_>)
    -> StorageResult<Option<PropertyValue>>;

    /// Decodes this member from its stored property.
    ///
    /// # Errors
    ///
    /// [`StorageError::TypeMismatch`] if `property` has the wrong kind.
    fn from_property(name: &str, property: &PropertyValue) -> StorageResult<Self>;
}

/// Encodes `value` into a property bag.
///
/// Nothing is returned until the whole value graph has been walked, so a
/// cycle anywhere in the graph fails before any property is emitted.
///
/// # Errors
///
/// See [`EntityValue::write_entity`].
pub fn encode_value<V: EntityValue>(value: &V) -> StorageResult<PropertyMap> {
    let mut guard = VisitGuard::default();
    let mut writer = EntityWriter::new(&mut guard);
    value.write_entity(&mut writer)?;
    Ok(writer.properties)
}

/// Decodes a property bag into `V`.
///
/// # Errors
///
/// See [`EntityValue::read_entity`].
pub fn decode_value<V: EntityValue>(properties: &PropertyMap) -> StorageResult<V> {
    V::read_entity(&EntityReader::new(properties))
}

fn expect_string<'p>(name: &str, property: &'p PropertyValue) -> StorageResult<&'p str> {
    match property {
        PropertyValue::String(json) => Ok(json),
        other => Err(StorageError::type_mismatch(name, PropertyKind::String, other.kind())),
    }
}

/// JSON has no NaN or infinity, so a payload holding one could never be
/// read back.
fn ensure_finite<'p>(
    name: &str,
    properties: impl IntoIterator<Item = &'p PropertyValue>,
) -> StorageResult<()> {
    let non_finite =
        properties.into_iter().any(|p| matches!(p, PropertyValue::Double(d) if !d.is_finite()));
    if non_finite {
        return Err(StorageError::unsupported_shape(format!(
            "member '{name}' holds a non-finite double inside a serialized payload"
        )));
    }
    Ok(())
}

/// Encodes a nested value as one tagged-JSON string property, sharing the
/// parent's visit path.
fn encode_nested<T: EntityValue>(
    name: &str,
    value: &T,
    parent: &mut EntityWriter<'_>,
) -> StorageResult<PropertyValue> {
    let mut writer = EntityWriter::new(&mut *parent.guard);
    value.write_entity(&mut writer)?;
    ensure_finite(name, writer.properties.values())?;
    let json = serde_json::to_string(&writer.properties).map_err(|e| {
        StorageError::serialization_with_source(format!("failed to encode member '{name}'"), e)
    })?;
    Ok(PropertyValue::String(json))
}

fn decode_nested<T: EntityValue>(name: &str, property: &PropertyValue) -> StorageResult<T> {
    let json = expect_string(name, property)?;
    let properties: PropertyMap = serde_json::from_str(json).map_err(|e| {
        StorageError::serialization_with_source(format!("failed to decode member '{name}'"), e)
    })?;
    decode_value(&properties)
}

macro_rules! leaf_field {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Field for $ty {
                const SHAPE: FieldShape = FieldShape::Leaf;

                fn to_property(
                    &self,
                    _name: &str,
                    _writer: &mut EntityWriter<'_>,
                ) -> StorageResult<Option<PropertyValue>> {
                    Ok(Some(PropertyValue::$variant(self.clone())))
                }

                fn from_property(name: &str, property: &PropertyValue) -> StorageResult<Self> {
                    match property {
                        PropertyValue::$variant(value) => Ok(value.clone()),
                        other => Err(StorageError::type_mismatch(
                            name,
                            PropertyKind::$variant,
                            other.kind(),
                        )),
                    }
                }
            }

            impl EntityValue for $ty {
                fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()> {
                    writer.member(VALUE_PROPERTY, self)
                }

                fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self> {
                    reader.member_or_default(VALUE_PROPERTY)
                }
            }
        )*
    };
}

leaf_field! {
    String => String,
    i32 => Int32,
    f64 => Double,
    bool => Bool,
    Bytes => Binary,
    DateTime<Utc> => Timestamp,
    Uuid => Guid,
}

impl Field for i64 {
    const SHAPE: FieldShape = FieldShape::Leaf;

    fn to_property(
        &self,
        _name: &str,
        _writer: &mut EntityWriter<'_>,
    ) -> StorageResult<Option<PropertyValue>> {
        Ok(Some(PropertyValue::Int64(*self)))
    }

    fn from_property(name: &str, property: &PropertyValue) -> StorageResult<Self> {
        match property {
            PropertyValue::Int64(value) => Ok(*value),
            PropertyValue::Int32(value) => Ok(i64::from(*value)),
            other => Err(StorageError::type_mismatch(name, PropertyKind::Int64, other.kind())),
        }
    }
}

impl EntityValue for i64 {
    fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()> {
        writer.member(VALUE_PROPERTY, self)
    }

    fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self> {
        reader.member_or_default(VALUE_PROPERTY)
    }
}

impl<T: Field> Field for Option<T> {
    const SHAPE: FieldShape = T::SHAPE;

    fn to_property(
        &self,
        name: &str,
        writer: &mut EntityWriter<'_>,
    ) -> StorageResult<Option<PropertyValue>> {
        match self {
            Some(value) => value.to_property(name, writer),
            None => Ok(None),
        }
    }

    fn from_property(name: &str, property: &PropertyValue) -> StorageResult<Self> {
        T::from_property(name, property).map(Some)
    }
}

fn reject_nested_collection<T: Field>(name: &str) -> StorageResult<()> {
    if T::SHAPE == FieldShape::Collection {
        return Err(StorageError::unsupported_shape(format!(
            "member '{name}' is a collection of collections"
        )));
    }
    Ok(())
}

impl<T: Field> Field for Vec<T> {
    const SHAPE: FieldShape = FieldShape::Collection;

    fn to_property(
        &self,
        name: &str,
        writer: &mut EntityWriter<'_>,
    ) -> StorageResult<Option<PropertyValue>> {
        reject_nested_collection::<T>(name)?;
        let mut items = Vec::with_capacity(self.len());
        for item in self {
            match item.to_property(name, writer)? {
                Some(property) => items.push(property),
                None => {
                    return Err(StorageError::unsupported_shape(format!(
                        "member '{name}' contains an empty element"
                    )));
                },
            }
        }
        ensure_finite(name, &items)?;
        let json = serde_json::to_string(&items).map_err(|e| {
            StorageError::serialization_with_source(format!("failed to encode member '{name}'"), e)
        })?;
        Ok(Some(PropertyValue::String(json)))
    }

    fn from_property(name: &str, property: &PropertyValue) -> StorageResult<Self> {
        reject_nested_collection::<T>(name)?;
        let json = expect_string(name, property)?;
        let items: Vec<PropertyValue> = serde_json::from_str(json).map_err(|e| {
            StorageError::serialization_with_source(format!("failed to decode member '{name}'"), e)
        })?;
        items.iter().map(|item| T::from_property(name, item)).collect()
    }
}

impl<T: Field> EntityValue for Vec<T> {
    fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()> {
        writer.member(VALUE_PROPERTY, self)
    }

    fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self> {
        Ok(reader.member(VALUE_PROPERTY)?.unwrap_or_default())
    }
}

impl EntityValue for PropertyMap {
    fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()> {
        for (name, value) in self {
            writer.property(name, value.clone())?;
        }
        Ok(())
    }

    fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self> {
        Ok(reader.properties().clone())
    }
}

impl<T: EntityValue> EntityValue for Box<T> {
    fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()> {
        (**self).write_entity(writer)
    }

    fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self> {
        T::read_entity(reader).map(Box::new)
    }
}

impl<T: EntityValue> EntityValue for Rc<T> {
    fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()> {
        writer.visit(Rc::as_ptr(self).addr(), |w| (**self).write_entity(w))
    }

    fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self> {
        T::read_entity(reader).map(Rc::new)
    }
}

impl<T: EntityValue> EntityValue for Arc<T> {
    fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()> {
        writer.visit(Arc::as_ptr(self).addr(), |w| (**self).write_entity(w))
    }

    fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self> {
        T::read_entity(reader).map(Arc::new)
    }
}

impl<T: EntityValue> EntityValue for Mutex<T> {
    fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()> {
        self.lock().write_entity(writer)
    }

    fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self> {
        T::read_entity(reader).map(Mutex::new)
    }
}

impl<T: EntityValue> EntityValue for RefCell<T> {
    fn write_entity(&self, writer: &mut EntityWriter<'_>) -> StorageResult<()> {
        let inner = self.try_borrow().map_err(|_| {
            StorageError::unsupported_shape("value is mutably borrowed while being encoded")
        })?;
        inner.write_entity(writer)
    }

    fn read_entity(reader: &EntityReader<'_>) -> StorageResult<Self> {
        T::read_entity(reader).map(RefCell::new)
    }
}

macro_rules! record_field {
    ($($wrapper:ident),*) => {
        $(
            impl<T: EntityValue> Field for $wrapper<T> {
                const SHAPE: FieldShape = FieldShape::Record;

                fn to_property(
                    &self,
                    name: &str,
                    writer: &mut EntityWriter<'_>,
                ) -> StorageResult<Option<PropertyValue>> {
                    encode_nested(name, self, writer).map(Some)
                }

                fn from_property(name: &str, property: &PropertyValue) -> StorageResult<Self> {
                    decode_nested(name, property)
                }
            }
        )*
    };
}

record_field!(Box, Rc, Arc);

/// Implements [`EntityValue`] for a struct, one property per listed member.
///
/// The struct must implement `Default`; members without a stored property
/// keep their default on decode. Property names are the member names.
///
/// ```
/// use table_dictionary::impl_entity_value;
///
/// #[derive(Default)]
/// struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// impl_entity_value!(Point { x, y });
/// ```
#[macro_export]
macro_rules! impl_entity_value {
    ($ty:ty { $($member:ident),* $(,)? }) => {
        impl $crate::codec::EntityValue for $ty {
            fn write_entity(
                &self,
                writer: &mut $crate::codec::EntityWriter<'_>,
            ) -> $crate::StorageResult<()> {
                $( writer.member(stringify!($member), &self.$member)?; )*
                Ok(())
            }

            fn read_entity(
                reader: &$crate::codec::EntityReader<'_>,
            ) -> $crate::StorageResult<Self> {
                let mut value = <$ty as ::core::default::Default>::default();
                $(
                    if let Some(member) = reader.member(stringify!($member))? {
                        value.$member = member;
                    }
                )*
                Ok(value)
            }
        }
    };
}

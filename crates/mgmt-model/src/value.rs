//! Model values
//!
//! [`ModelValue`] is the recursively-typed value used for stored resource
//! attributes, operation parameters and operation results. Objects keep
//! insertion order so that serialized output is deterministic.
//!
//! A value can be *protected* (deep-frozen). Writes to a protected value fail
//! with [`ModelError::Protected`]; [`Clone`] always yields an unprotected deep
//! copy, which is how callers obtain a writable working copy.

use crate::hash::ContentHash;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;
use std::fmt::{self, Display, Formatter};

static UNDEFINED: ModelValue = ModelValue {
    value: Value::Undefined,
    protected: true,
};

/// Type tag of a [`ModelValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// No value
    Undefined,
    /// `true` or `false`
    Boolean,
    /// Integer or float
    Number,
    /// UTF-8 text
    String,
    /// Raw bytes
    Bytes,
    /// Ordered list
    List,
    /// Insertion-ordered map
    Object,
}

impl Display for ModelType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelType::Undefined => "undefined",
            ModelType::Boolean => "boolean",
            ModelType::Number => "number",
            ModelType::String => "string",
            ModelType::Bytes => "bytes",
            ModelType::List => "list",
            ModelType::Object => "object",
        };
        f.write_str(name)
    }
}

/// Payload of a [`ModelValue`]
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value
    Undefined,
    /// Boolean
    Boolean(bool),
    /// JSON number
    Number(Number),
    /// Text
    String(String),
    /// Raw bytes, hex-tagged in JSON
    Bytes(Vec<u8>),
    /// Ordered list
    List(Vec<ModelValue>),
    /// Insertion-ordered map
    Object(IndexMap<String, ModelValue>),
}

/// A configuration value, operation parameter or operation result
#[derive(Debug)]
pub struct ModelValue {
    value: Value,
    protected: bool,
}

impl ModelValue {
    /// The undefined value
    #[inline]
    #[must_use]
    pub const fn undefined() -> Self {
        Self {
            value: Value::Undefined,
            protected: false,
        }
    }

    /// Empty object
    #[must_use]
    pub fn new_object() -> Self {
        Self::from_value(Value::Object(IndexMap::new()))
    }

    /// Empty list
    #[must_use]
    pub fn new_list() -> Self {
        Self::from_value(Value::List(Vec::new()))
    }

    #[inline]
    fn from_value(value: Value) -> Self {
        Self {
            value,
            protected: false,
        }
    }

    /// Payload
    #[inline]
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Type tag
    #[must_use]
    pub fn model_type(&self) -> ModelType {
        match self.value {
            Value::Undefined => ModelType::Undefined,
            Value::Boolean(_) => ModelType::Boolean,
            Value::Number(_) => ModelType::Number,
            Value::String(_) => ModelType::String,
            Value::Bytes(_) => ModelType::Bytes,
            Value::List(_) => ModelType::List,
            Value::Object(_) => ModelType::Object,
        }
    }

    /// Anything but undefined
    #[inline]
    #[must_use]
    pub fn is_defined(&self) -> bool {
        !matches!(self.value, Value::Undefined)
    }

    /// Whether writes are refused
    #[inline]
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Deep-freeze this value and everything below it
    pub fn protect(&mut self) {
        if self.protected {
            return;
        }
        self.protected = true;
        match &mut self.value {
            Value::List(items) => items.iter_mut().for_each(ModelValue::protect),
            Value::Object(map) => map.values_mut().for_each(ModelValue::protect),
            _ => {}
        }
    }

    /// Protected copy of this value
    #[must_use]
    pub fn into_protected(mut self) -> Self {
        self.protect();
        self
    }

    fn check_writable(&self) -> Result<(), ModelError> {
        if self.protected {
            Err(ModelError::Protected)
        } else {
            Ok(())
        }
    }

    fn mismatch(&self, expected: ModelType) -> ModelError {
        ModelError::TypeMismatch {
            expected,
            actual: self.model_type(),
        }
    }

    /// Read an object entry
    ///
    /// Missing keys and an undefined receiver yield undefined.
    ///
    /// # Errors
    /// [`ModelError::TypeMismatch`] when the receiver is neither an object nor
    /// undefined.
    pub fn get(&self, key: &str) -> Result<&ModelValue, ModelError> {
        match &self.value {
            Value::Object(map) => Ok(map.get(key).unwrap_or(&UNDEFINED)),
            Value::Undefined => Ok(&UNDEFINED),
            _ => Err(self.mismatch(ModelType::Object)),
        }
    }

    /// Writable object entry, created undefined when missing
    ///
    /// An undefined receiver becomes an empty object first.
    ///
    /// # Errors
    /// [`ModelError::Protected`] or [`ModelError::TypeMismatch`].
    pub fn get_mut(&mut self, key: &str) -> Result<&mut ModelValue, ModelError> {
        self.check_writable()?;
        if matches!(self.value, Value::Undefined) {
            self.value = Value::Object(IndexMap::new());
        }
        let mismatch = self.mismatch(ModelType::Object);
        match &mut self.value {
            Value::Object(map) => Ok(map
                .entry(key.to_string())
                .or_insert_with(ModelValue::undefined)),
            _ => Err(mismatch),
        }
    }

    /// Set an object entry
    ///
    /// # Errors
    /// Same as [`get_mut`](Self::get_mut).
    pub fn set(&mut self, key: &str, value: impl Into<ModelValue>) -> Result<(), ModelError> {
        *self.get_mut(key)? = value.into();
        Ok(())
    }

    /// Replace the whole value
    ///
    /// # Errors
    /// [`ModelError::Protected`].
    pub fn set_value(&mut self, value: impl Into<ModelValue>) -> Result<(), ModelError> {
        self.check_writable()?;
        *self = value.into();
        Ok(())
    }

    /// Remove an object entry, preserving the order of the others
    ///
    /// # Errors
    /// [`ModelError::Protected`] or [`ModelError::TypeMismatch`].
    pub fn remove(&mut self, key: &str) -> Result<Option<ModelValue>, ModelError> {
        self.check_writable()?;
        match &mut self.value {
            Value::Object(map) => Ok(map.shift_remove(key)),
            Value::Undefined => Ok(None),
            _ => Err(self.mismatch(ModelType::Object)),
        }
    }

    /// Whether an object entry is present, defined or not
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        matches!(&self.value, Value::Object(map) if map.contains_key(key))
    }

    /// Whether an object entry is present and defined
    #[must_use]
    pub fn has_defined(&self, key: &str) -> bool {
        self.get(key).map(ModelValue::is_defined).unwrap_or(false)
    }

    /// Object keys in insertion order; empty for other types
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        let map = match &self.value {
            Value::Object(map) => Some(map),
            _ => None,
        };
        map.into_iter().flat_map(|m| m.keys().map(String::as_str))
    }

    /// Append to a list; an undefined receiver becomes an empty list first
    ///
    /// # Errors
    /// [`ModelError::Protected`] or [`ModelError::TypeMismatch`].
    pub fn push(&mut self, value: impl Into<ModelValue>) -> Result<(), ModelError> {
        self.check_writable()?;
        if matches!(self.value, Value::Undefined) {
            self.value = Value::List(Vec::new());
        }
        match &mut self.value {
            Value::List(items) => {
                items.push(value.into());
                Ok(())
            }
            _ => Err(self.mismatch(ModelType::List)),
        }
    }

    /// # Errors
    /// [`ModelError::TypeMismatch`] unless boolean.
    pub fn as_bool(&self) -> Result<bool, ModelError> {
        match &self.value {
            Value::Boolean(b) => Ok(*b),
            _ => Err(self.mismatch(ModelType::Boolean)),
        }
    }

    /// # Errors
    /// [`ModelError::TypeMismatch`] unless an integral number.
    pub fn as_i64(&self) -> Result<i64, ModelError> {
        match &self.value {
            Value::Number(n) => n.as_i64().ok_or(ModelError::Conversion {
                from: ModelType::Number,
                to: "i64",
            }),
            _ => Err(self.mismatch(ModelType::Number)),
        }
    }

    /// # Errors
    /// [`ModelError::TypeMismatch`] unless a number.
    pub fn as_f64(&self) -> Result<f64, ModelError> {
        match &self.value {
            Value::Number(n) => n.as_f64().ok_or(ModelError::Conversion {
                from: ModelType::Number,
                to: "f64",
            }),
            _ => Err(self.mismatch(ModelType::Number)),
        }
    }

    /// # Errors
    /// [`ModelError::TypeMismatch`] unless a string.
    pub fn as_str(&self) -> Result<&str, ModelError> {
        match &self.value {
            Value::String(s) => Ok(s),
            _ => Err(self.mismatch(ModelType::String)),
        }
    }

    /// # Errors
    /// [`ModelError::TypeMismatch`] unless bytes.
    pub fn as_bytes(&self) -> Result<&[u8], ModelError> {
        match &self.value {
            Value::Bytes(b) => Ok(b),
            _ => Err(self.mismatch(ModelType::Bytes)),
        }
    }

    /// # Errors
    /// [`ModelError::TypeMismatch`] unless a list.
    pub fn as_list(&self) -> Result<&[ModelValue], ModelError> {
        match &self.value {
            Value::List(items) => Ok(items),
            _ => Err(self.mismatch(ModelType::List)),
        }
    }

    /// # Errors
    /// [`ModelError::TypeMismatch`] unless an object.
    pub fn as_object(&self) -> Result<&IndexMap<String, ModelValue>, ModelError> {
        match &self.value {
            Value::Object(map) => Ok(map),
            _ => Err(self.mismatch(ModelType::Object)),
        }
    }

    /// JSON form; bytes become `{"BYTES_VALUE": "<hex>"}`
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match &self.value {
            Value::Undefined => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Number(n) => Json::Number(n.clone()),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(b) => {
                let mut tagged = serde_json::Map::with_capacity(1);
                tagged.insert(BYTES_TAG.to_string(), Json::String(hex::encode(b)));
                Json::Object(tagged)
            }
            Value::List(items) => Json::Array(items.iter().map(ModelValue::to_json).collect()),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Build from JSON
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        let value = match json {
            Json::Null => Value::Undefined,
            Json::Bool(b) => Value::Boolean(b),
            Json::Number(n) => Value::Number(n),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Self::from_json).collect()),
            Json::Object(map) => match bytes_of(&map) {
                Some(bytes) => Value::Bytes(bytes),
                None => Value::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, Self::from_json(v)))
                        .collect(),
                ),
            },
        };
        Self::from_value(value)
    }

    /// Blake3 fingerprint of the canonical JSON encoding
    #[must_use]
    pub fn fingerprint(&self) -> ContentHash {
        ContentHash::compute(self.to_json().to_string().as_bytes())
    }
}

/// Key of the single-entry object that carries a bytes value
pub const BYTES_TAG: &str = "BYTES_VALUE";

/// Decoded payload of a `{"BYTES_VALUE": "<hex>"}` object
fn bytes_of(map: &serde_json::Map<String, serde_json::Value>) -> Option<Vec<u8>> {
    if map.len() != 1 {
        return None;
    }
    map.get(BYTES_TAG)?
        .as_str()
        .and_then(|text| hex::decode(text).ok())
}

impl Default for ModelValue {
    fn default() -> Self {
        Self::undefined()
    }
}

impl Clone for ModelValue {
    /// Deep copy; the copy is never protected.
    fn clone(&self) -> Self {
        Self::from_value(self.value.clone())
    }
}

impl PartialEq for ModelValue {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Display for ModelValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for ModelValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ModelValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from_json)
    }
}

impl From<bool> for ModelValue {
    fn from(b: bool) -> Self {
        Self::from_value(Value::Boolean(b))
    }
}

impl From<i64> for ModelValue {
    fn from(n: i64) -> Self {
        Self::from_value(Value::Number(n.into()))
    }
}

impl From<i32> for ModelValue {
    fn from(n: i32) -> Self {
        Self::from_value(Value::Number(n.into()))
    }
}

impl From<u64> for ModelValue {
    fn from(n: u64) -> Self {
        Self::from_value(Value::Number(n.into()))
    }
}

impl From<f64> for ModelValue {
    /// Non-finite floats have no number representation and become undefined.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or_else(Self::undefined, |n| Self::from_value(Value::Number(n)))
    }
}

impl From<&str> for ModelValue {
    fn from(s: &str) -> Self {
        Self::from_value(Value::String(s.to_string()))
    }
}

impl From<String> for ModelValue {
    fn from(s: String) -> Self {
        Self::from_value(Value::String(s))
    }
}

impl From<Vec<u8>> for ModelValue {
    fn from(b: Vec<u8>) -> Self {
        Self::from_value(Value::Bytes(b))
    }
}

impl From<Vec<ModelValue>> for ModelValue {
    fn from(items: Vec<ModelValue>) -> Self {
        Self::from_value(Value::List(items))
    }
}

impl From<IndexMap<String, ModelValue>> for ModelValue {
    fn from(map: IndexMap<String, ModelValue>) -> Self {
        Self::from_value(Value::Object(map))
    }
}

impl From<serde_json::Value> for ModelValue {
    fn from(json: serde_json::Value) -> Self {
        Self::from_json(json)
    }
}

impl<K: Into<String>, V: Into<ModelValue>> FromIterator<(K, V)> for ModelValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_value(Value::Object(
            iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ))
    }
}

/// Errors raised by [`ModelValue`] accessors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Accessor used on the wrong variant
    #[error("type mismatch: expected {expected}, found {actual}")]
    TypeMismatch {
        /// Variant the accessor needs
        expected: ModelType,
        /// Variant actually held
        actual: ModelType,
    },

    /// Write to a protected value
    #[error("illegal state: value is protected")]
    Protected,

    /// Number does not fit the requested representation
    #[error("cannot convert {from} to {to}")]
    Conversion {
        /// Source variant
        from: ModelType,
        /// Target representation
        to: &'static str,
    },
}

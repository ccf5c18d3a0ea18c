//! Courier Value Schema
//!
//! This module defines the value model carried by messages and exchanges, the
//! data-type tags attached to bodies, and the type conversion contract used for
//! coerced header, property and body retrieval.

mod value;

pub use value::{SharedList, SharedObject, Value};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Value kinds, also used as conversion targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Null,
    Bool,
    I64,
    U64,
    F64,
    String,
    Bytes,
    Array,
    List,
    Shared,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::I64 => "i64",
            ValueKind::U64 => "u64",
            ValueKind::F64 => "f64",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Array => "array",
            ValueKind::List => "list",
            ValueKind::Shared => "shared",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural data-type tag attached to a message body
///
/// Purely descriptive: routing never branches on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataType {
    name: String,
}

impl DataType {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Data type derived from the runtime type of a value
    pub fn of(value: &Value) -> Self {
        Self::new(format!("rust:{}", value.type_name()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Type conversion errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConversionError {
    #[error("No type converter available to convert from {from} to {to}")]
    NoConverter { from: ValueKind, to: ValueKind },

    #[error("Error converting value of kind {from} to {to}: {reason}")]
    Failed {
        from: ValueKind,
        to: ValueKind,
        reason: String,
    },

    #[error("Converter already registered: {from} -> {to}")]
    AlreadyRegistered { from: ValueKind, to: ValueKind },
}

/// Result type for conversion operations
pub type ConversionResult<T> = Result<T, ConversionError>;

/// Converts values between kinds
///
/// `convert_to` returns `None` when no conversion applies; callers that need a
/// value use `mandatory_convert_to`, which turns that into an error.
pub trait TypeConverter: Send + Sync {
    /// Convert a value to the requested kind
    fn convert_to(&self, kind: ValueKind, value: &Value) -> Option<Value>;

    /// Convert a value to the requested kind, failing if impossible
    fn mandatory_convert_to(&self, kind: ValueKind, value: &Value) -> ConversionResult<Value> {
        self.convert_to(kind, value)
            .ok_or(ConversionError::NoConverter {
                from: value.kind(),
                to: kind,
            })
    }
}

/// Built-in coercion rules between the value kinds
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardTypeConverter;

impl TypeConverter for StandardTypeConverter {
    fn convert_to(&self, kind: ValueKind, value: &Value) -> Option<Value> {
        if value.kind() == kind {
            return Some(value.clone());
        }
        if value.is_null() {
            return None;
        }

        match kind {
            ValueKind::Null => None,
            ValueKind::String => match value {
                Value::Bytes(bytes) => String::from_utf8(bytes.clone()).ok().map(Value::String),
                Value::Shared(_) => None,
                other => Some(Value::String(other.to_string())),
            },
            ValueKind::Bool => match value {
                Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Some(Value::Bool(true)),
                Value::String(s) if s.trim().eq_ignore_ascii_case("false") => Some(Value::Bool(false)),
                _ => None,
            },
            ValueKind::I64 => match value {
                Value::U64(v) => i64::try_from(*v).ok().map(Value::I64),
                Value::F64(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                    Some(Value::I64(*v as i64))
                }
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::I64),
                _ => None,
            },
            ValueKind::U64 => match value {
                Value::I64(v) => u64::try_from(*v).ok().map(Value::U64),
                Value::F64(v) if v.fract() == 0.0 && *v >= 0.0 && *v < u64::MAX as f64 => {
                    Some(Value::U64(*v as u64))
                }
                Value::String(s) => s.trim().parse::<u64>().ok().map(Value::U64),
                _ => None,
            },
            ValueKind::F64 => match value {
                Value::String(s) => s.trim().parse::<f64>().ok().map(Value::F64),
                other => other.as_f64().map(Value::F64),
            },
            ValueKind::Bytes => match value {
                Value::String(s) => Some(Value::Bytes(s.as_bytes().to_vec())),
                _ => None,
            },
            ValueKind::Array => match value {
                Value::List(list) => Some(Value::Array(list.snapshot())),
                other => Some(Value::Array(vec![other.clone()])),
            },
            ValueKind::List => match value {
                Value::Array(items) => Some(Value::List(SharedList::from_vec(items.clone()))),
                _ => None,
            },
            ValueKind::Shared => None,
        }
    }
}

/// Conversion function registered for a `(from, to)` pair
pub type ConverterFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Registry of custom converters with standard coercion as fallback
///
/// Uses DashMap so adapters can register converters while exchanges are being
/// converted on other threads.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: dashmap::DashMap<(ValueKind, ValueKind), ConverterFn>,
    fallback: StandardTypeConverter,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a converter; a pair can only be registered once
    pub fn register<F>(&self, from: ValueKind, to: ValueKind, converter: F) -> ConversionResult<()>
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        match self.converters.entry((from, to)) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ConversionError::AlreadyRegistered { from, to })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(converter));
                Ok(())
            }
        }
    }

    /// Check if a custom converter exists for the pair
    pub fn has_converter(&self, from: ValueKind, to: ValueKind) -> bool {
        self.converters.contains_key(&(from, to))
    }

    /// Number of custom converters
    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

impl TypeConverter for ConverterRegistry {
    fn convert_to(&self, kind: ValueKind, value: &Value) -> Option<Value> {
        let custom = self
            .converters
            .get(&(value.kind(), kind))
            .map(|entry| Arc::clone(entry.value()));
        match custom {
            Some(converter) => converter(value),
            None => self.fallback.convert_to(kind, value),
        }
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("converters", &self.converters.len())
            .finish()
    }
}

/// Rust types that can be extracted from a converted [`Value`]
pub trait FromValue: Sized {
    /// Kind to convert to before extraction
    const KIND: ValueKind;

    fn from_value(value: Value) -> Option<Self>;
}

impl FromValue for String {
    const KIND: ValueKind = ValueKind::String;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl FromValue for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn from_value(value: Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for i64 {
    const KIND: ValueKind = ValueKind::I64;

    fn from_value(value: Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromValue for i32 {
    const KIND: ValueKind = ValueKind::I64;

    fn from_value(value: Value) -> Option<Self> {
        value.as_i64().and_then(|v| i32::try_from(v).ok())
    }
}

impl FromValue for u64 {
    const KIND: ValueKind = ValueKind::U64;

    fn from_value(value: Value) -> Option<Self> {
        value.as_u64()
    }
}

impl FromValue for usize {
    const KIND: ValueKind = ValueKind::U64;

    fn from_value(value: Value) -> Option<Self> {
        value.as_u64().and_then(|v| usize::try_from(v).ok())
    }
}

impl FromValue for f64 {
    const KIND: ValueKind = ValueKind::F64;

    fn from_value(value: Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromValue for Vec<u8> {
    const KIND: ValueKind = ValueKind::Bytes;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl FromValue for Vec<Value> {
    const KIND: ValueKind = ValueKind::Array;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Convert and extract in one step, `None` when either stage fails
pub fn convert<T: FromValue>(converter: &dyn TypeConverter, value: &Value) -> Option<T> {
    converter.convert_to(T::KIND, value).and_then(T::from_value)
}

/// Convert and extract, failing with a conversion error
pub fn mandatory_convert<T: FromValue>(
    converter: &dyn TypeConverter,
    value: &Value,
) -> ConversionResult<T> {
    let converted = converter.mandatory_convert_to(T::KIND, value)?;
    T::from_value(converted).ok_or(ConversionError::Failed {
        from: value.kind(),
        to: T::KIND,
        reason: "converted value has unexpected kind".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_string_to_numbers() {
        let conv = StandardTypeConverter;
        assert_eq!(convert::<i64>(&conv, &Value::from(" 42 ")), Some(42));
        assert_eq!(convert::<u64>(&conv, &Value::from("7")), Some(7));
        assert_eq!(convert::<f64>(&conv, &Value::from("2.5")), Some(2.5));
        assert_eq!(convert::<i64>(&conv, &Value::from("forty-two")), None);
    }

    #[test]
    fn test_standard_to_string() {
        let conv = StandardTypeConverter;
        assert_eq!(convert::<String>(&conv, &Value::from(12)), Some("12".to_string()));
        assert_eq!(convert::<String>(&conv, &Value::from(true)), Some("true".to_string()));
        assert_eq!(
            convert::<String>(&conv, &Value::Bytes(b"payload".to_vec())),
            Some("payload".to_string())
        );
    }

    #[test]
    fn test_standard_bool_parsing() {
        let conv = StandardTypeConverter;
        assert_eq!(convert::<bool>(&conv, &Value::from("TRUE")), Some(true));
        assert_eq!(convert::<bool>(&conv, &Value::from("no")), None);
    }

    #[test]
    fn test_null_never_converts() {
        let conv = StandardTypeConverter;
        assert_eq!(conv.convert_to(ValueKind::String, &Value::Null), None);
        assert!(matches!(
            conv.mandatory_convert_to(ValueKind::I64, &Value::Null),
            Err(ConversionError::NoConverter { to: ValueKind::I64, .. })
        ));
    }

    #[test]
    fn test_mandatory_convert_error() {
        let conv = StandardTypeConverter;
        let err = mandatory_convert::<i64>(&conv, &Value::from("abc")).unwrap_err();
        assert_eq!(
            err,
            ConversionError::NoConverter {
                from: ValueKind::String,
                to: ValueKind::I64
            }
        );
    }

    #[test]
    fn test_registry_prefers_custom_converter() {
        let registry = ConverterRegistry::new();
        registry
            .register(ValueKind::String, ValueKind::Bool, |v| {
                v.as_str().map(|s| Value::Bool(s == "yes"))
            })
            .unwrap();

        assert_eq!(convert::<bool>(&registry, &Value::from("yes")), Some(true));
        // falls back to the standard rules for other pairs
        assert_eq!(convert::<i64>(&registry, &Value::from("5")), Some(5));
        assert!(registry.has_converter(ValueKind::String, ValueKind::Bool));
    }

    #[test]
    fn test_registry_duplicate() {
        let registry = ConverterRegistry::new();
        registry
            .register(ValueKind::I64, ValueKind::Bool, |_| None)
            .unwrap();
        let result = registry.register(ValueKind::I64, ValueKind::Bool, |_| None);
        assert!(matches!(result, Err(ConversionError::AlreadyRegistered { .. })));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_data_type_of_value() {
        assert_eq!(DataType::of(&Value::from("x")).name(), "rust:string");
        assert_eq!(DataType::new("json").to_string(), "json");
    }

    #[test]
    fn test_array_and_list_conversion() {
        let conv = StandardTypeConverter;
        let list = SharedList::from_vec(vec![Value::from(1)]);
        assert_eq!(
            conv.convert_to(ValueKind::Array, &Value::List(list)),
            Some(Value::Array(vec![Value::from(1)]))
        );
        assert_eq!(
            conv.convert_to(ValueKind::Array, &Value::from("a")),
            Some(Value::Array(vec![Value::from("a")]))
        );
    }
}

//! Message value model
//!
//! Values are either owned (cloned deeply on copy) or shared (`List`, `Shared`),
//! where cloning aliases the same allocation. Message and exchange copies rely on
//! this split: owned values give independent copies, shared values are visible
//! from every copy that holds them.

use crate::ValueKind;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// A dynamically typed value carried in bodies, headers, properties and variables
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Owned list, deep-copied on clone
    Array(Vec<Value>),
    /// Shared mutable list, aliased on clone
    List(SharedList),
    /// Opaque shared object, aliased on clone
    Shared(SharedObject),
}

impl Value {
    /// Kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::I64(_) => ValueKind::I64,
            Value::U64(_) => ValueKind::U64,
            Value::F64(_) => ValueKind::F64,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Array(_) => ValueKind::Array,
            Value::List(_) => ValueKind::List,
            Value::Shared(_) => ValueKind::Shared,
        }
    }

    /// Runtime type name, the concrete type for shared objects
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Shared(obj) => obj.type_name(),
            other => other.kind().as_str(),
        }
    }

    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether cloning this value aliases shared state
    pub fn is_shared(&self) -> bool {
        matches!(self, Value::List(_) | Value::Shared(_))
    }

    /// Get as i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            Value::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Get as u64 if possible
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            Value::I64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Get as f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            Value::I64(v) => Some(*v as f64),
            Value::U64(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as string slice if possible
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as bool if possible
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as byte slice if possible
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Get the shared list handle if this is a list
    pub fn as_list(&self) -> Option<&SharedList> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Downcast a shared object to a concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Shared(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }
}

/// Owned values compare structurally, shared values compare by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::List(a), Value::List(b)) => a.ptr_eq(b),
            (Value::Shared(a), Value::Shared(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Value::Array(items) => write_items(f, items),
            Value::List(list) => write_items(f, &list.snapshot()),
            Value::Shared(obj) => write!(f, "<{}>", obj.type_name()),
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    write!(f, "[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    write!(f, "]")
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I64(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::U64(v as u64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<SharedList> for Value {
    fn from(v: SharedList) -> Self {
        Value::List(v)
    }
}

impl From<SharedObject> for Value {
    fn from(v: SharedObject) -> Self {
        Value::Shared(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Shared, internally synchronized list
///
/// Clones alias the same storage. Use [`SharedList::detached_copy`] when a
/// snapshot must stop observing later mutation of the source.
#[derive(Clone, Default)]
pub struct SharedList {
    items: Arc<RwLock<Vec<Value>>>,
}

impl SharedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self {
            items: Arc::new(RwLock::new(items)),
        }
    }

    /// Append an item, visible to every alias of this list
    pub fn push(&self, value: Value) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone the current items out of the list
    pub fn snapshot(&self) -> Vec<Value> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// New list with its own storage, seeded with the current items
    pub fn detached_copy(&self) -> Self {
        Self::from_vec(self.snapshot())
    }

    /// Whether both handles point at the same storage
    pub fn ptr_eq(&self, other: &SharedList) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }
}

impl fmt::Debug for SharedList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot().iter()).finish()
    }
}

/// Opaque object shared by reference between copies
#[derive(Clone)]
pub struct SharedObject {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl SharedObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            inner: value,
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }

    pub fn ptr_eq(&self, other: &SharedObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SharedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedObject<{}>", self.type_name)
    }
}

impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::I64(v) => serializer.serialize_i64(*v),
            Value::U64(v) => serializer.serialize_u64(*v),
            Value::F64(v) => serializer.serialize_f64(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::Bytes(v) => serializer.serialize_bytes(v),
            Value::Array(items) => serialize_items(serializer, items),
            Value::List(list) => serialize_items(serializer, &list.snapshot()),
            Value::Shared(obj) => serializer.serialize_str(&format!("<{}>", obj.type_name())),
        }
    }
}

fn serialize_items<S: serde::Serializer>(serializer: S, items: &[Value]) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(items.len()))?;
    for item in items {
        seq.serialize_element(item)?;
    }
    seq.end()
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a scalar, byte string or sequence")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D: serde::Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
                serde::Deserialize::deserialize(d)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
                Ok(Value::I64(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
                // keep small unsigned literals signed, matching how they were most likely written
                Ok(i64::try_from(v).map(Value::I64).unwrap_or(Value::U64(v)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
                Ok(Value::F64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
                Ok(Value::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
                Ok(Value::String(v))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
                Ok(Value::Bytes(v.to_vec()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(items))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_clone_is_independent() {
        let original = Value::Array(vec![Value::from(1), Value::from("a")]);
        let mut copy = original.clone();
        if let Value::Array(items) = &mut copy {
            items.push(Value::from(2));
        }
        assert_ne!(original, copy);
    }

    #[test]
    fn test_shared_list_aliases_on_clone() {
        let list = SharedList::new();
        let value = Value::List(list.clone());
        let alias = value.clone();

        list.push(Value::from("step-1"));

        assert_eq!(alias.as_list().map(|l| l.len()), Some(1));
        assert_eq!(value, alias);
    }

    #[test]
    fn test_detached_copy_stops_observing() {
        let list = SharedList::from_vec(vec![Value::from(1)]);
        let detached = list.detached_copy();
        list.push(Value::from(2));

        assert_eq!(detached.len(), 1);
        assert!(!detached.ptr_eq(&list));
    }

    #[test]
    fn test_shared_object_downcast() {
        struct Connection {
            port: u16,
        }
        let value = Value::from(SharedObject::new(Connection { port: 61616 }));
        assert_eq!(value.downcast_ref::<Connection>().map(|c| c.port), Some(61616));
        assert!(value.type_name().ends_with("Connection"));
        assert!(value.is_shared());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from(vec![Value::from(1), Value::from("x")]).to_string(), "[1, x]");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Bytes(b"hi".to_vec()).to_string(), "hi");
    }

    #[test]
    fn test_json_round_trip_of_scalars() {
        let value: Value = serde_json::from_str(r#"[1, "two", true, null, 2.5]"#).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::I64(1),
                Value::from("two"),
                Value::Bool(true),
                Value::Null,
                Value::F64(2.5)
            ])
        );
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"[1,"two",true,null,2.5]"#);
    }
}

//! Two-tier exchange property storage
//!
//! Well-known properties live in a fixed array indexed by
//! [`ExchangePropertyKey`]; everything else goes to a string-keyed map that is
//! only allocated when first needed. Lookups by name check the fixed tier first.

use ahash::AHashMap;
use courier_schema::Value;
use std::fmt;

/// Well-known exchange properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangePropertyKey {
    AggregatedSize,
    BatchComplete,
    BatchIndex,
    BatchSize,
    CorrelationId,
    CreatedTimestamp,
    ErrorHandlerBridge,
    ExceptionCaught,
    FailureEndpoint,
    FailureRouteId,
    MessageHistory,
    OnCompletion,
    SplitComplete,
    SplitIndex,
    SplitSize,
    ToEndpoint,
    UnitOfWorkExhausted,
}

impl ExchangePropertyKey {
    /// Number of well-known keys
    pub const COUNT: usize = 17;

    pub const ALL: [ExchangePropertyKey; Self::COUNT] = [
        ExchangePropertyKey::AggregatedSize,
        ExchangePropertyKey::BatchComplete,
        ExchangePropertyKey::BatchIndex,
        ExchangePropertyKey::BatchSize,
        ExchangePropertyKey::CorrelationId,
        ExchangePropertyKey::CreatedTimestamp,
        ExchangePropertyKey::ErrorHandlerBridge,
        ExchangePropertyKey::ExceptionCaught,
        ExchangePropertyKey::FailureEndpoint,
        ExchangePropertyKey::FailureRouteId,
        ExchangePropertyKey::MessageHistory,
        ExchangePropertyKey::OnCompletion,
        ExchangePropertyKey::SplitComplete,
        ExchangePropertyKey::SplitIndex,
        ExchangePropertyKey::SplitSize,
        ExchangePropertyKey::ToEndpoint,
        ExchangePropertyKey::UnitOfWorkExhausted,
    ];

    /// Property name as seen through the string API
    pub fn name(&self) -> &'static str {
        match self {
            ExchangePropertyKey::AggregatedSize => "CourierAggregatedSize",
            ExchangePropertyKey::BatchComplete => "CourierBatchComplete",
            ExchangePropertyKey::BatchIndex => "CourierBatchIndex",
            ExchangePropertyKey::BatchSize => "CourierBatchSize",
            ExchangePropertyKey::CorrelationId => "CourierCorrelationId",
            ExchangePropertyKey::CreatedTimestamp => "CourierCreatedTimestamp",
            ExchangePropertyKey::ErrorHandlerBridge => "CourierErrorHandlerBridge",
            ExchangePropertyKey::ExceptionCaught => "CourierExceptionCaught",
            ExchangePropertyKey::FailureEndpoint => "CourierFailureEndpoint",
            ExchangePropertyKey::FailureRouteId => "CourierFailureRouteId",
            ExchangePropertyKey::MessageHistory => "CourierMessageHistory",
            ExchangePropertyKey::OnCompletion => "CourierOnCompletion",
            ExchangePropertyKey::SplitComplete => "CourierSplitComplete",
            ExchangePropertyKey::SplitIndex => "CourierSplitIndex",
            ExchangePropertyKey::SplitSize => "CourierSplitSize",
            ExchangePropertyKey::ToEndpoint => "CourierToEndpoint",
            ExchangePropertyKey::UnitOfWorkExhausted => "CourierUnitOfWorkExhausted",
        }
    }

    /// Resolve a well-known key from its name
    pub fn from_name(name: &str) -> Option<Self> {
        if !name.starts_with("Courier") {
            return None;
        }
        Self::ALL.iter().copied().find(|key| key.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ExchangePropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Exchange properties
#[derive(Debug, Clone, Default)]
pub struct Properties {
    known: [Option<Value>; ExchangePropertyKey::COUNT],
    custom: Option<AHashMap<String, Value>>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a well-known property
    pub fn get_key(&self, key: ExchangePropertyKey) -> Option<&Value> {
        self.known[key.index()].as_ref()
    }

    /// Set a well-known property, returning the previous value
    pub fn set_key(&mut self, key: ExchangePropertyKey, value: impl Into<Value>) -> Option<Value> {
        self.known[key.index()].replace(value.into())
    }

    pub fn remove_key(&mut self, key: ExchangePropertyKey) -> Option<Value> {
        self.known[key.index()].take()
    }

    /// Get a property by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        match ExchangePropertyKey::from_name(name) {
            Some(key) => self.get_key(key),
            None => self.custom.as_ref().and_then(|custom| custom.get(name)),
        }
    }

    /// Set a property by name; well-known names go to the fixed tier
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let name = name.into();
        match ExchangePropertyKey::from_name(&name) {
            Some(key) => self.set_key(key, value),
            None => self
                .custom
                .get_or_insert_with(AHashMap::new)
                .insert(name, value.into()),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        match ExchangePropertyKey::from_name(name) {
            Some(key) => self.remove_key(key),
            None => self.custom.as_mut().and_then(|custom| custom.remove(name)),
        }
    }

    /// Remove every custom property whose name matches, returning how many went
    pub fn remove_matching<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        match self.custom.as_mut() {
            Some(custom) => {
                let before = custom.len();
                custom.retain(|name, _| !predicate(name));
                before - custom.len()
            }
            None => 0,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether any custom property is set
    pub fn has_custom(&self) -> bool {
        self.custom.as_ref().is_some_and(|custom| !custom.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_custom() && self.known.iter().all(Option::is_none)
    }

    pub fn len(&self) -> usize {
        self.known.iter().filter(|v| v.is_some()).count()
            + self.custom.as_ref().map_or(0, |custom| custom.len())
    }

    /// All properties by name, well-known ones first
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        let known = ExchangePropertyKey::ALL
            .iter()
            .zip(self.known.iter())
            .filter_map(|(key, value)| value.as_ref().map(|v| (key.name(), v)));
        let custom = self
            .custom
            .iter()
            .flat_map(|custom| custom.iter().map(|(k, v)| (k.as_str(), v)));
        known.chain(custom)
    }

    /// Copy every property from `other`, overwriting ones with the same name
    pub fn put_all(&mut self, other: &Properties) {
        let history = ExchangePropertyKey::MessageHistory.index();
        for (index, (slot, value)) in self.known.iter_mut().zip(other.known.iter()).enumerate() {
            match value {
                Some(Value::List(list)) if index == history => {
                    *slot = Some(Value::List(list.detached_copy()));
                }
                Some(value) => *slot = Some(value.clone()),
                None => {}
            }
        }
        if let Some(custom) = &other.custom {
            let target = self.custom.get_or_insert_with(AHashMap::new);
            for (k, v) in custom {
                target.insert(k.clone(), v.clone());
            }
        }
    }

    /// Copy for a new exchange
    ///
    /// Values are cloned as usual, except the message history list which gets
    /// its own storage so later appends on either side stay invisible to the other.
    pub fn safe_copy(&self) -> Properties {
        let mut copy = self.clone();
        let slot = ExchangePropertyKey::MessageHistory.index();
        if let Some(Value::List(list)) = &self.known[slot] {
            copy.known[slot] = Some(Value::List(list.detached_copy()));
        }
        copy
    }

    pub fn clear(&mut self) {
        self.known = Default::default();
        self.custom = None;
    }
}

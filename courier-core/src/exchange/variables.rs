//! Variables and variable repositories
//!
//! A variable name may address a repository with a `repo-id:name` prefix.
//! `header:` and `exchange:` prefixes are reserved and stay plain names on the
//! exchange itself.

use ahash::AHashMap;
use courier_schema::Value;
use parking_lot::RwLock;
use std::fmt;

/// Repository id of the context-wide variables
pub const GLOBAL_REPOSITORY: &str = "global";

/// Repository id of the per-route variables
pub const ROUTE_REPOSITORY: &str = "route";

/// Named store of variables shared beyond a single exchange
pub trait VariableRepository: Send + Sync {
    fn id(&self) -> &str;

    fn get_variable(&self, name: &str) -> Option<Value>;

    fn set_variable(&self, name: &str, value: Value);

    fn remove_variable(&self, name: &str) -> Option<Value>;

    fn has_variables(&self) -> bool {
        self.size() > 0
    }

    fn size(&self) -> usize;

    fn names(&self) -> Vec<String>;
}

/// In-memory variable repository
pub struct InMemoryVariableRepository {
    id: String,
    variables: RwLock<AHashMap<String, Value>>,
}

impl InMemoryVariableRepository {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            variables: RwLock::new(AHashMap::new()),
        }
    }
}

impl VariableRepository for InMemoryVariableRepository {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    fn set_variable(&self, name: &str, value: Value) {
        self.variables.write().insert(name.to_string(), value);
    }

    fn remove_variable(&self, name: &str) -> Option<Value> {
        self.variables.write().remove(name)
    }

    fn size(&self) -> usize {
        self.variables.read().len()
    }

    fn names(&self) -> Vec<String> {
        self.variables.read().keys().cloned().collect()
    }
}

impl fmt::Debug for InMemoryVariableRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryVariableRepository")
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}

/// Parsed variable name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableAddress<'a> {
    /// Stored on the exchange under the full name
    Local(&'a str),
    /// Stored in the named repository
    Repository { id: &'a str, name: &'a str },
}

/// Split a variable name into its repository address
pub fn parse_variable_name(name: &str) -> VariableAddress<'_> {
    match name.split_once(':') {
        Some((id, rest)) if id != "header" && id != "exchange" => {
            VariableAddress::Repository { id, name: rest }
        }
        _ => VariableAddress::Local(name),
    }
}

//! Case-insensitive header storage
//!
//! Headers keep insertion order and the casing of the first insert. Lookups
//! ignore ASCII case, so `Content-Type` and `content-type` are the same header.

use courier_schema::Value;
use serde::ser::SerializeMap;
use smallvec::SmallVec;

/// Insertion-ordered, case-insensitive header map
///
/// Most messages carry a handful of headers, so entries live inline in a
/// `SmallVec` and lookups are linear scans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: SmallVec<[(String, Value); 8]>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Get a header value
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|i| &self.entries[i].1)
    }

    /// Get a mutable header value
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        match self.position(name) {
            Some(i) => Some(&mut self.entries[i].1),
            None => None,
        }
    }

    /// Insert or replace a header, returning the previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Remove a header
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    /// Remove every header whose name matches the predicate, returning how many went
    pub fn remove_matching<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|(key, _)| !predicate(key));
        before - self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        headers.extend(iter);
        headers
    }
}

impl<K, V> Extend<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<Value>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl serde::Serialize for Headers {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");

        assert_eq!(headers.get("content-type"), Some(&Value::from("text/plain")));
        assert!(headers.contains("CONTENT-TYPE"));
    }

    #[test]
    fn test_replace_keeps_first_casing() {
        let mut headers = Headers::new();
        headers.insert("Foo", 1);
        let previous = headers.insert("FOO", 2);

        assert_eq!(previous, Some(Value::from(1)));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.keys().collect::<Vec<_>>(), vec!["Foo"]);
        assert_eq!(headers.get("foo"), Some(&Value::from(2)));
    }

    #[test]
    fn test_insertion_order_and_remove() {
        let mut headers: Headers = [("a", 1), ("b", 2), ("c", 3)].into_iter().collect();
        assert_eq!(headers.remove("B"), Some(Value::from(2)));
        assert_eq!(headers.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_remove_matching() {
        let mut headers: Headers = [("Courier-Trace", "1"), ("courier-span", "2"), ("user", "x")]
            .into_iter()
            .collect();
        let removed = headers.remove_matching(|k| k.to_ascii_lowercase().starts_with("courier-"));
        assert_eq!(removed, 2);
        assert_eq!(headers.len(), 1);
    }
}

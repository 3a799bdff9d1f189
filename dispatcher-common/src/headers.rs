//! A case-insensitive, duplicate-key-preserving header multimap.
//!
//! `http::HeaderMap`/`reqwest::header::HeaderMap` are not directly
//! JSON-serializable and normalize repeated headers in ways that make
//! round-tripping the `Response`/`Request` envelopes awkward. `HeaderMultiMap`
//! is the wire/storage representation; conversion to the transport crate's
//! `HeaderMap` happens only at the `HTTPClientPool` boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeaderMultiMap(Vec<(String, String)>);

impl HeaderMultiMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Set a header, replacing any existing values for the same name (case-insensitive).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, case-insensitive, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn merge(&mut self, other: &HeaderMultiMap) {
        for (k, v) in other.iter() {
            self.insert(k.to_owned(), v.to_owned());
        }
    }
}

impl fmt::Display for HeaderMultiMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (k, v) in self.iter() {
            writeln!(f, "{k}: {v}")?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for HeaderMultiMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Error converting a `HeaderMultiMap` into a transport-level `reqwest::header::HeaderMap`.
#[derive(thiserror::Error, Debug)]
#[error("invalid header name or value: {0}")]
pub struct HeaderConversionError(pub String);

impl TryFrom<&HeaderMultiMap> for reqwest::header::HeaderMap {
    type Error = HeaderConversionError;

    fn try_from(value: &HeaderMultiMap) -> Result<Self, Self::Error> {
        let mut map = reqwest::header::HeaderMap::new();
        for (k, v) in value.iter() {
            let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| HeaderConversionError(e.to_string()))?;
            let value = reqwest::header::HeaderValue::from_str(v)
                .map_err(|e| HeaderConversionError(e.to_string()))?;
            map.append(name, value);
        }
        Ok(map)
    }
}

impl From<&reqwest::header::HeaderMap> for HeaderMultiMap {
    fn from(value: &reqwest::header::HeaderMap) -> Self {
        let mut map = HeaderMultiMap::new();
        for (name, value) in value.iter() {
            if let Ok(v) = value.to_str() {
                map.insert(name.as_str().to_owned(), v.to_owned());
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut map = HeaderMultiMap::new();
        map.insert("Content-Type", "application/json");
        assert_eq!(map.get("content-type"), Some("application/json"));
    }

    #[test]
    fn preserves_duplicates() {
        let mut map = HeaderMultiMap::new();
        map.insert("Set-Cookie", "a=1");
        map.insert("set-cookie", "b=2");
        assert_eq!(map.get_all("Set-Cookie").collect::<Vec<_>>(), vec!["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_all_prior_values() {
        let mut map = HeaderMultiMap::new();
        map.insert("X-Foo", "1");
        map.insert("x-foo", "2");
        map.set("X-FOO", "3");
        assert_eq!(map.get_all("x-foo").collect::<Vec<_>>(), vec!["3"]);
    }
}

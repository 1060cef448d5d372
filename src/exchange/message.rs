//! Message structure carried by exchanges: ordered, case-insensitively keyed
//! headers plus an opaque JSON body.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Insertion-ordered header map with case-insensitive lookup.
///
/// Header names keep the casing they were first set with; lookups and
/// replacements match names ignoring ASCII case. Iteration yields headers in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, Value)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a header value, ignoring ASCII case of the name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Set a header. Replaces an existing value in place (preserving the
    /// original position and casing of the name) or appends a new entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some((_, v)) => *v = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Remove a header, returning its value if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of header names to JSON values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut headers = Headers::new();
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    headers.set(name, value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

/// A single message: headers plus an opaque JSON body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub headers: Headers,
    pub body: Value,
}

impl Message {
    /// Create a message with the given body and no headers.
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Builder-style header attachment.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.set(name, value);
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }
}

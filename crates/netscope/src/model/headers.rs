//! Ordered, case-insensitive header multimap.

use crate::error::ConversionError;
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Headers in insertion order. Names keep the case they were stored with and
/// compare case-insensitively on lookup. Values are raw bytes, since HTTP
/// allows opaque (non UTF-8) header values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Builder-style [`append`](Self::append).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.append(name, value);
        self
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.get_all(name).next()
    }

    /// First value for `name` if it is valid UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_all<'a: 'n, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a [u8]> + 'n {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every value for `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Multimap equality: same values per name (names compared
    /// case-insensitively, values in order), ignoring how different names
    /// interleave. This is the equality `http::HeaderMap` can preserve.
    pub fn same_entries(&self, other: &Headers) -> bool {
        self.grouped() == other.grouped()
    }

    fn grouped(&self) -> BTreeMap<String, Vec<&[u8]>> {
        let mut groups: BTreeMap<String, Vec<&[u8]>> = BTreeMap::new();
        for (name, value) in &self.entries {
            groups
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.as_slice());
        }
        groups
    }

    pub fn from_header_map(map: &HeaderMap) -> Self {
        let entries = map
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        Self { entries }
    }

    pub fn to_header_map(&self) -> Result<HeaderMap, ConversionError> {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConversionError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let header_value =
                HeaderValue::from_bytes(value).map_err(|e| ConversionError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            map.append(header_name, header_value);
        }
        Ok(map)
    }
}

impl<N: Into<String>, V: Into<Vec<u8>>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

/// Serialized as `[[name, value], ...]`; values are rendered lossily as text
/// for the inspection layer.
impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            seq.serialize_element(&(name, String::from_utf8_lossy(value)))?;
        }
        seq.end()
    }
}

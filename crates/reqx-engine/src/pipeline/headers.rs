//! Ordered header list and the header rewrite operations.
//!
//! Names are matched exactly for rewrites, the same way the host's header
//! object keys behave. CORS lookups use [`Headers::get_ignore_case`].

use crate::config::{HeaderMod, HeaderModOperation, HeaderModification, HeaderOperation, HeaderTarget};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Headers(Vec<HeaderEntry>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn get_ignore_case(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn contains_ignore_case(&self, name: &str) -> bool {
        self.get_ignore_case(name).is_some()
    }

    /// Overwrite in place, or add at the end.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|h| h.name == name) {
            Some(entry) => entry.value = value.to_string(),
            None => self.push(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| h.name != name);
    }

    /// Join onto an existing non-empty value with `", "`, else set.
    pub fn append(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|h| h.name == name) {
            Some(entry) if !entry.value.is_empty() => {
                entry.value = format!("{}, {}", entry.value, value);
            }
            Some(entry) => entry.value = value.to_string(),
            None => self.push(name, value),
        }
    }

    /// Add without looking for an existing entry.
    pub fn push(&mut self, name: &str, value: &str) {
        self.0.push(HeaderEntry {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    pub fn extend(&mut self, other: Headers) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.0.iter()
    }

    /// Name → value map for log entries. Later duplicates win.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| HeaderEntry {
                    name: name.into(),
                    value: value.into(),
                })
                .collect(),
        )
    }
}

/// Apply a header-override rule's modifications in declaration order.
///
/// Only enabled modifications targeting the request are applied; response
/// targets cannot be enforced at the request stage.
pub fn apply_override_modifications(headers: &mut Headers, modifications: &[HeaderModification]) {
    for modification in modifications {
        if !modification.enabled || modification.target != HeaderTarget::Request {
            continue;
        }
        match modification.operation {
            HeaderOperation::Set => headers.set(&modification.name, &modification.value),
            HeaderOperation::Remove => headers.remove(&modification.name),
            HeaderOperation::Append => headers.append(&modification.name, &modification.value),
        }
    }
}

/// Apply an intercept rule's own `set`/`remove` header mods.
pub fn apply_header_mods(headers: &mut Headers, mods: &[HeaderMod]) {
    for header_mod in mods {
        match header_mod.operation {
            HeaderModOperation::Set => headers.set(&header_mod.header, &header_mod.value),
            HeaderModOperation::Remove => headers.remove(&header_mod.header),
        }
    }
}

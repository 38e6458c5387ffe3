//! # Destination Tags
//!
//! Routing identifiers naming the receiver role(s) that should consume a
//! published item. Tags are plain strings on the wire so that the envelope
//! format does not depend on any particular handler type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a receiver role
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationTag(String);

impl DestinationTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DestinationTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DestinationTag {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

impl From<String> for DestinationTag {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

/// Ordered, de-duplicated set of destination tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<DestinationTag>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tag, returning false if it was already present
    pub fn insert(&mut self, tag: impl Into<DestinationTag>) -> bool {
        self.0.insert(tag.into())
    }

    pub fn contains(&self, tag: &DestinationTag) -> bool {
        self.0.contains(tag)
    }

    /// True when at least one tag appears in both sets
    pub fn intersects(&self, other: &TagSet) -> bool {
        // iterate the smaller set
        let (small, large) = if self.0.len() <= other.0.len() {
            (&self.0, &other.0)
        } else {
            (&other.0, &self.0)
        };
        small.iter().any(|tag| large.contains(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DestinationTag> {
        self.0.iter()
    }
}

impl<T: Into<DestinationTag>> FromIterator<T> for TagSet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for TagSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<&str> = self.0.iter().map(DestinationTag::as_str).collect();
        write!(f, "{{{}}}", tags.join(", "))
    }
}

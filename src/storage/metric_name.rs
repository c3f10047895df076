//! Metric names and their binary wire format
//!
//! A metric name is the metric group plus an ordered set of tags; the
//! marshaled form is the canonical series key used by storage and the
//! query driver.

use std::fmt;

use crate::error::EncodingError;
use crate::storage::encoding::{read_bytes, read_uvarint, write_bytes, write_uvarint};

/// One `key=value` label.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    /// Label name.
    pub key: String,
    /// Label value.
    pub value: String,
}

/// A fully qualified series identity: metric group plus tags.
///
/// Tags are kept sorted by key in the marshaled form so equal tag sets
/// produce equal series keys regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricName {
    /// The metric group, e.g. `node_cpu_seconds_total`.
    pub metric_group: String,

    /// Labels attached to the series.
    pub tags: Vec<Tag>,
}

impl MetricName {
    /// Create a metric name with no tags.
    pub fn new(metric_group: impl Into<String>) -> Self {
        Self {
            metric_group: metric_group.into(),
            tags: Vec::new(),
        }
    }

    /// Clear the name in place, keeping allocations.
    pub fn reset(&mut self) {
        self.metric_group.clear();
        self.tags.clear();
    }

    /// Append a tag.
    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.push(Tag {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Sort tags by key. Marshaling calls this implicitly via
    /// [`MetricName::sorted`]; mutation paths that bypass it must sort
    /// before comparing marshaled keys.
    pub fn sort_tags(&mut self) {
        self.tags.sort();
    }

    /// Look up a tag value. The empty key addresses the metric group.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        if key.is_empty() {
            if self.metric_group.is_empty() {
                return None;
            }
            return Some(&self.metric_group);
        }
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    /// A copy with tags sorted by key.
    pub fn sorted(&self) -> MetricName {
        let mut mn = self.clone();
        mn.sort_tags();
        mn
    }

    /// Append the wire form: length-prefixed group, tag count, then
    /// length-prefixed key/value pairs.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        write_bytes(dst, self.metric_group.as_bytes());
        write_uvarint(dst, self.tags.len() as u64);
        for tag in &self.tags {
            write_bytes(dst, tag.key.as_bytes());
            write_bytes(dst, tag.value.as_bytes());
        }
    }

    /// The wire form as an owned buffer.
    pub fn marshaled(&self) -> Vec<u8> {
        let mut dst = Vec::new();
        self.marshal(&mut dst);
        dst
    }

    /// Parse the wire form produced by [`MetricName::marshal`],
    /// replacing the current contents.
    pub fn unmarshal(&mut self, src: &[u8]) -> Result<(), EncodingError> {
        self.reset();
        let (group, mut pos) = read_bytes(src)?;
        self.metric_group = str_from_utf8(group)?;
        let (tag_count, n) = read_uvarint(&src[pos..])?;
        pos += n;
        for _ in 0..tag_count {
            let (key, n) = read_bytes(&src[pos..])?;
            pos += n;
            let (value, n) = read_bytes(&src[pos..])?;
            pos += n;
            self.tags.push(Tag {
                key: str_from_utf8(key)?,
                value: str_from_utf8(value)?,
            });
        }
        if pos != src.len() {
            return Err(EncodingError::TrailingBytes(src.len() - pos));
        }
        Ok(())
    }
}

fn str_from_utf8(b: &[u8]) -> Result<String, EncodingError> {
    std::str::from_utf8(b)
        .map(str::to_string)
        .map_err(|_| EncodingError::InvalidUtf8)
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.metric_group)?;
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={:?}", tag.key, tag.value)?;
        }
        write!(f, "}}")
    }
}

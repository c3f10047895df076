//! Compiled tag filters
//!
//! `setup_tfss` turns the wire-level filter groups of a search query
//! into compiled matchers. The outer list is OR; each group is AND.
//! Regex filters match the full tag value, mirroring the usual
//! `=~`/`!~` selector semantics.

use regex::Regex;

use crate::error::QueryError;
use crate::storage::metric_name::MetricName;
use crate::types::TagFilterSpec;

#[derive(Debug)]
enum TagMatcher {
    Literal(String),
    Regex(Regex),
}

impl TagMatcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            TagMatcher::Literal(want) => want == value,
            TagMatcher::Regex(re) => re.is_match(value),
        }
    }
}

#[derive(Debug)]
struct CompiledTagFilter {
    key: String,
    matcher: TagMatcher,
    negative: bool,
}

impl CompiledTagFilter {
    fn compile(spec: &TagFilterSpec) -> Result<Self, QueryError> {
        let matcher = if spec.is_regexp {
            let anchored = format!("^(?:{})$", spec.value);
            let re = Regex::new(&anchored)
                .map_err(|e| QueryError::FilterParse(format!("{}: {}", spec, e)))?;
            TagMatcher::Regex(re)
        } else {
            TagMatcher::Literal(spec.value.clone())
        };
        Ok(Self {
            key: spec.key.clone(),
            matcher,
            negative: spec.is_negative,
        })
    }

    fn matches(&self, mn: &MetricName) -> bool {
        // A missing tag behaves as the empty value, so negative filters
        // select series lacking the tag.
        let value = mn.tag_value(&self.key).unwrap_or("");
        self.matcher.matches(value) != self.negative
    }
}

/// One AND-group of compiled tag filters.
#[derive(Debug)]
pub struct TagFilters {
    filters: Vec<CompiledTagFilter>,
}

impl TagFilters {
    /// Whether the metric name satisfies every filter in the group.
    pub fn matches(&self, mn: &MetricName) -> bool {
        self.filters.iter().all(|f| f.matches(mn))
    }
}

/// Compile wire-level filter groups into matchers.
///
/// An invalid regex in any filter fails the whole query.
pub fn setup_tfss(tag_filterss: &[Vec<TagFilterSpec>]) -> Result<Vec<TagFilters>, QueryError> {
    let mut tfss = Vec::with_capacity(tag_filterss.len());
    for tag_filters in tag_filterss {
        let mut filters = Vec::with_capacity(tag_filters.len());
        for spec in tag_filters {
            filters.push(CompiledTagFilter::compile(spec)?);
        }
        tfss.push(TagFilters { filters });
    }
    Ok(tfss)
}

/// Whether any compiled group matches the metric name.
///
/// An empty group list matches everything.
pub fn matches_any(tfss: &[TagFilters], mn: &MetricName) -> bool {
    tfss.is_empty() || tfss.iter().any(|tfs| tfs.matches(mn))
}

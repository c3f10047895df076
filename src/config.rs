//! Process-wide configuration for the select data-plane
//!
//! Limits mirror the flags a deployment would expose: caps on label
//! discovery responses and on the number of unique series a single
//! search may scan.

use serde::{Deserialize, Serialize};

/// Search limits applied by the engine.
///
/// All limits default to values suitable for a mid-size deployment and
/// can be deserialized from a config file section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// Maximum number of label names returned from label discovery.
    #[serde(default = "default_max_tag_keys")]
    pub max_tag_keys: usize,

    /// Maximum number of values returned per label.
    #[serde(default = "default_max_tag_values")]
    pub max_tag_values: usize,

    /// Maximum number of tag value suffixes returned per lookup.
    #[serde(default = "default_max_tag_value_suffixes")]
    pub max_tag_value_suffixes: usize,

    /// Maximum number of unique time series a single search may scan.
    /// Breaching this cap is a storage-level error.
    #[serde(default = "default_max_unique_timeseries")]
    pub max_unique_timeseries: usize,
}

fn default_max_tag_keys() -> usize {
    100_000
}

fn default_max_tag_values() -> usize {
    100_000
}

fn default_max_tag_value_suffixes() -> usize {
    100_000
}

fn default_max_unique_timeseries() -> usize {
    300_000
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_tag_keys: default_max_tag_keys(),
            max_tag_values: default_max_tag_values(),
            max_tag_value_suffixes: default_max_tag_value_suffixes(),
            max_unique_timeseries: default_max_unique_timeseries(),
        }
    }
}

impl SearchConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tag_keys == 0 {
            return Err("max_tag_keys must be > 0".to_string());
        }
        if self.max_tag_values == 0 {
            return Err("max_tag_values must be > 0".to_string());
        }
        if self.max_tag_value_suffixes == 0 {
            return Err("max_tag_value_suffixes must be > 0".to_string());
        }
        if self.max_unique_timeseries == 0 {
            return Err("max_unique_timeseries must be > 0".to_string());
        }
        Ok(())
    }
}

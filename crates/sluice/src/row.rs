//! Input rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One timestamped event: string dimensions plus numeric metric fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRow {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl InputRow {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            dimensions: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Metric value by field name; missing fields read as zero.
    pub fn metric(&self, field: &str) -> f64 {
        self.metrics.get(field).copied().unwrap_or(0.0)
    }
}

//! Data source schema: dimensions, aggregators, rollup granularity, partitioning.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::{BTreeMap, HashSet};

use crate::error::ConfigError;
use crate::row::InputRow;
use crate::time::QueryGranularity;
use sluice_core::error::{DuplicateAggregatorSnafu, EmptyDataSourceSnafu, NoAggregatorsSnafu};

/// Aggregation applied to rows that roll up onto the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatorSpec {
    Count { name: String },
    LongSum { name: String, field_name: String },
    DoubleSum { name: String, field_name: String },
    Min { name: String, field_name: String },
    Max { name: String, field_name: String },
}

impl AggregatorSpec {
    /// Output column name.
    pub fn name(&self) -> &str {
        match self {
            AggregatorSpec::Count { name }
            | AggregatorSpec::LongSum { name, .. }
            | AggregatorSpec::DoubleSum { name, .. }
            | AggregatorSpec::Min { name, .. }
            | AggregatorSpec::Max { name, .. } => name,
        }
    }

    /// Accumulator value before any row is folded in.
    pub fn initial(&self) -> f64 {
        match self {
            AggregatorSpec::Count { .. }
            | AggregatorSpec::LongSum { .. }
            | AggregatorSpec::DoubleSum { .. } => 0.0,
            AggregatorSpec::Min { .. } => f64::INFINITY,
            AggregatorSpec::Max { .. } => f64::NEG_INFINITY,
        }
    }

    /// Fold one input row into an accumulator.
    pub fn fold(&self, acc: f64, row: &InputRow) -> f64 {
        match self {
            AggregatorSpec::Count { .. } => acc + 1.0,
            AggregatorSpec::LongSum { field_name, .. } => acc + row.metric(field_name).trunc(),
            AggregatorSpec::DoubleSum { field_name, .. } => acc + row.metric(field_name),
            AggregatorSpec::Min { field_name, .. } => acc.min(row.metric(field_name)),
            AggregatorSpec::Max { field_name, .. } => acc.max(row.metric(field_name)),
        }
    }

    /// Combine two partial aggregates, as when merging chunks.
    pub fn combine(&self, a: f64, b: f64) -> f64 {
        match self {
            AggregatorSpec::Count { .. }
            | AggregatorSpec::LongSum { .. }
            | AggregatorSpec::DoubleSum { .. } => a + b,
            AggregatorSpec::Min { .. } => a.min(b),
            AggregatorSpec::Max { .. } => a.max(b),
        }
    }
}

/// How segments for the same interval are partitioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShardSpec {
    #[default]
    None,
    Linear { partition_num: u32 },
}

impl ShardSpec {
    pub fn partition_num(&self) -> u32 {
        match self {
            ShardSpec::None => 0,
            ShardSpec::Linear { partition_num } => *partition_num,
        }
    }
}

/// Immutable description of one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schema {
    pub data_source: String,
    /// Dimensions to keep. Empty keeps every dimension a row carries.
    #[serde(default)]
    pub dimensions: Vec<String>,
    pub aggregators: Vec<AggregatorSpec>,
    #[serde(default)]
    pub query_granularity: QueryGranularity,
    #[serde(default)]
    pub shard_spec: ShardSpec,
}

impl Schema {
    pub fn new(data_source: impl Into<String>, aggregators: Vec<AggregatorSpec>) -> Self {
        Self {
            data_source: data_source.into(),
            dimensions: Vec::new(),
            aggregators,
            query_granularity: QueryGranularity::None,
            shard_spec: ShardSpec::None,
        }
    }

    pub fn with_dimensions(mut self, dimensions: Vec<String>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_query_granularity(mut self, granularity: QueryGranularity) -> Self {
        self.query_granularity = granularity;
        self
    }

    pub fn with_shard_spec(mut self, shard_spec: ShardSpec) -> Self {
        self.shard_spec = shard_spec;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.data_source.trim().is_empty(), EmptyDataSourceSnafu);
        ensure!(
            !self.aggregators.is_empty(),
            NoAggregatorsSnafu {
                data_source: self.data_source.clone(),
            }
        );

        let mut seen = HashSet::new();
        for aggregator in &self.aggregators {
            ensure!(
                seen.insert(aggregator.name()),
                DuplicateAggregatorSnafu {
                    name: aggregator.name().to_string(),
                }
            );
        }
        Ok(())
    }

    /// The row's dimension values this schema keeps.
    pub fn dimension_values(&self, row: &InputRow) -> BTreeMap<String, String> {
        if self.dimensions.is_empty() {
            return row.dimensions.clone();
        }
        self.dimensions
            .iter()
            .filter_map(|dim| row.dimensions.get(dim).map(|v| (dim.clone(), v.clone())))
            .collect()
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.aggregators.iter().map(|a| a.name().to_string()).collect()
    }
}

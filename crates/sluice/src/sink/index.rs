//! In-memory rollup index.
//!
//! Rows are keyed by (truncated timestamp, kept dimension values). Rows sharing a key are
//! folded into one set of aggregates, so the index's length counts rolled-up rows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::row::InputRow;
use crate::schema::Schema;

type RollupKey = (i64, BTreeMap<String, String>);

/// One rolled-up row as it is persisted in chunk and merged files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolledUpRow {
    /// Epoch milliseconds after query-granularity truncation.
    pub timestamp: i64,
    pub dimensions: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct InMemoryIndex {
    schema: Arc<Schema>,
    min_timestamp: i64,
    rows: BTreeMap<RollupKey, Vec<f64>>,
}

impl InMemoryIndex {
    pub fn new(schema: Arc<Schema>, min_timestamp: i64) -> Self {
        Self {
            schema,
            min_timestamp,
            rows: BTreeMap::new(),
        }
    }

    /// Fold a row in and return the number of rolled-up rows.
    pub fn add(&mut self, row: &InputRow) -> usize {
        let timestamp = self
            .schema
            .query_granularity
            .truncate(row.timestamp.timestamp_millis())
            .max(self.min_timestamp);
        let key = (timestamp, self.schema.dimension_values(row));

        let aggregators = &self.schema.aggregators;
        let values = self
            .rows
            .entry(key)
            .or_insert_with(|| aggregators.iter().map(|a| a.initial()).collect());
        for (value, aggregator) in values.iter_mut().zip(aggregators) {
            *value = aggregator.fold(*value, row);
        }

        self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Copy of the current rows in key order.
    pub fn snapshot(&self) -> Vec<RolledUpRow> {
        self.rows
            .iter()
            .map(|(key, values)| self.to_row(key.clone(), values))
            .collect()
    }

    /// Consume the index into rows in key order.
    pub fn into_rows(self) -> Vec<RolledUpRow> {
        self.rows
            .iter()
            .map(|(key, values)| self.to_row(key.clone(), values))
            .collect()
    }

    fn to_row(&self, (timestamp, dimensions): RollupKey, values: &[f64]) -> RolledUpRow {
        let metrics = self
            .schema
            .aggregators
            .iter()
            .zip(values)
            .map(|(a, v)| (a.name().to_string(), *v))
            .collect();
        RolledUpRow {
            timestamp,
            dimensions,
            metrics,
        }
    }
}

/// Merge already rolled-up rows, combining rows with equal keys. Output is in key order.
pub fn merge_rows<'a>(
    schema: &Schema,
    parts: impl IntoIterator<Item = &'a [RolledUpRow]>,
) -> Vec<RolledUpRow> {
    let mut merged: BTreeMap<RollupKey, BTreeMap<String, f64>> = BTreeMap::new();

    for row in parts.into_iter().flatten() {
        let key = (row.timestamp, row.dimensions.clone());
        match merged.get_mut(&key) {
            Some(existing) => {
                for aggregator in &schema.aggregators {
                    let name = aggregator.name();
                    let incoming = row.metrics.get(name).copied();
                    let current = existing.get(name).copied();
                    let combined = match (current, incoming) {
                        (Some(a), Some(b)) => aggregator.combine(a, b),
                        (Some(a), None) => a,
                        (None, Some(b)) => b,
                        (None, None) => continue,
                    };
                    existing.insert(name.to_string(), combined);
                }
            }
            None => {
                merged.insert(key, row.metrics.clone());
            }
        }
    }

    merged
        .into_iter()
        .map(|((timestamp, dimensions), metrics)| RolledUpRow {
            timestamp,
            dimensions,
            metrics,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AggregatorSpec;
    use crate::time::{QueryGranularity, parse_timestamp};

    fn schema(granularity: QueryGranularity) -> Arc<Schema> {
        Arc::new(
            Schema::new(
                "wikipedia",
                vec![
                    AggregatorSpec::Count {
                        name: "rows".into(),
                    },
                    AggregatorSpec::DoubleSum {
                        name: "added".into(),
                        field_name: "added".into(),
                    },
                    AggregatorSpec::Max {
                        name: "peak".into(),
                        field_name: "added".into(),
                    },
                ],
            )
            .with_query_granularity(granularity),
        )
    }

    fn row(ts: &str, page: &str, added: f64) -> InputRow {
        InputRow::new(parse_timestamp(ts).unwrap())
            .with_dimension("page", page)
            .with_metric("added", added)
    }

    #[test]
    fn test_rollup_combines_equal_keys() {
        let mut index = InMemoryIndex::new(schema(QueryGranularity::Minute), 0);
        assert_eq!(index.add(&row("2013-01-01T00:00:05Z", "Rust", 1.0)), 1);
        assert_eq!(index.add(&row("2013-01-01T00:00:40Z", "Rust", 3.0)), 1);
        assert_eq!(index.add(&row("2013-01-01T00:00:40Z", "Go", 2.0)), 2);

        let rows = index.into_rows();
        let rust = rows.iter().find(|r| r.dimensions["page"] == "Rust").unwrap();
        assert_eq!(rust.metrics["rows"], 2.0);
        assert_eq!(rust.metrics["added"], 4.0);
        assert_eq!(rust.metrics["peak"], 3.0);
    }

    #[test]
    fn test_no_rollup_without_truncation() {
        let mut index = InMemoryIndex::new(schema(QueryGranularity::None), 0);
        index.add(&row("2013-01-01T00:00:05Z", "Rust", 1.0));
        index.add(&row("2013-01-01T00:00:06Z", "Rust", 1.0));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_all_granularity_clamps_to_bucket_start() {
        let start = parse_timestamp("2013-01-01T00:00:00Z")
            .unwrap()
            .timestamp_millis();
        let mut index = InMemoryIndex::new(schema(QueryGranularity::All), start);
        index.add(&row("2013-01-01T00:10:00Z", "Rust", 1.0));
        index.add(&row("2013-01-01T00:50:00Z", "Rust", 1.0));
        let rows = index.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, start);
    }

    #[test]
    fn test_merge_rows_across_chunks() {
        let s = schema(QueryGranularity::Minute);
        let mut first = InMemoryIndex::new(s.clone(), 0);
        first.add(&row("2013-01-01T00:00:05Z", "Rust", 1.0));
        let mut second = InMemoryIndex::new(s.clone(), 0);
        second.add(&row("2013-01-01T00:00:55Z", "Rust", 5.0));
        second.add(&row("2013-01-01T00:01:00Z", "Rust", 2.0));

        let a = first.into_rows();
        let b = second.into_rows();
        let merged = merge_rows(&s, [a.as_slice(), b.as_slice()]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].metrics["rows"], 2.0);
        assert_eq!(merged[0].metrics["added"], 6.0);
        assert_eq!(merged[0].metrics["peak"], 5.0);
        assert_eq!(merged[1].metrics["rows"], 1.0);
    }
}

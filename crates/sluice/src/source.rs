//! NDJSON row source.
//!
//! Each line is one JSON object with a `timestamp` field (RFC 3339 string or epoch millis).
//! Strings and booleans become dimensions; numbers become metrics unless the schema lists the
//! field as a dimension.

use serde_json::{Map, Value};
use snafu::prelude::*;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sluice_core::emit;
use sluice_core::metrics::events::RowsUnparseable;

use crate::error::{PlumberSnafu, ReadSnafu, SourceError};
use crate::plumber::{AddOutcome, PlumberMetrics, RealtimePlumber};
use crate::row::InputRow;
use crate::schema::Schema;
use crate::time::parse_timestamp;

const TIMESTAMP_FIELD: &str = "timestamp";

/// Counts for one run of [`run_source`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSummary {
    pub lines: u64,
    pub added: u64,
    pub rejected: u64,
    pub unparseable: u64,
}

fn parse_error(message: impl Into<String>) -> SourceError {
    SourceError::Parse {
        message: message.into(),
    }
}

/// Turn one NDJSON line into a row.
pub fn parse_row(line: &str, schema: &Schema) -> Result<InputRow, SourceError> {
    let value: Value = serde_json::from_str(line).map_err(|e| parse_error(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(parse_error("expected a JSON object"));
    };

    let timestamp = match fields.remove(TIMESTAMP_FIELD) {
        Some(Value::String(raw)) => {
            parse_timestamp(&raw).map_err(|e| parse_error(format!("bad timestamp {raw:?}: {e}")))?
        }
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .ok_or_else(|| parse_error(format!("bad timestamp {n}")))?,
        Some(other) => return Err(parse_error(format!("bad timestamp {other}"))),
        None => return Err(parse_error("missing timestamp")),
    };

    Ok(fill_row(InputRow::new(timestamp), fields, schema))
}

fn fill_row(mut row: InputRow, fields: Map<String, Value>, schema: &Schema) -> InputRow {
    for (name, value) in fields {
        let forced_dimension = schema.dimensions.contains(&name);
        match value {
            Value::Null => {}
            Value::Number(n) if !forced_dimension => {
                if let Some(v) = n.as_f64() {
                    row.metrics.insert(name, v);
                }
            }
            Value::String(s) => {
                row.dimensions.insert(name, s);
            }
            other => {
                row.dimensions.insert(name, other.to_string());
            }
        }
    }
    row
}

/// Feed every line of `reader` to `plumber` until EOF or cancellation.
///
/// Unparseable lines are counted and skipped. A plumber error (for example the plumber
/// stopped) ends the run.
pub async fn run_source<R>(
    reader: R,
    plumber: &RealtimePlumber,
    metrics: &PlumberMetrics,
    cancel: CancellationToken,
) -> Result<SourceSummary, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    let schema = plumber.schema().clone();
    let mut lines = reader.lines();
    let mut summary = SourceSummary::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context(ReadSnafu)?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        summary.lines += 1;

        let row = match parse_row(&line, &schema) {
            Ok(row) => row,
            Err(e) => {
                summary.unparseable += 1;
                metrics.record_unparseable(1);
                emit!(RowsUnparseable {
                    count: 1,
                    target: schema.data_source.clone(),
                });
                debug!(line = summary.lines, error = %e, "Skipping unparseable row");
                continue;
            }
        };

        match plumber.add(&row).context(PlumberSnafu)? {
            AddOutcome::Added { .. } => summary.added += 1,
            AddOutcome::Rejected(_) => summary.rejected += 1,
        }
    }

    info!(
        target = %schema.data_source,
        lines = summary.lines,
        added = summary.added,
        rejected = summary.rejected,
        unparseable = summary.unparseable,
        "Row source finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AggregatorSpec;

    fn schema() -> Schema {
        Schema::new(
            "wikipedia",
            vec![AggregatorSpec::Count {
                name: "rows".into(),
            }],
        )
        .with_dimensions(vec!["page".into(), "namespace_id".into()])
    }

    #[test]
    fn test_parse_rfc3339_row() {
        let row = parse_row(
            r#"{"timestamp":"2013-01-01T00:10:00Z","page":"Rust","added":12,"robot":false,"gone":null}"#,
            &schema(),
        )
        .unwrap();
        assert_eq!(row.timestamp, parse_timestamp("2013-01-01T00:10:00Z").unwrap());
        assert_eq!(row.dimensions["page"], "Rust");
        assert_eq!(row.dimensions["robot"], "false");
        assert_eq!(row.metrics["added"], 12.0);
        assert!(!row.dimensions.contains_key("gone"));
    }

    #[test]
    fn test_parse_millis_and_numeric_dimension() {
        let row = parse_row(r#"{"timestamp":1356998400000,"namespace_id":4}"#, &schema()).unwrap();
        assert_eq!(row.timestamp, parse_timestamp("2013-01-01T00:00:00Z").unwrap());
        assert_eq!(row.dimensions["namespace_id"], "4");
        assert!(row.metrics.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        for line in [
            "not json",
            "[1,2]",
            r#"{"page":"x"}"#,
            r#"{"timestamp":"yesterday"}"#,
            r#"{"timestamp":true}"#,
        ] {
            assert!(
                matches!(parse_row(line, &schema()), Err(SourceError::Parse { .. })),
                "{line} should not parse"
            );
        }
    }
}

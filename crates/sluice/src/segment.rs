//! Segment descriptors and identity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::schema::{Schema, ShardSpec};
use crate::time::{Interval, format_timestamp};

/// Descriptor of an immutable segment, also used as the identity template of a live sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSegment {
    pub data_source: String,
    pub interval: Interval,
    pub version: String,
    /// Where deep storage put the files. Empty until pushed.
    #[serde(default)]
    pub load_spec: BTreeMap<String, String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub shard_spec: ShardSpec,
    /// Bytes of the merged index.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub num_rows: u64,
}

impl DataSegment {
    /// Descriptor for a bucket that has not been merged yet.
    pub fn template(schema: &Schema, interval: Interval, version: impl Into<String>) -> Self {
        Self {
            data_source: schema.data_source.clone(),
            interval,
            version: version.into(),
            load_spec: BTreeMap::new(),
            dimensions: schema.dimensions.clone(),
            metrics: schema.metric_names(),
            shard_spec: schema.shard_spec,
            size: 0,
            num_rows: 0,
        }
    }

    pub fn partition_num(&self) -> u32 {
        self.shard_spec.partition_num()
    }

    pub fn identifier(&self) -> SegmentId {
        SegmentId::new(
            &self.data_source,
            &self.interval,
            &self.version,
            self.partition_num(),
        )
    }
}

/// `dataSource_start_end_version[_partition]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new(data_source: &str, interval: &Interval, version: &str, partition: u32) -> Self {
        let mut id = format!(
            "{}_{}_{}_{}",
            data_source,
            format_timestamp(interval.start()),
            format_timestamp(interval.end()),
            version
        );
        if partition > 0 {
            id.push_str(&format!("_{partition}"));
        }
        SegmentId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

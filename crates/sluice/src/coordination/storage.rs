//! Collaborators backed by a [`StorageProvider`]: deep storage and the metadata store.

use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use super::{SegmentPublisher, SegmentPusher};
use crate::error::{CoordinationError, DescriptorSnafu, LocalReadSnafu, StorageSnafu};
use crate::segment::DataSegment;
use crate::time::format_timestamp;
use sluice_core::StorageProviderRef;

/// Copies merged segment files to `{data_source}/{start}_{end}/{version}/{partition}/`.
///
/// A retry for the same version overwrites the same keys.
#[derive(Debug, Clone)]
pub struct StorageSegmentPusher {
    storage: StorageProviderRef,
}

impl StorageSegmentPusher {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    fn prefix(segment: &DataSegment) -> String {
        format!(
            "{}/{}_{}/{}/{}",
            segment.data_source,
            format_timestamp(segment.interval.start()),
            format_timestamp(segment.interval.end()),
            segment.version,
            segment.partition_num()
        )
    }
}

#[async_trait]
impl SegmentPusher for StorageSegmentPusher {
    async fn push(
        &self,
        dir: &Path,
        segment: &DataSegment,
    ) -> Result<DataSegment, CoordinationError> {
        let prefix = Self::prefix(segment);
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .context(LocalReadSnafu { path: dir })?;

        let mut bytes_pushed = 0u64;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(LocalReadSnafu { path: dir })?
        {
            let path = entry.path();
            let is_file = entry
                .file_type()
                .await
                .context(LocalReadSnafu { path: &path })?
                .is_file();
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_file || name.ends_with(".tmp") {
                continue;
            }

            let contents = tokio::fs::read(&path)
                .await
                .context(LocalReadSnafu { path: &path })?;
            bytes_pushed += contents.len() as u64;
            let key = ObjectPath::from(format!("{prefix}/{name}"));
            self.storage
                .put(&key, contents)
                .await
                .context(StorageSnafu)?;
            debug!(key = %key, "Pushed segment file");
        }

        let mut pushed = segment.clone();
        pushed.load_spec = BTreeMap::from([
            ("type".to_string(), "object_store".to_string()),
            ("url".to_string(), self.storage.url().to_string()),
            ("path".to_string(), prefix),
        ]);

        info!(
            target = %segment.data_source,
            segment = %segment.identifier(),
            bytes = bytes_pushed,
            "Pushed segment to deep storage"
        );
        Ok(pushed)
    }
}

/// Writes one JSON descriptor per segment at `{data_source}/{segment_id}.json`.
#[derive(Debug, Clone)]
pub struct StorageSegmentPublisher {
    storage: StorageProviderRef,
}

impl StorageSegmentPublisher {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    /// Every descriptor published for `data_source`.
    pub async fn published_segments(
        &self,
        data_source: &str,
    ) -> Result<Vec<DataSegment>, CoordinationError> {
        let paths = self
            .storage
            .list(Some(&ObjectPath::from(data_source)))
            .await
            .context(StorageSnafu)?;

        let mut segments = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = self.storage.get(&path).await.context(StorageSnafu)?;
            segments.push(serde_json::from_slice(&bytes).context(DescriptorSnafu)?);
        }
        Ok(segments)
    }
}

#[async_trait]
impl SegmentPublisher for StorageSegmentPublisher {
    async fn publish_segment(&self, segment: &DataSegment) -> Result<(), CoordinationError> {
        let path = ObjectPath::from(format!(
            "{}/{}.json",
            segment.data_source,
            segment.identifier()
        ));
        let body = serde_json::to_vec_pretty(segment).context(DescriptorSnafu)?;
        self.storage.put(&path, body).await.context(StorageSnafu)?;
        info!(segment = %segment.identifier(), "Published segment");
        Ok(())
    }
}

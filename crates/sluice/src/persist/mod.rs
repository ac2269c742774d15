//! Local durable storage for sinks.
//!
//! ## Directory Structure
//!
//! ```text
//! {base}/{data_source}/{start}_{end}_{version}_{partition}/
//! ├── sink.json           # identity, including the version
//! ├── chunks/00000.json   # one file per persisted chunk, creation order
//! ├── merged/
//! │   ├── index.json      # merged rows
//! │   └── descriptor.json # written last; its presence marks the merge complete
//! └── handoff.json        # pushed descriptor; present => awaiting handoff
//! ```
//!
//! Every file is written to a `.tmp` sibling, fsynced, then renamed into place, so a crash
//! leaves either the old file or the new one.

use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{CorruptSnafu, IoSnafu, PersistError, SerializeSnafu};
use crate::segment::DataSegment;
use crate::sink::{Chunk, RolledUpRow};

const SINK_FILE: &str = "sink.json";
const CHUNKS_DIR: &str = "chunks";
const MERGED_DIR: &str = "merged";
const INDEX_FILE: &str = "index.json";
const DESCRIPTOR_FILE: &str = "descriptor.json";
const HANDOFF_FILE: &str = "handoff.json";

/// A sink read back from disk on startup.
#[derive(Debug)]
pub struct RecoveredSink {
    pub segment: DataSegment,
    pub chunks: Vec<(u32, Vec<RolledUpRow>)>,
    pub pushed: Option<DataSegment>,
}

/// Output of the merge step, ready to hand to a pusher.
#[derive(Debug, Clone)]
pub struct MergedSegment {
    pub dir: PathBuf,
    pub descriptor: DataSegment,
}

/// Reads and writes the per-bucket directories of one data source.
#[derive(Debug, Clone)]
pub struct LocalSinkStore {
    base: PathBuf,
    data_source: String,
}

impl LocalSinkStore {
    pub fn new(base: impl Into<PathBuf>, data_source: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            data_source: data_source.into(),
        }
    }

    pub fn data_source_dir(&self) -> PathBuf {
        self.base.join(&self.data_source)
    }

    pub fn sink_dir(&self, segment: &DataSegment) -> PathBuf {
        let name = format!(
            "{}_{}_{}",
            segment.interval.to_string().replace('/', "_"),
            segment.version.replace('/', "_"),
            segment.partition_num()
        );
        self.data_source_dir().join(name)
    }

    /// Write `sink.json` unless it already exists.
    pub async fn ensure_sink(&self, segment: &DataSegment) -> Result<(), PersistError> {
        let path = self.sink_dir(segment).join(SINK_FILE);
        if exists(&path).await? {
            return Ok(());
        }
        write_json(&path, segment).await?;
        debug!(path = %path.display(), "Created sink directory");
        Ok(())
    }

    /// Persist one chunk. Returns the bytes written.
    pub async fn write_chunk(
        &self,
        segment: &DataSegment,
        chunk: &Chunk,
    ) -> Result<u64, PersistError> {
        self.ensure_sink(segment).await?;
        let path = self
            .sink_dir(segment)
            .join(CHUNKS_DIR)
            .join(chunk_file_name(chunk.sequence()));
        write_json(&path, chunk.rows()).await
    }

    /// Write the merged segment, or reuse the one a previous attempt already completed.
    pub async fn write_merged(
        &self,
        segment: &DataSegment,
        rows: &[RolledUpRow],
    ) -> Result<MergedSegment, PersistError> {
        let dir = self.sink_dir(segment).join(MERGED_DIR);
        let descriptor_path = dir.join(DESCRIPTOR_FILE);

        if let Some(descriptor) = read_json::<DataSegment>(&descriptor_path).await? {
            info!(path = %dir.display(), "Reusing existing merged segment");
            return Ok(MergedSegment { dir, descriptor });
        }

        let size = write_json(&dir.join(INDEX_FILE), rows).await?;

        let mut descriptor = segment.clone();
        descriptor.size = size;
        descriptor.num_rows = rows.len() as u64;
        if descriptor.dimensions.is_empty() {
            let seen: BTreeSet<&String> = rows.iter().flat_map(|r| r.dimensions.keys()).collect();
            descriptor.dimensions = seen.into_iter().cloned().collect();
        }
        write_json(&descriptor_path, &descriptor).await?;

        Ok(MergedSegment { dir, descriptor })
    }

    /// Record that `pushed` reached deep storage and the metadata store.
    pub async fn mark_pushed(&self, pushed: &DataSegment) -> Result<(), PersistError> {
        let path = self.sink_dir(pushed).join(HANDOFF_FILE);
        write_json(&path, pushed).await?;
        Ok(())
    }

    /// Delete a sink's directory. Missing directories are not an error.
    pub async fn remove_sink(&self, segment: &DataSegment) -> Result<(), PersistError> {
        let dir = self.sink_dir(segment);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistError::Io { path: dir, source }),
        }
    }

    /// Read every sink directory for this data source.
    ///
    /// Directories without `sink.json` never received a chunk and are skipped.
    pub async fn recover(&self) -> Result<Vec<RecoveredSink>, PersistError> {
        let root = self.data_source_dir();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(PersistError::Io { path: root, source }),
        };

        let mut recovered = Vec::new();
        while let Some(entry) = entries.next_entry().await.context(IoSnafu { path: &root })? {
            let dir = entry.path();
            if !entry.file_type().await.context(IoSnafu { path: &dir })?.is_dir() {
                continue;
            }

            let Some(segment) = read_json::<DataSegment>(&dir.join(SINK_FILE)).await? else {
                warn!(path = %dir.display(), "Skipping sink directory without sink.json");
                continue;
            };
            let chunks = read_chunks(&dir.join(CHUNKS_DIR)).await?;
            let pushed = read_json::<DataSegment>(&dir.join(HANDOFF_FILE)).await?;

            info!(
                target = %segment.data_source,
                interval = %segment.interval,
                version = %segment.version,
                chunks = chunks.len(),
                awaiting_handoff = pushed.is_some(),
                "Recovered sink"
            );
            recovered.push(RecoveredSink {
                segment,
                chunks,
                pushed,
            });
        }

        recovered.sort_by_key(|r| r.segment.interval.start());
        Ok(recovered)
    }
}

fn chunk_file_name(sequence: u32) -> String {
    format!("{sequence:05}.json")
}

async fn read_chunks(dir: &Path) -> Result<Vec<(u32, Vec<RolledUpRow>)>, PersistError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(PersistError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut sequences = Vec::new();
    while let Some(entry) = entries.next_entry().await.context(IoSnafu { path: dir })? {
        let name = entry.file_name();
        let Some(sequence) = name
            .to_str()
            .and_then(|n| n.strip_suffix(".json"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            // leftover .tmp from an interrupted write
            continue;
        };
        sequences.push(sequence);
    }
    sequences.sort_unstable();

    let mut chunks = Vec::with_capacity(sequences.len());
    for sequence in sequences {
        let path = dir.join(chunk_file_name(sequence));
        if let Some(rows) = read_json::<Vec<RolledUpRow>>(&path).await? {
            chunks.push((sequence, rows));
        }
    }
    Ok(chunks)
}

async fn exists(path: &Path) -> Result<bool, PersistError> {
    tokio::fs::try_exists(path).await.context(IoSnafu { path })
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .context(CorruptSnafu { path })
}

/// Serialize `value` and write it atomically. Returns the bytes written.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<u64, PersistError> {
    let bytes = serde_json::to_vec(value).context(SerializeSnafu { path })?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context(IoSnafu { path: parent })?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .context(IoSnafu { path: &tmp_path })?;
    file.write_all(&bytes)
        .await
        .context(IoSnafu { path: &tmp_path })?;
    file.sync_all().await.context(IoSnafu { path: &tmp_path })?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .context(IoSnafu { path })?;

    Ok(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::InputRow;
    use crate::schema::{AggregatorSpec, Schema};
    use crate::sink::Sink;
    use crate::time::{SegmentGranularity, parse_timestamp};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sink() -> Sink {
        let schema = Arc::new(Schema::new(
            "wikipedia",
            vec![AggregatorSpec::Count {
                name: "rows".into(),
            }],
        ));
        let interval =
            SegmentGranularity::Hour.bucket(parse_timestamp("2013-01-01T00:00:00Z").unwrap());
        Sink::new(schema, interval, "2013-01-01T00:00:00.000Z")
    }

    fn add(sink: &Sink, ts: &str, page: &str) {
        sink.add(&InputRow::new(parse_timestamp(ts).unwrap()).with_dimension("page", page))
            .unwrap();
    }

    #[tokio::test]
    async fn test_recover_empty_base() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalSinkStore::new(temp_dir.path(), "wikipedia");
        assert!(store.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunks_round_trip_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalSinkStore::new(temp_dir.path(), "wikipedia");
        let sink = sink();

        for (i, page) in ["a", "b", "c"].iter().enumerate() {
            add(&sink, &format!("2013-01-01T00:0{i}:00Z"), page);
            let chunk = sink.swap().unwrap();
            store.write_chunk(sink.segment(), &chunk).await.unwrap();
        }

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);
        let r = &recovered[0];
        assert_eq!(r.segment.version, "2013-01-01T00:00:00.000Z");
        assert_eq!(
            r.chunks.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(r.chunks[1].1[0].dimensions["page"], "b");
        assert!(r.pushed.is_none());
    }

    #[tokio::test]
    async fn test_tmp_leftovers_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalSinkStore::new(temp_dir.path(), "wikipedia");
        let sink = sink();
        add(&sink, "2013-01-01T00:00:00Z", "a");
        let chunk = sink.swap().unwrap();
        store.write_chunk(sink.segment(), &chunk).await.unwrap();

        let stray = store
            .sink_dir(sink.segment())
            .join(CHUNKS_DIR)
            .join("00001.json.tmp");
        tokio::fs::write(&stray, b"{partial").await.unwrap();

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered[0].chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalSinkStore::new(temp_dir.path(), "wikipedia");
        let sink = sink();
        store.ensure_sink(sink.segment()).await.unwrap();

        let chunks = store.sink_dir(sink.segment()).join(CHUNKS_DIR);
        tokio::fs::create_dir_all(&chunks).await.unwrap();
        tokio::fs::write(chunks.join("00000.json"), b"not json")
            .await
            .unwrap();

        let err = store.recover().await.unwrap_err();
        assert!(matches!(err, PersistError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_merged_is_reused() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalSinkStore::new(temp_dir.path(), "wikipedia");
        let sink = sink();
        add(&sink, "2013-01-01T00:00:00Z", "a");
        sink.finish_writing();
        let chunk = sink.swap().unwrap();
        store.write_chunk(sink.segment(), &chunk).await.unwrap();
        chunk.mark_persisted();

        let rows = sink.merged_immutable().unwrap();
        let first = store.write_merged(sink.segment(), &rows).await.unwrap();
        assert_eq!(first.descriptor.num_rows, 1);
        assert_eq!(first.descriptor.dimensions, vec!["page".to_string()]);
        assert!(first.descriptor.size > 0);

        let second = store.write_merged(sink.segment(), &[]).await.unwrap();
        assert_eq!(second.descriptor, first.descriptor);
    }

    #[tokio::test]
    async fn test_pushed_marker_and_removal() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalSinkStore::new(temp_dir.path(), "wikipedia");
        let sink = sink();
        store.ensure_sink(sink.segment()).await.unwrap();

        let mut pushed = sink.segment().clone();
        pushed
            .load_spec
            .insert("type".to_string(), "local".to_string());
        store.mark_pushed(&pushed).await.unwrap();

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered[0].pushed.as_ref(), Some(&pushed));

        store.remove_sink(sink.segment()).await.unwrap();
        assert!(store.recover().await.unwrap().is_empty());
        // second removal is a no-op
        store.remove_sink(sink.segment()).await.unwrap();
    }
}

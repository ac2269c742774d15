//! Read-only snapshots of a sink for query execution.

use std::sync::Arc;

use super::chunk::Chunk;
use super::index::{RolledUpRow, merge_rows};
use crate::schema::Schema;
use crate::time::Interval;

/// Point-in-time view over a sink's chunks plus a copy of its head.
///
/// Chunks are shared, never copied. A row appended after the view was taken is not visible.
#[derive(Debug, Clone)]
pub struct SinkView {
    interval: Interval,
    version: String,
    chunks: Vec<Arc<Chunk>>,
    head: Vec<RolledUpRow>,
}

impl SinkView {
    pub(crate) fn new(
        interval: Interval,
        version: String,
        chunks: Vec<Arc<Chunk>>,
        head: Vec<RolledUpRow>,
    ) -> Self {
        Self {
            interval,
            version,
            chunks,
            head,
        }
    }

    pub fn interval(&self) -> &Interval {
        &self.interval
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Rolled-up rows across chunks and head, before cross-chunk merging.
    pub fn num_rows(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum::<usize>() + self.head.len()
    }

    /// Rows with equal keys combined across chunks and head.
    pub fn merged_rows(&self, schema: &Schema) -> Vec<RolledUpRow> {
        merge_rows(
            schema,
            self.chunks
                .iter()
                .map(|c| c.rows())
                .chain(std::iter::once(self.head.as_slice())),
        )
    }
}

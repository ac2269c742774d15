//! Immutable chunks produced by swapping a sink's head.

use std::sync::atomic::{AtomicBool, Ordering};

use super::index::RolledUpRow;

/// One persist cycle's worth of rows. The rows never change after the swap; only the
/// persisted flag flips once the chunk file is durable.
#[derive(Debug)]
pub struct Chunk {
    sequence: u32,
    rows: Vec<RolledUpRow>,
    persisted: AtomicBool,
}

impl Chunk {
    pub(crate) fn new(sequence: u32, rows: Vec<RolledUpRow>) -> Self {
        Self {
            sequence,
            rows,
            persisted: AtomicBool::new(false),
        }
    }

    pub(crate) fn recovered(sequence: u32, rows: Vec<RolledUpRow>) -> Self {
        Self {
            sequence,
            rows,
            persisted: AtomicBool::new(true),
        }
    }

    /// Creation order within the sink, also the chunk file name.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn rows(&self) -> &[RolledUpRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_persisted(&self) {
        self.persisted.store(true, Ordering::Release);
    }
}

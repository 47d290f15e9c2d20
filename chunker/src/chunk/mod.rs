use std::fmt;

mod builder;
pub use builder::*;

pub mod strategy;

use crate::file::{FileLike, FileRef};

/// One chunk of a file.
///
/// Describes the byte range `[start, end)` at position `index` within the file partition, together with the hex
/// digest of its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    /// First byte offset, inclusive.
    pub start: u64,
    /// Last byte offset, exclusive.
    pub end: u64,
    /// Zero-based position of the chunk within the file.
    pub index: u64,
    /// Lowercase hex digest of the chunk content.
    pub hash: String,
}

impl ChunkDescriptor {
    /// Chunk length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// The complete and ordered chunk manifest of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub last_modified: u64,
    /// Chunks ordered by ascending index, without any gap.
    pub chunks: Vec<ChunkDescriptor>,
}

impl FileResult {
    pub fn new(file: &dyn FileLike, chunks: Vec<ChunkDescriptor>) -> Self {
        Self {
            name: file.name().to_owned(),
            mime_type: file.mime_type().to_owned(),
            size: file.size(),
            last_modified: file.last_modified(),
            chunks,
        }
    }
}

/// Progress of a file being processed.
#[derive(Clone)]
pub struct ProgressSnapshot {
    pub file: FileRef,
    pub loaded_bytes: u64,
    pub total_bytes: u64,
    /// Loaded bytes percentage, rounded and capped to 100.
    pub percentage: u8,
    /// Index of the last chunk processed.
    pub chunk_index: Option<u64>,
    pub total_chunks: Option<u64>,
    pub processed_chunks: Option<u64>,
}

impl ProgressSnapshot {
    pub fn new(file: FileRef, loaded_bytes: u64) -> Self {
        let total_bytes = file.size();

        Self {
            percentage: percentage(loaded_bytes, total_bytes),
            file,
            loaded_bytes,
            total_bytes,
            chunk_index: None,
            total_chunks: None,
            processed_chunks: None,
        }
    }

    #[inline]
    pub fn with_chunks(self, chunk_index: u64, processed_chunks: u64, total_chunks: u64) -> Self {
        Self {
            chunk_index: Some(chunk_index),
            processed_chunks: Some(processed_chunks),
            total_chunks: Some(total_chunks),
            ..self
        }
    }
}

impl fmt::Debug for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSnapshot")
            .field("file", &self.file.name())
            .field("loaded_bytes", &self.loaded_bytes)
            .field("total_bytes", &self.total_bytes)
            .field("percentage", &self.percentage)
            .field("chunk_index", &self.chunk_index)
            .field("total_chunks", &self.total_chunks)
            .field("processed_chunks", &self.processed_chunks)
            .finish()
    }
}

fn percentage(loaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }

    ((loaded as f64 / total as f64 * 100.0).round() as u64).min(100) as u8
}

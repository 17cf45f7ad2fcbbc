//! Fixed-size chunk planning
//!
//! A file of `file_size` bytes is cut into `ceil(file_size / chunk_size)`
//! chunks; chunk `i` covers `[i * chunk_size, min((i + 1) * chunk_size, file_size))`.
//! An empty file still gets one (empty) chunk so that every manifest lists
//! at least one record.

use veil_core::{VeilError, VeilResult};

/// Upper bound on chunk size; keeps one chunk comfortably in memory per worker.
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Byte range of one chunk within the plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u64,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_chunks: u64,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> VeilResult<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(VeilError::Config(format!(
                "chunk_size must be in 1..={MAX_CHUNK_SIZE}, got {chunk_size}"
            )));
        }
        let total_chunks = file_size.div_ceil(chunk_size).max(1);
        Ok(Self {
            file_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Range of chunk `index`, or `None` past the end.
    pub fn span(&self, index: u64) -> Option<ChunkSpan> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index * self.chunk_size;
        let length = self.chunk_size.min(self.file_size.saturating_sub(offset));
        Some(ChunkSpan {
            index,
            offset,
            length,
        })
    }

    pub fn spans(&self) -> impl Iterator<Item = ChunkSpan> + '_ {
        (0..self.total_chunks).filter_map(move |i| self.span(i))
    }
}

//! Receiver-side chunk reassembly.
//!
//! Chunks are keyed by file name and offset. Duplicates overwrite the same
//! range, arrival order does not matter, and a file is handed over once the
//! stored chunks tile `[0, total_size)` exactly.

use crate::protocol::SnapshotChunk;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Chunks that cannot belong to the declared file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    /// Negative offset or size.
    #[error("chunk for {file} has negative offset {offset} or size {total_size}")]
    NegativeField {
        /// File name.
        file: String,
        /// Offset field.
        offset: i32,
        /// Declared file size.
        total_size: i32,
    },
    /// Chunk extends past the end of the file.
    #[error("chunk at {offset}+{len} exceeds {file} size {total_size}")]
    OutOfBounds {
        /// File name.
        file: String,
        /// Chunk offset.
        offset: usize,
        /// Chunk length.
        len: usize,
        /// Declared file size.
        total_size: usize,
    },
    /// Byte count matched but chunks overlap or leave holes.
    #[error("chunks for {0} do not tile the file")]
    RaggedCoverage(String),
}

/// Progress for one file after a chunk was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyStatus {
    /// Still missing data.
    Partial {
        /// Distinct chunks stored.
        received_chunks: usize,
        /// Expected chunks, estimated from the largest chunk seen.
        total_chunks: usize,
        /// Bytes stored.
        received_bytes: usize,
        /// Declared file size.
        total_size: usize,
    },
    /// The whole file, in offset order. Its partial state has been dropped.
    Complete(Vec<u8>),
}

#[derive(Debug, Clone)]
struct PartialFile {
    total_size: usize,
    chunks: BTreeMap<usize, Vec<u8>>,
    received_bytes: usize,
    largest_chunk: usize,
    last_chunk_at: Instant,
}

impl PartialFile {
    fn new(total_size: usize, now: Instant) -> Self {
        Self {
            total_size,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            largest_chunk: 0,
            last_chunk_at: now,
        }
    }

    fn total_chunks(&self) -> usize {
        if self.largest_chunk == 0 {
            return 1;
        }
        self.total_size.div_ceil(self.largest_chunk).max(1)
    }

    fn tiles(&self) -> bool {
        let mut cursor = 0;
        for (offset, data) in &self.chunks {
            if *offset != cursor {
                return false;
            }
            cursor += data.len();
        }
        cursor == self.total_size
    }
}

/// Partial files by name.
#[derive(Debug, Clone, Default)]
pub struct ChunkAssembler {
    files: HashMap<String, PartialFile>,
}

impl ChunkAssembler {
    /// Empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Files in progress.
    pub fn in_progress(&self) -> usize {
        self.files.len()
    }

    /// Distinct chunks and estimated total for `file`.
    pub fn chunk_counts(&self, file: &str) -> Option<(usize, usize)> {
        self.files
            .get(file)
            .map(|p| (p.chunks.len(), p.total_chunks()))
    }

    /// When the last chunk for `file` arrived.
    pub fn last_chunk_at(&self, file: &str) -> Option<Instant> {
        self.files.get(file).map(|p| p.last_chunk_at)
    }

    /// Forget a partial file.
    pub fn discard(&mut self, file: &str) -> bool {
        self.files.remove(file).is_some()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.files.clear();
    }

    /// Store one chunk.
    ///
    /// A chunk declaring a different total size than the file in progress
    /// restarts that file.
    pub fn accept(
        &mut self,
        chunk: &SnapshotChunk,
        now: Instant,
    ) -> Result<AssemblyStatus, AssemblyError> {
        let (Ok(offset), Ok(total_size)) = (
            usize::try_from(chunk.offset),
            usize::try_from(chunk.total_size),
        ) else {
            return Err(AssemblyError::NegativeField {
                file: chunk.file_name.clone(),
                offset: chunk.offset,
                total_size: chunk.total_size,
            });
        };
        let len = chunk.data.len();
        if offset + len > total_size || (len == 0 && total_size != 0) {
            return Err(AssemblyError::OutOfBounds {
                file: chunk.file_name.clone(),
                offset,
                len,
                total_size,
            });
        }

        let file = self
            .files
            .entry(chunk.file_name.clone())
            .or_insert_with(|| PartialFile::new(total_size, now));
        if file.total_size != total_size {
            warn!(
                "{} changed size from {} to {}; restarting assembly",
                chunk.file_name, file.total_size, total_size
            );
            *file = PartialFile::new(total_size, now);
        }

        if let Some(previous) = file.chunks.insert(offset, chunk.data.clone()) {
            file.received_bytes -= previous.len();
        }
        file.received_bytes += len;
        file.largest_chunk = file.largest_chunk.max(len);
        file.last_chunk_at = now;

        if file.received_bytes < file.total_size {
            return Ok(AssemblyStatus::Partial {
                received_chunks: file.chunks.len(),
                total_chunks: file.total_chunks(),
                received_bytes: file.received_bytes,
                total_size: file.total_size,
            });
        }

        let name = chunk.file_name.clone();
        let Some(file) = self.files.remove(&name) else {
            return Err(AssemblyError::RaggedCoverage(name));
        };
        if !file.tiles() {
            return Err(AssemblyError::RaggedCoverage(name));
        }

        let mut out = Vec::with_capacity(file.total_size);
        for data in file.chunks.into_values() {
            out.extend_from_slice(&data);
        }
        debug!("Assembled {} ({} bytes)", name, out.len());
        Ok(AssemblyStatus::Complete(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: usize, data: &[u8], total: usize) -> SnapshotChunk {
        SnapshotChunk {
            file_name: "colony.sav".to_string(),
            offset: offset as i32,
            total_size: total as i32,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_out_of_order_with_duplicates() {
        let mut asm = ChunkAssembler::new();
        let now = Instant::now();

        let status = asm.accept(&chunk(4, b"efgh", 10), now).expect("ok");
        assert_eq!(
            status,
            AssemblyStatus::Partial {
                received_chunks: 1,
                total_chunks: 3,
                received_bytes: 4,
                total_size: 10
            }
        );
        asm.accept(&chunk(4, b"efgh", 10), now).expect("duplicate ok");
        asm.accept(&chunk(8, b"ij", 10), now).expect("ok");
        assert_eq!(asm.chunk_counts("colony.sav"), Some((2, 3)));

        let done = asm.accept(&chunk(0, b"abcd", 10), now).expect("ok");
        assert_eq!(done, AssemblyStatus::Complete(b"abcdefghij".to_vec()));
        assert_eq!(asm.in_progress(), 0);
    }

    #[test]
    fn test_empty_file_completes_immediately() {
        let mut asm = ChunkAssembler::new();
        let done = asm.accept(&chunk(0, b"", 0), Instant::now()).expect("ok");
        assert_eq!(done, AssemblyStatus::Complete(Vec::new()));
    }

    #[test]
    fn test_size_change_restarts() {
        let mut asm = ChunkAssembler::new();
        let now = Instant::now();
        asm.accept(&chunk(0, b"abcd", 8), now).expect("ok");
        asm.accept(&chunk(4, b"xy", 6), now).expect("restart");
        assert_eq!(asm.chunk_counts("colony.sav"), Some((1, 3)));
        let done = asm.accept(&chunk(0, b"abcd", 6), now).expect("ok");
        assert_eq!(done, AssemblyStatus::Complete(b"abcdxy".to_vec()));
    }

    #[test]
    fn test_bad_chunks_rejected() {
        let mut asm = ChunkAssembler::new();
        let now = Instant::now();
        assert!(matches!(
            asm.accept(&chunk(8, b"abcd", 10), now),
            Err(AssemblyError::OutOfBounds { .. })
        ));
        let mut negative = chunk(0, b"ab", 10);
        negative.offset = -2;
        assert!(matches!(
            asm.accept(&negative, now),
            Err(AssemblyError::NegativeField { .. })
        ));
    }

    #[test]
    fn test_ragged_coverage_detected() {
        let mut asm = ChunkAssembler::new();
        let now = Instant::now();
        asm.accept(&chunk(0, b"abcd", 6), now).expect("ok");
        assert_eq!(
            asm.accept(&chunk(2, b"cd", 6), now),
            Err(AssemblyError::RaggedCoverage("colony.sav".to_string()))
        );
        assert_eq!(asm.in_progress(), 0);
    }
}

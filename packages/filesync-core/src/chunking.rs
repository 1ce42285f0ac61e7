//! File chunking for bounded-size transfer.
//!
//! Files above the chunking threshold are split into checksummed chunks,
//! uploaded through a session, and reassembled server-side. Chunk size is
//! adaptive: the default is used until it would exceed the per-file chunk
//! cap, at which point the size grows (clamped to the min/max bounds) so
//! that no file ever produces more than [`MAX_CHUNKS_PER_FILE`] chunks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Files at or below this size are uploaded directly, without a session.
pub const CHUNK_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Minimum chunk size: 1 MiB.
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// Maximum chunk size: 50 MiB.
pub const MAX_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Hard cap on chunks per file.
pub const MAX_CHUNKS_PER_FILE: u64 = 1000;

/// A contiguous byte range of a file with its own checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    /// Zero-based position within the file.
    pub chunk_index: u32,
    /// Total chunks the file was split into.
    pub total_chunks: u32,
    /// Size of this chunk in bytes.
    pub chunk_size: usize,
    /// The raw chunk bytes.
    pub chunk_data: Vec<u8>,
    /// Hex-encoded SHA-256 of `chunk_data`.
    pub chunk_checksum: String,
    /// True for the final chunk.
    pub is_last_chunk: bool,
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether a file of this size must go through a chunk upload session.
pub fn needs_chunking(file_size: u64) -> bool {
    file_size > CHUNK_THRESHOLD
}

/// Effective chunk size for a file.
///
/// The default is used unless it would exceed the chunk cap; then the size
/// is `ceil(file_size / MAX_CHUNKS_PER_FILE)` clamped to the min/max bounds.
pub fn chunk_size_for(file_size: u64) -> u64 {
    let default_chunks = file_size.div_ceil(DEFAULT_CHUNK_SIZE);
    if default_chunks <= MAX_CHUNKS_PER_FILE {
        return DEFAULT_CHUNK_SIZE;
    }
    file_size
        .div_ceil(MAX_CHUNKS_PER_FILE)
        .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Split file bytes into an ordered list of checksummed chunks.
///
/// Always produces at least one chunk, even for empty input, so that a
/// session's `total_chunks` is never zero.
pub fn split(data: &[u8]) -> Vec<FileChunk> {
    let chunk_size = chunk_size_for(data.len() as u64) as usize;

    if data.is_empty() {
        return vec![FileChunk {
            chunk_index: 0,
            total_chunks: 1,
            chunk_size: 0,
            chunk_data: Vec::new(),
            chunk_checksum: sha256_hex(&[]),
            is_last_chunk: true,
        }];
    }

    let total_chunks = data.len().div_ceil(chunk_size) as u32;
    data.chunks(chunk_size)
        .enumerate()
        .map(|(i, window)| FileChunk {
            chunk_index: i as u32,
            total_chunks,
            chunk_size: window.len(),
            chunk_data: window.to_vec(),
            chunk_checksum: sha256_hex(window),
            is_last_chunk: i as u32 == total_chunks - 1,
        })
        .collect()
}

/// Validate that a chunk set forms a complete, uncorrupted sequence.
///
/// Checks: indices form `[0..total_chunks)` without gaps or duplicates,
/// every chunk agrees on `total_chunks`, every stored checksum matches the
/// recomputed one, and the final chunk carries `is_last_chunk`.
pub fn validate_sequence(chunks: &[FileChunk]) -> Result<()> {
    if chunks.is_empty() {
        return Err(Error::ChunkIntegrity("empty chunk sequence".into()));
    }

    let total = chunks[0].total_chunks;
    if total as usize != chunks.len() {
        return Err(Error::ChunkIntegrity(format!(
            "expected {} chunks, got {}",
            total,
            chunks.len()
        )));
    }

    let mut sorted: Vec<&FileChunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.chunk_index);

    for (i, chunk) in sorted.iter().enumerate() {
        if chunk.total_chunks != total {
            return Err(Error::ChunkIntegrity(format!(
                "chunk {} disagrees on total ({} vs {})",
                chunk.chunk_index, chunk.total_chunks, total
            )));
        }
        if chunk.chunk_index != i as u32 {
            return Err(Error::ChunkIntegrity(format!(
                "missing chunk at index {}, found index {}",
                i, chunk.chunk_index
            )));
        }
        let actual = sha256_hex(&chunk.chunk_data);
        if actual != chunk.chunk_checksum {
            return Err(Error::ChunkIntegrity(format!(
                "chunk {} checksum mismatch: expected {}, got {}",
                chunk.chunk_index, chunk.chunk_checksum, actual
            )));
        }
    }

    let last = sorted[sorted.len() - 1];
    if !last.is_last_chunk {
        return Err(Error::ChunkIntegrity(
            "final chunk is not marked as last".into(),
        ));
    }

    Ok(())
}

/// Validate and concatenate chunks in index order.
///
/// When `expected_size` is known the assembled length is verified against it.
pub fn assemble(chunks: &[FileChunk], expected_size: Option<u64>) -> Result<Vec<u8>> {
    validate_sequence(chunks)?;

    let mut sorted: Vec<&FileChunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.chunk_index);

    let mut assembled = Vec::with_capacity(sorted.iter().map(|c| c.chunk_data.len()).sum());
    for chunk in sorted {
        assembled.extend_from_slice(&chunk.chunk_data);
    }

    if let Some(expected) = expected_size {
        if assembled.len() as u64 != expected {
            return Err(Error::AssemblyFailed(format!(
                "assembled {} bytes, expected {}",
                assembled.len(),
                expected
            )));
        }
    }

    Ok(assembled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_assemble_round_trip() {
        let data: Vec<u8> = (0..11 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        assert!(needs_chunking(data.len() as u64));

        let chunks = split(&data);
        assert_eq!(chunks.len(), 3); // 11 MiB at 5 MiB chunks

        let assembled = assemble(&chunks, Some(data.len() as u64)).unwrap();
        assert_eq!(assembled, data);
    }

    #[test]
    fn test_small_file_is_not_chunked() {
        assert!(!needs_chunking(10 * 1024 * 1024));
        assert!(needs_chunking(10 * 1024 * 1024 + 1));
    }

    #[test]
    fn test_chunk_size_respects_cap() {
        // 5 MiB chunks would produce >1000 chunks for a 6 GiB file, so the
        // size must grow to keep the count at or below the cap.
        let six_gib: u64 = 6 * 1024 * 1024 * 1024;
        let size = chunk_size_for(six_gib);
        assert!(size > DEFAULT_CHUNK_SIZE);
        assert!(size <= MAX_CHUNK_SIZE);
        assert!(six_gib.div_ceil(size) <= MAX_CHUNKS_PER_FILE);
    }

    #[test]
    fn test_chunk_size_default_under_cap() {
        assert_eq!(chunk_size_for(30 * 1024 * 1024), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_last_chunk_flag_and_indices() {
        let data = vec![7u8; (DEFAULT_CHUNK_SIZE * 2 + 100) as usize];
        let chunks = split(&data);

        assert_eq!(chunks.len(), 3);
        assert!(!chunks[0].is_last_chunk);
        assert!(!chunks[1].is_last_chunk);
        assert!(chunks[2].is_last_chunk);
        assert_eq!(chunks[2].chunk_size, 100);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as u32);
            assert_eq!(c.total_chunks, 3);
        }
    }

    #[test]
    fn test_validate_detects_gap() {
        let data = vec![1u8; (DEFAULT_CHUNK_SIZE * 3) as usize];
        let mut chunks = split(&data);
        chunks.remove(1);

        let err = validate_sequence(&chunks).unwrap_err();
        assert!(err.to_string().contains("expected 3 chunks"));
    }

    #[test]
    fn test_validate_detects_corruption() {
        let data = vec![1u8; (DEFAULT_CHUNK_SIZE + 10) as usize];
        let mut chunks = split(&data);
        chunks[0].chunk_data[0] ^= 0xFF;

        let err = validate_sequence(&chunks).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_validate_detects_disagreeing_totals() {
        let data = vec![1u8; (DEFAULT_CHUNK_SIZE * 2) as usize];
        let mut chunks = split(&data);
        chunks[1].total_chunks = 5;

        assert!(validate_sequence(&chunks).is_err());
    }

    #[test]
    fn test_assemble_out_of_order() {
        let data = vec![9u8; (DEFAULT_CHUNK_SIZE * 2 + 1) as usize];
        let mut chunks = split(&data);
        chunks.reverse();

        let assembled = assemble(&chunks, None).unwrap();
        assert_eq!(assembled, data);
    }

    #[test]
    fn test_assemble_size_mismatch() {
        let data = vec![2u8; 64];
        let chunks = split(&data);

        let err = assemble(&chunks, Some(65)).unwrap_err();
        assert!(matches!(err, Error::AssemblyFailed(_)));
    }

    #[test]
    fn test_empty_input_yields_single_empty_chunk() {
        let chunks = split(&[]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_size, 0);
        assert!(chunks[0].is_last_chunk);
        assert_eq!(assemble(&chunks, Some(0)).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_sha256_hex_stable() {
        // Known digest of the empty string.
        assert_eq!(
            sha256_hex(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

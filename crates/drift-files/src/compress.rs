//! Chunk compression.
//!
//! Symmetric zlib compress/decompress applied per chunk. Decompression is
//! bounded so a malformed peer cannot balloon a 1 MiB chunk into an
//! arbitrarily large allocation.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

/// Compression errors
#[derive(Debug, Error)]
pub enum CompressError {
    /// zlib stream error
    #[error("zlib stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// Compression level outside 1..=9
    #[error("invalid compression level {0} (expected 1..=9)")]
    InvalidLevel(u32),

    /// Decompressed output exceeded the allowed bound
    #[error("decompressed output exceeds {limit} bytes")]
    OutputTooLarge {
        /// The configured output bound
        limit: usize,
    },
}

/// Compress a chunk payload at the given zlib level (1..=9)
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, CompressError> {
    if !(1..=9).contains(&level) {
        return Err(CompressError::InvalidLevel(level));
    }

    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 64),
        Compression::new(level),
    );
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress a chunk payload, rejecting output larger than `limit` bytes
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CompressError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();

    // Read one byte past the limit so overflow is detected, not truncated.
    let read = decoder
        .by_ref()
        .take(limit as u64 + 1)
        .read_to_end(&mut out)?;
    if read > limit {
        return Err(CompressError::OutputTooLarge { limit });
    }
    Ok(out)
}

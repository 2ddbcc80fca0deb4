//! # Drift Files
//!
//! Filesystem layer for the Drift transfer service.
//!
//! This crate provides:
//! - Manifest crawling (user-selected paths to a canonical relative-path stream)
//! - Unix permission mapping and executable classification
//! - Chunk compression with bounded output buffers
//! - The wire-level chunk record

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod compress;
pub mod manifest;
pub mod permissions;

pub use chunk::{ChunkRecord, ElementKind, DEFAULT_CHUNK_SIZE};
pub use compress::{compress, decompress, CompressError};
pub use manifest::{Manifest, ManifestBuilder, ManifestEntry, ManifestError};
pub use permissions::{is_executable, UnixMode};

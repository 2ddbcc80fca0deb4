//! Wire-level chunk record.
//!
//! One chunk is produced per manifest entry for directories and symlinks,
//! and one or more per regular file (split at [`DEFAULT_CHUNK_SIZE`]).

use serde::{Deserialize, Serialize};

/// Default chunk size for regular file payloads (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Kind of filesystem element a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementKind {
    /// Regular file (payload carries file bytes)
    File = 1,
    /// Directory (zero-payload marker)
    Directory = 2,
    /// Symbolic link (payload is empty, target carried separately)
    Symlink = 3,
}

impl ElementKind {
    /// True for entries that occupy a single zero-payload chunk
    #[must_use]
    pub fn is_marker(&self) -> bool {
        matches!(self, ElementKind::Directory | ElementKind::Symlink)
    }
}

/// One wire-level unit of a transfer stream
///
/// Chunks for a single transfer are produced and consumed strictly in
/// manifest order; a new relative path signals the start of the next
/// manifest entry on the receiving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Relative path of the element, forward-slash separated UTF-8
    pub relative_path: String,

    /// Element kind
    pub kind: ElementKind,

    /// Raw or compressed payload bytes (empty for markers)
    pub payload: Vec<u8>,

    /// POSIX permission mode, chmod-style decimal (e.g. 644, 755)
    pub mode: u32,

    /// Symlink target, present only for [`ElementKind::Symlink`]
    pub symlink_target: Option<String>,
}

impl ChunkRecord {
    /// Create a zero-payload directory marker chunk
    #[must_use]
    pub fn directory(relative_path: impl Into<String>, mode: u32) -> Self {
        Self {
            relative_path: relative_path.into(),
            kind: ElementKind::Directory,
            payload: Vec::new(),
            mode,
            symlink_target: None,
        }
    }

    /// Create a symlink marker chunk
    #[must_use]
    pub fn symlink(
        relative_path: impl Into<String>,
        target: impl Into<String>,
        mode: u32,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            kind: ElementKind::Symlink,
            payload: Vec::new(),
            mode,
            symlink_target: Some(target.into()),
        }
    }

    /// Create a regular-file chunk carrying one payload block
    #[must_use]
    pub fn file_block(relative_path: impl Into<String>, payload: Vec<u8>, mode: u32) -> Self {
        Self {
            relative_path: relative_path.into(),
            kind: ElementKind::File,
            payload,
            mode,
            symlink_target: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_kinds() {
        assert!(ElementKind::Directory.is_marker());
        assert!(ElementKind::Symlink.is_marker());
        assert!(!ElementKind::File.is_marker());
    }

    #[test]
    fn directory_chunk_has_no_payload() {
        let chunk = ChunkRecord::directory("photos/2024", 755);
        assert_eq!(chunk.kind, ElementKind::Directory);
        assert!(chunk.payload.is_empty());
        assert_eq!(chunk.mode, 755);
    }

    #[test]
    fn symlink_chunk_carries_target() {
        let chunk = ChunkRecord::symlink("bin/latest", "release-1.2", 777);
        assert_eq!(chunk.kind, ElementKind::Symlink);
        assert_eq!(chunk.symlink_target.as_deref(), Some("release-1.2"));
    }
}

//! Manifest crawling.
//!
//! Turns a set of user-selected absolute paths into an ordered, deduplicated
//! list of relative entries rooted at their common ancestor. The output order
//! is a topological order (every directory precedes its contents) and is the
//! exact order the sender replays on the wire.

use crate::chunk::ElementKind;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Maximum recursion depth before a crawl is aborted
pub const MAX_CRAWL_DEPTH: usize = 256;

/// Errors raised while building a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    /// No input paths were given
    #[error("no input paths")]
    EmptyInput,

    /// Inputs do not share a single volume/root
    #[error("input paths span multiple volumes")]
    VolumeMismatch,

    /// Recursion exceeded [`MAX_CRAWL_DEPTH`]
    #[error("crawl depth limit exceeded at {}", .0.display())]
    DepthExceeded(PathBuf),

    /// A path could not be represented as UTF-8 for the wire
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    /// Filesystem error during traversal
    #[error("crawl I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    /// True when the failure is a missing input path
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ManifestError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// One manifest entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Element kind (file, directory, or symlink)
    pub kind: ElementKind,

    /// Path relative to the crawl root, forward-slash separated
    pub relative_path: String,

    /// Absolute path on the sending filesystem
    pub absolute_path: PathBuf,

    /// Final path component
    pub basename: String,

    /// Size in bytes (0 for directories and symlinks)
    pub size: u64,
}

/// A completed crawl: the common root plus the ordered entry list
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Common ancestor all relative paths are rooted at
    pub root: PathBuf,

    /// Entries in wire order
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Total payload bytes across all regular files
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Number of entries
    #[must_use]
    pub fn element_count(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// Builds transfer manifests from user-selected paths
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    include_hidden: bool,
    max_depth: usize,
}

impl ManifestBuilder {
    /// Create a builder with the default depth ceiling
    #[must_use]
    pub fn new(include_hidden: bool) -> Self {
        Self {
            include_hidden,
            max_depth: MAX_CRAWL_DEPTH,
        }
    }

    /// Override the recursion depth ceiling
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Crawl `inputs` into an ordered manifest
    ///
    /// # Errors
    ///
    /// Fails without partial output if the inputs span volumes, a path is
    /// unreadable, or the depth ceiling is exceeded.
    pub fn build(&self, inputs: &[PathBuf]) -> Result<Manifest, ManifestError> {
        if inputs.is_empty() {
            return Err(ManifestError::EmptyInput);
        }

        let root = common_root(inputs)?;

        let mut sorted: Vec<&PathBuf> = inputs.iter().collect();
        sorted.sort();
        sorted.dedup();

        tracing::debug!(
            root = %root.display(),
            inputs = sorted.len(),
            "starting manifest crawl"
        );

        let mut state = CrawlState {
            root: &root,
            emitted: HashSet::new(),
            entries: Vec::new(),
            include_hidden: self.include_hidden,
            max_depth: self.max_depth,
        };

        for input in sorted {
            // Intermediate directories between the root and this input must
            // exist in the stream before the input itself.
            if let Some(parent) = input.parent() {
                state.unwind_to(parent)?;
            }
            state.visit(input, 0)?;
        }

        let entries = state.entries;
        Ok(Manifest { root, entries })
    }
}

struct CrawlState<'a> {
    root: &'a Path,
    emitted: HashSet<String>,
    entries: Vec<ManifestEntry>,
    include_hidden: bool,
    max_depth: usize,
}

impl CrawlState<'_> {
    /// Emit directory entries for every segment between the crawl root and
    /// `dir` that has not been emitted yet, top-down.
    fn unwind_to(&mut self, dir: &Path) -> Result<(), ManifestError> {
        let Ok(rel) = dir.strip_prefix(self.root) else {
            return Ok(());
        };

        let mut cursor = self.root.to_path_buf();
        for segment in rel.components() {
            cursor.push(segment);
            self.emit(ElementKind::Directory, &cursor, 0)?;
        }
        Ok(())
    }

    fn visit(&mut self, path: &Path, depth: usize) -> Result<(), ManifestError> {
        if depth > self.max_depth {
            return Err(ManifestError::DepthExceeded(path.to_path_buf()));
        }

        let meta = std::fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            self.emit(ElementKind::Symlink, path, 0)?;
        } else if meta.is_dir() {
            self.emit(ElementKind::Directory, path, 0)?;
            self.visit_dir(path, depth)?;
        } else {
            self.emit(ElementKind::File, path, meta.len())?;
        }
        Ok(())
    }

    /// Emit the directory's files first, then recurse into subdirectories
    fn visit_dir(&mut self, dir: &Path, depth: usize) -> Result<(), ManifestError> {
        if depth > self.max_depth {
            return Err(ManifestError::DepthExceeded(dir.to_path_buf()));
        }

        let mut files = Vec::new();
        let mut subdirs = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if !self.include_hidden && name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.is_dir() && !meta.file_type().is_symlink() {
                subdirs.push(path);
            } else {
                files.push((path, meta));
            }
        }

        files.sort_by(|(a, _), (b, _)| a.cmp(b));
        subdirs.sort();

        for (path, meta) in files {
            if meta.file_type().is_symlink() {
                self.emit(ElementKind::Symlink, &path, 0)?;
            } else {
                self.emit(ElementKind::File, &path, meta.len())?;
            }
        }
        for path in subdirs {
            self.emit(ElementKind::Directory, &path, 0)?;
            self.visit_dir(&path, depth + 1)?;
        }
        Ok(())
    }

    fn emit(&mut self, kind: ElementKind, path: &Path, size: u64) -> Result<(), ManifestError> {
        let relative_path = wire_relative(self.root, path)?;
        if !self.emitted.insert(relative_path.clone()) {
            return Ok(());
        }

        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.entries.push(ManifestEntry {
            kind,
            relative_path,
            absolute_path: path.to_path_buf(),
            basename,
            size,
        });
        Ok(())
    }
}

/// Longest common path-segment prefix across all inputs
///
/// All inputs must share their first component (the volume/filesystem root);
/// when the prefix coincides with one of the inputs, its parent is used so
/// the input itself gets a non-empty relative path.
fn common_root(inputs: &[PathBuf]) -> Result<PathBuf, ManifestError> {
    let mut iter = inputs.iter();
    let first = iter.next().ok_or(ManifestError::EmptyInput)?;
    let mut prefix: Vec<Component> = first.components().collect();

    for path in iter {
        let components: Vec<Component> = path.components().collect();
        if components.first() != prefix.first() {
            return Err(ManifestError::VolumeMismatch);
        }
        let shared = prefix
            .iter()
            .zip(components.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(shared);
    }

    let mut root: PathBuf = prefix.iter().collect();
    if inputs.iter().any(|p| p.as_path() == root.as_path()) {
        root.pop();
    }
    Ok(root)
}

/// Forward-slash relative path of `path` under `root`, rejecting non-UTF-8
fn wire_relative(root: &Path, path: &Path) -> Result<String, ManifestError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| ManifestError::VolumeMismatch)?;

    let mut out = String::new();
    for component in rel.components() {
        let segment = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| ManifestError::NonUtf8Path(path.to_path_buf()))?;
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    Ok(out)
}

//! Local collaborator interfaces: output-path resolution and storage policy.

use crate::error::{CoreError, Result};
use std::path::{Component, Path, PathBuf};

/// Disk-space and overwrite-policy checker
///
/// Consulted before an incoming transfer is allowed to enter the
/// transferring state.
pub trait StoragePolicy: Send + Sync {
    /// Free bytes available on the volume holding `dir`
    fn available_space(&self, dir: &Path) -> std::io::Result<u64>;

    /// Whether the given existing target paths may be overwritten
    fn confirm_overwrite(&self, paths: &[PathBuf]) -> bool;
}

/// Default policy: `statvfs` free-space probe on Unix, configurable
/// overwrite auto-confirmation
#[derive(Debug, Clone)]
pub struct DefaultStoragePolicy {
    /// Confirm overwrites without asking
    pub auto_confirm_overwrite: bool,
}

impl Default for DefaultStoragePolicy {
    fn default() -> Self {
        Self {
            auto_confirm_overwrite: false,
        }
    }
}

impl StoragePolicy for DefaultStoragePolicy {
    #[cfg(unix)]
    fn available_space(&self, dir: &Path) -> std::io::Result<u64> {
        use std::os::unix::ffi::OsStrExt;

        let path = std::ffi::CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stats) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn available_space(&self, _dir: &Path) -> std::io::Result<u64> {
        Ok(u64::MAX)
    }

    fn confirm_overwrite(&self, _paths: &[PathBuf]) -> bool {
        self.auto_confirm_overwrite
    }
}

/// Resolves a relative manifest path into an absolute filesystem path
pub trait PathResolver: Send + Sync {
    /// Resolve `relative` under the configured output root
    ///
    /// # Errors
    ///
    /// Rejects malformed paths (drive/volume separators, absolute paths,
    /// parent-directory components).
    fn resolve(&self, relative: &str) -> Result<PathBuf>;
}

/// Default resolver rooted at a configured output directory
#[derive(Debug, Clone)]
pub struct OutputRootResolver {
    root: PathBuf,
}

impl OutputRootResolver {
    /// Create a resolver rooted at `root`
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The configured output root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PathResolver for OutputRootResolver {
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        if relative.is_empty() || relative.contains(':') {
            return Err(CoreError::MalformedPath(relative.to_string()));
        }

        let rel = Path::new(relative);
        let mut out = self.root.clone();
        for component in rel.components() {
            match component {
                Component::Normal(segment) => out.push(segment),
                // Anything that can escape or re-root the output directory
                // marks the whole stream as malformed.
                _ => return Err(CoreError::MalformedPath(relative.to_string())),
            }
        }
        Ok(out)
    }
}

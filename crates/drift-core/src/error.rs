//! Error types for the orchestration layer.
//!
//! Errors follow the service's failure taxonomy: transient network failures
//! (retried with backoff, surfaced as UNREACHABLE), protocol/format errors
//! (abort the operation, never retried), policy rejections (terminal but
//! distinct from failure), and local resource errors (abort one transfer
//! without touching the peer connection).

use crate::rpc::RpcError;
use drift_files::{CompressError, ManifestError};
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in service operations
#[derive(Debug, Error)]
pub enum CoreError {
    // ============ Transient network failures ============
    /// An RPC against a peer failed
    #[error("rpc failure: {0}")]
    Rpc(#[from] RpcError),

    /// Registration handshake with a peer failed
    #[error("registration failed: {0}")]
    Registration(Cow<'static, str>),

    /// An operation exceeded its deadline
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    // ============ Protocol / format errors ============
    /// Manifest crawl failed
    #[error("crawl failed: {0}")]
    Crawl(#[from] ManifestError),

    /// Chunk compression or decompression failed
    #[error("chunk codec failure: {0}")]
    Compress(#[from] CompressError),

    /// A relative path received on the wire is malformed
    #[error("malformed relative path: {0:?}")]
    MalformedPath(String),

    /// An operation was attempted in the wrong state
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Policy rejections ============
    /// The output volume does not hold enough free space
    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientSpace {
        /// Bytes the transfer requires
        required: u64,
        /// Bytes currently free
        available: u64,
    },

    /// The transfer was declined by policy or by the user
    #[error("transfer declined: {0}")]
    Declined(Cow<'static, str>),

    // ============ Local resource errors ============
    /// Local filesystem error
    #[error("file I/O error: {0}")]
    Io(String),

    /// A background task could not be joined
    #[error("task join error: {0}")]
    TaskJoin(Cow<'static, str>),

    /// Channel send/receive failure between workers
    #[error("channel error: {0}")]
    Channel(Cow<'static, str>),
}

impl CoreError {
    /// True if the failure is transient and retried with backoff
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Rpc(_)
                | CoreError::Registration(_)
                | CoreError::Timeout(_)
                | CoreError::Channel(_)
        )
    }

    /// True if the failure aborts its operation and is never retried
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CoreError::Crawl(_)
                | CoreError::Compress(_)
                | CoreError::MalformedPath(_)
                | CoreError::InvalidState(_)
        )
    }

    /// True for policy rejections (terminal, distinct from failure)
    #[must_use]
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            CoreError::InsufficientSpace { .. } | CoreError::Declined(_)
        )
    }

    /// Create a registration error with static context
    #[must_use]
    pub const fn registration(context: &'static str) -> Self {
        CoreError::Registration(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        CoreError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid-state error with static context
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        CoreError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a channel error with static context
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        CoreError::Channel(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

/// Result type for service operations
pub type Result<T> = std::result::Result<T, CoreError>;

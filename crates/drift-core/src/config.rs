//! Service configuration.

use drift_files::manifest::MAX_CRAWL_DEPTH;
use drift_files::{UnixMode, DEFAULT_CHUNK_SIZE};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level service configuration
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Peer connection handling
    pub connection: ConnectionConfig,

    /// Transfer streaming and policy
    pub transfer: TransferConfig,

    /// Manifest crawling
    pub crawl: CrawlConfig,
}

/// Connection handler timing and retry configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Keepalive interval while a peer is online
    pub ping_interval: Duration,

    /// Ping interval while awaiting duplex confirmation
    pub duplex_ping_interval: Duration,

    /// Consecutive duplex-probe failures before the channel is rebuilt
    pub duplex_max_failures: u32,

    /// Generation-1 registration attempts per setup cycle
    pub v1_registration_attempts: u32,

    /// Timeout applied to each generation-1 registration attempt
    pub v1_registration_timeout: Duration,

    /// Backoff between generation-1 setup cycles
    pub v1_retry_backoff: Duration,

    /// Backoff between generation-2 setup cycles
    pub v2_retry_backoff: Duration,

    /// Deadline for the generation-2 duplex-wait RPC
    pub duplex_wait_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            duplex_ping_interval: Duration::from_secs(1),
            duplex_max_failures: 10,
            v1_registration_attempts: 3,
            v1_registration_timeout: Duration::from_secs(1),
            v1_retry_backoff: Duration::from_secs(30),
            v2_retry_backoff: Duration::from_secs(10),
            duplex_wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Transfer streaming configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Directory incoming transfers are materialized under
    pub output_dir: PathBuf,

    /// Fixed block size for regular-file chunks
    pub chunk_size: usize,

    /// Compress chunk payloads
    pub compress: bool,

    /// zlib compression level (1..=9)
    pub compression_level: u32,

    /// Minimum wall-clock time between progress notifications
    pub progress_interval: Duration,

    /// Grace period between stream completion and finalization, absorbing a
    /// concurrent stop request
    pub finalize_grace: Duration,

    /// Require confirmation before overwriting existing target paths
    pub require_overwrite_confirmation: bool,

    /// Effective mode for regular files
    pub file_mode: UnixMode,

    /// Effective mode for executable files
    pub executable_mode: UnixMode,

    /// Effective mode for directories
    pub directory_mode: UnixMode,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir().join("drift-inbox"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            compress: true,
            compression_level: 6,
            progress_interval: Duration::from_millis(250),
            finalize_grace: Duration::from_secs(1),
            require_overwrite_confirmation: true,
            file_mode: UnixMode::FILE_DEFAULT,
            executable_mode: UnixMode::EXEC_DEFAULT,
            directory_mode: UnixMode::EXEC_DEFAULT,
        }
    }
}

/// Manifest crawl configuration
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Include dot-prefixed entries when crawling directories
    pub include_hidden: bool,

    /// Recursion depth ceiling
    pub max_depth: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            include_hidden: false,
            max_depth: MAX_CRAWL_DEPTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_timings() {
        let config = ConnectionConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.duplex_ping_interval, Duration::from_secs(1));
        assert_eq!(config.duplex_max_failures, 10);
        assert_eq!(config.v1_registration_attempts, 3);
        assert_eq!(config.v1_retry_backoff, Duration::from_secs(30));
        assert_eq!(config.v2_retry_backoff, Duration::from_secs(10));
        assert_eq!(config.duplex_wait_timeout, Duration::from_secs(10));
    }

    #[test]
    fn transfer_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.progress_interval, Duration::from_millis(250));
        assert_eq!(config.finalize_grace, Duration::from_secs(1));
        assert_eq!(config.file_mode, UnixMode::FILE_DEFAULT);
        assert_eq!(config.directory_mode, UnixMode::EXEC_DEFAULT);
    }
}

//! Configuration system for the Drift CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use drift_core::{ConnectionConfig, CrawlConfig, LocalIdentity, ServiceConfig, TransferConfig};
use drift_files::UnixMode;

/// Drift configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity announced to peers
    pub identity: IdentityConfig,
    /// Transfer behaviour
    pub transfer: TransferSection,
    /// Connection timing
    pub connection: ConnectionSection,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Display name served to peers
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Hostname override (system hostname when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Transfer port announced over discovery
    #[serde(default = "default_port")]
    pub port: u16,
    /// Certificate bootstrap port announced over discovery
    #[serde(default = "default_auth_port")]
    pub auth_port: u16,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Directory incoming transfers land in
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Compress chunk payloads
    #[serde(default = "default_true")]
    pub compress: bool,
    /// zlib compression level (1-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// Include dot-prefixed entries when crawling
    #[serde(default)]
    pub include_hidden: bool,
    /// Overwrite existing files without asking
    #[serde(default)]
    pub auto_confirm_overwrite: bool,
    /// chmod-style mode for received regular files
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
    /// chmod-style mode for received executables and directories
    #[serde(default = "default_exec_mode")]
    pub executable_mode: u32,
}

/// Connection timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// Keepalive interval in seconds while a peer is online
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Backoff in seconds between failed connection cycles
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_display_name() -> String {
    "Drift User".to_string()
}

fn default_port() -> u16 {
    42000
}

fn default_auth_port() -> u16 {
    42001
}

fn default_output_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("drift")
}

fn default_chunk_size() -> usize {
    drift_files::DEFAULT_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> u32 {
    6
}

fn default_file_mode() -> u32 {
    644
}

fn default_exec_mode() -> u32 {
    755
}

fn default_ping_interval() -> u64 {
    20
}

fn default_retry_backoff() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            hostname: None,
            port: default_port(),
            auth_port: default_auth_port(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            chunk_size: default_chunk_size(),
            compress: true,
            compression_level: default_compression_level(),
            include_hidden: false,
            auto_confirm_overwrite: false,
            file_mode: default_file_mode(),
            executable_mode: default_exec_mode(),
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("drift/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > 16 * 1024 * 1024 {
            anyhow::bail!("Chunk size must be between 1 and 16MB");
        }
        if !(1..=9).contains(&self.transfer.compression_level) {
            anyhow::bail!(
                "Invalid compression level: {}. Must be 1-9",
                self.transfer.compression_level
            );
        }
        for (name, mode) in [
            ("file_mode", self.transfer.file_mode),
            ("executable_mode", self.transfer.executable_mode),
        ] {
            if UnixMode::from_chmod(mode).is_none() {
                anyhow::bail!("Invalid {name}: {mode}. Use chmod-style decimal, e.g. 644");
            }
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        if self.identity.port == self.identity.auth_port {
            anyhow::bail!("Transfer port and auth port must differ");
        }
        Ok(())
    }

    /// Build the service configuration this file describes
    #[must_use]
    pub fn service_config(&self) -> ServiceConfig {
        let file_mode = UnixMode::from_chmod(self.transfer.file_mode)
            .unwrap_or(UnixMode::FILE_DEFAULT);
        let exec_mode = UnixMode::from_chmod(self.transfer.executable_mode)
            .unwrap_or(UnixMode::EXEC_DEFAULT);
        ServiceConfig {
            connection: ConnectionConfig {
                ping_interval: Duration::from_secs(self.connection.ping_interval_secs),
                v1_retry_backoff: Duration::from_secs(self.connection.retry_backoff_secs),
                ..ConnectionConfig::default()
            },
            transfer: TransferConfig {
                output_dir: self.transfer.output_dir.clone(),
                chunk_size: self.transfer.chunk_size,
                compress: self.transfer.compress,
                compression_level: self.transfer.compression_level,
                require_overwrite_confirmation: !self.transfer.auto_confirm_overwrite,
                file_mode,
                executable_mode: exec_mode,
                directory_mode: exec_mode,
                ..TransferConfig::default()
            },
            crawl: CrawlConfig {
                include_hidden: self.transfer.include_hidden,
                ..CrawlConfig::default()
            },
        }
    }

    /// Build the local identity this file describes
    #[must_use]
    pub fn local_identity(&self, instance_id: String) -> LocalIdentity {
        let hostname = self
            .identity
            .hostname
            .clone()
            .or_else(system_hostname)
            .unwrap_or_else(|| "drift-host".to_string());
        let short_name = hostname.clone();
        LocalIdentity {
            id: instance_id,
            hostname,
            display_name: self.identity.display_name.clone(),
            short_name,
            os: std::env::consts::OS.to_string(),
            avatar: None,
            port: self.identity.port,
            auth_port: self.identity.auth_port,
        }
    }
}

/// Best-effort system hostname lookup
fn system_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
}

//! Configuration management for dispersa

use crate::crypto::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::pool::ServiceLevel;
use crate::storage::FilesystemEndpoint;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Backends written by `init` for a local setup
const DEFAULT_BACKEND_COUNT: usize = 7;

/// Escrow endpoints written by `init` for a local setup
const DEFAULT_ESCROW_COUNT: usize = 3;

/// One storage backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Directory on a locally mounted filesystem
    Filesystem(FilesystemEndpoint),
}

impl BackendConfig {
    pub fn name(&self) -> &str {
        match self {
            BackendConfig::Filesystem(ep) => &ep.name,
        }
    }
}

/// One key escrow endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EscrowEndpointConfig {
    /// Shares kept as JSON files in a directory
    Directory { name: String, path: PathBuf },
}

impl EscrowEndpointConfig {
    pub fn name(&self) -> &str {
        match self {
            EscrowEndpointConfig::Directory { name, .. } => name,
        }
    }
}

/// Key escrow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// Shares needed to rebuild a key
    #[serde(default = "default_threshold")]
    pub threshold: u8,

    /// Bound on every escrow call
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default)]
    pub endpoints: Vec<EscrowEndpointConfig>,
}

fn default_threshold() -> u8 {
    crate::escrow::DEFAULT_THRESHOLD
}

fn default_rpc_timeout_ms() -> u64 {
    crate::escrow::DEFAULT_RPC_TIMEOUT.as_millis() as u64
}

/// Transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per stripe per round
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Padding added past the end of every file before striping
    #[serde(default = "default_pad_length")]
    pub pad_length: u64,

    /// How long to wait for backends to commit their stripes
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,

    /// Progress polling interval while waiting
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Whole-upload attempts on retryable failures
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Service level used when none is given
    #[serde(default = "default_sla")]
    pub default_sla: String,
}

fn default_packet_size() -> usize {
    crate::erasure::DEFAULT_PACKET_SIZE
}

fn default_pad_length() -> u64 {
    256
}

fn default_completion_timeout_ms() -> u64 {
    100_000
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_sla() -> String {
    ServiceLevel::premium().name
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            packet_size: default_packet_size(),
            pad_length: default_pad_length(),
            completion_timeout_ms: default_completion_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_attempts: default_retry_attempts(),
            default_sla: default_sla(),
        }
    }
}

/// Backend pool limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle handles kept for reuse
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Failed connection attempts tolerated per request
    #[serde(default = "default_max_tries")]
    pub max_tries: usize,
}

fn default_max_idle() -> usize {
    5
}

fn default_max_tries() -> usize {
    20
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_idle: default_max_idle(),
            max_tries: default_max_tries(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// User files are owned by and whose root is used
    pub user: String,

    /// Path to the data directory (metadata database)
    pub data_dir: PathBuf,

    /// Storage backends
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Key escrow
    pub escrow: EscrowConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dispersa");
        Config::local(data_dir)
    }
}

impl Config {
    /// Self-contained setup with every backend and escrow under `data_dir`
    pub fn local<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let user = std::env::var("USER").unwrap_or_else(|_| "dispersa".to_string());

        let backends = (0..DEFAULT_BACKEND_COUNT)
            .map(|i| {
                BackendConfig::Filesystem(FilesystemEndpoint::new(
                    format!("local-{}", i),
                    data_dir.join("backends").join(format!("b{}", i)),
                ))
            })
            .collect();
        let endpoints = (0..DEFAULT_ESCROW_COUNT)
            .map(|i| EscrowEndpointConfig::Directory {
                name: format!("escrow-{}", i),
                path: data_dir.join("escrow").join(format!("e{}", i)),
            })
            .collect();

        Config {
            user,
            data_dir,
            backends,
            escrow: EscrowConfig {
                threshold: default_threshold(),
                rpc_timeout_ms: default_rpc_timeout_ms(),
                endpoints,
            },
            transfer: TransferConfig::default(),
            pool: PoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        // Override with environment variables if set
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("DISPERSA_USER") {
            let user = user.trim().to_string();
            if !user.is_empty() {
                self.user = user;
            }
        }

        if let Ok(level) = std::env::var("DISPERSA_LOG_LEVEL") {
            let level = level.trim().to_lowercase();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }

        if let Ok(packet) = std::env::var("DISPERSA_PACKET_SIZE") {
            if let Ok(size) = packet.trim().parse::<usize>() {
                self.transfer.packet_size = size;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::InvalidConfig("User name is required".to_string()));
        }

        if self.transfer.packet_size == 0 {
            return Err(Error::InvalidConfig(
                "Packet size must be greater than 0".to_string(),
            ));
        }

        // Encrypted uploads keep the cipher padding inside the pad
        if self.transfer.pad_length < BLOCK_SIZE as u64 {
            return Err(Error::InvalidConfig(format!(
                "Pad length must be at least {} bytes",
                BLOCK_SIZE
            )));
        }

        if self.transfer.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "Poll interval must be greater than 0".to_string(),
            ));
        }

        ServiceLevel::by_name(&self.transfer.default_sla)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name()) {
                return Err(Error::InvalidConfig(format!(
                    "Duplicate backend name: {}",
                    backend.name()
                )));
            }
        }

        let mut escrow_names = HashSet::new();
        for endpoint in &self.escrow.endpoints {
            if !escrow_names.insert(endpoint.name()) {
                return Err(Error::InvalidConfig(format!(
                    "Duplicate escrow endpoint name: {}",
                    endpoint.name()
                )));
            }
        }

        let threshold = self.escrow.threshold as usize;
        if threshold == 0 {
            return Err(Error::InvalidConfig(
                "Escrow threshold must be at least 1".to_string(),
            ));
        }
        if !self.escrow.endpoints.is_empty() && threshold > self.escrow.endpoints.len() {
            return Err(Error::InvalidConfig(format!(
                "Escrow threshold {} exceeds {} endpoints",
                threshold,
                self.escrow.endpoints.len()
            )));
        }

        Ok(())
    }

    /// Location of the metadata database
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        for backend in &self.backends {
            match backend {
                BackendConfig::Filesystem(ep) => std::fs::create_dir_all(ep.directory())?,
            }
        }
        for endpoint in &self.escrow.endpoints {
            match endpoint {
                EscrowEndpointConfig::Directory { path, .. } => std::fs::create_dir_all(path)?,
            }
        }
        Ok(())
    }
}

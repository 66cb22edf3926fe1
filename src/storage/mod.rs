//! Storage backends
//!
//! Every backend kind implements [`StorageClient`], a uniform streaming
//! capability. Writes are pipes into a background sink that commits the
//! object only once exactly the declared number of bytes arrived.

mod filesystem;
mod memory;
mod transfer;

pub use filesystem::{FilesystemClient, FilesystemEndpoint};
pub use memory::{MemoryClient, MemoryStore};
pub use transfer::{ProgressReader, TransferTracker, WriteStatus};

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Version string reported by the bundled backends
pub const STORAGE_VERSION: &str = "1.0";

/// Completion wait used by [`StorageClient::store_file`]
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(100);

/// Writable half handed out by [`StorageClient::write_data`]
pub type DataWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable stream handed out by [`StorageClient::read_data`]
pub type DataReader = Box<dyn AsyncRead + Send + Unpin>;

/// Known backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Filesystem,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Filesystem => "filesystem",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where one stripe lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeLocation {
    pub uri: String,
    pub kind: BackendKind,
    pub version: String,
}

impl StripeLocation {
    /// Object name, the part of the URI after the last '/'
    pub fn object_name(&self) -> &str {
        match self.uri.rfind('/') {
            Some(pos) => &self.uri[pos + 1..],
            None => &self.uri,
        }
    }
}

/// Directory prefix of a URI, up to and including the last '/'
pub fn normalized_prefix(uri: &str) -> &str {
    match uri.rfind('/') {
        Some(pos) => &uri[..=pos],
        None => "",
    }
}

/// Lifecycle of one transfer as reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Idle,
    Initializing,
    Active,
    IntermediateResult,
    Complete,
    Error,
    ErrorPath,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Error | TransferState::ErrorPath
        )
    }
}

/// Progress callback
pub trait TransferObserver: Send + Sync {
    fn progress_made(&self, percent: u8);

    fn progress_with_state(&self, percent: u8, state: TransferState);
}

/// Uniform streaming capability of one backend connection
#[async_trait]
pub trait StorageClient: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn version(&self) -> &str;

    /// Name of the endpoint this handle is connected to
    fn endpoint_name(&self) -> &str;

    /// Full URI of an object
    fn uri(&self, name: &str) -> String;

    /// URI prefix shared by every object of this handle
    fn base_uri(&self) -> String {
        self.uri("")
    }

    async fn connect(&mut self) -> Result<()>;

    /// Open a pipe that commits `name` once exactly `size` bytes were written
    async fn write_data(
        &self,
        name: &str,
        size: u64,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<DataWriter>;

    async fn read_data(
        &self,
        name: &str,
        size: u64,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<DataReader>;

    /// Stored size of an object, `None` if absent
    async fn object_size(&self, name: &str) -> Result<Option<u64>>;

    async fn check_file(&self, name: &str) -> Result<bool> {
        Ok(self.object_size(name).await?.is_some())
    }

    async fn delete_file(&self, name: &str) -> Result<()>;

    /// Percentage of the current transfer done
    fn transfer_progress(&self) -> u8;

    /// Wait until the current write committed or failed
    async fn wait_write_complete(&self, timeout: Duration) -> Result<()>;

    fn write_completed(&self) -> bool;

    /// Abort the current write; the writer fails from then on
    async fn cancel_write(&self);

    fn is_reusable(&self) -> bool;

    async fn logout(&mut self);

    /// Upload a local file under `remote`
    async fn store_file(
        &self,
        local: &Path,
        remote: &str,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<()> {
        let mut file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        let mut writer = self.write_data(remote, size, observer).await?;
        tokio::io::copy(&mut file, &mut writer).await?;
        writer.shutdown().await?;
        drop(writer);
        self.wait_write_complete(DEFAULT_WRITE_TIMEOUT).await
    }

    /// Download `remote` into a local file
    async fn get_file(
        &self,
        remote: &str,
        local: &Path,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<()> {
        let size = self
            .object_size(remote)
            .await?
            .ok_or_else(|| Error::FileNotFound(self.uri(remote)))?;
        let mut reader = self.read_data(remote, size, observer).await?;
        let mut file = tokio::fs::File::create(local).await?;
        let copied = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        if copied != size {
            return Err(Error::TransferIncomplete(format!(
                "{}: got {} of {} bytes",
                self.uri(remote),
                copied,
                size
            )));
        }
        Ok(())
    }
}

fn check_size(uri: &str, expected: u64, got: u64) -> Result<()> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::TransferIncomplete(format!(
            "{}: received {} of {} declared bytes",
            uri, got, expected
        )))
    }
}

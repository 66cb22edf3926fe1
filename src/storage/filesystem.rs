//! Local directory backend
//!
//! Objects are files under `<root>/<container>`. Writes land in a `.part`
//! file that is renamed into place once the declared size arrived.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::transfer::{ProgressReader, TransferTracker, WriteStatus};
use super::{
    check_size, BackendKind, DataReader, DataWriter, StorageClient, TransferObserver,
    STORAGE_VERSION,
};
use crate::error::{Error, Result};

fn default_container() -> String {
    "dispersa".to_string()
}

/// Connection parameters of one filesystem endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemEndpoint {
    pub name: String,
    pub root: PathBuf,
    #[serde(default = "default_container")]
    pub container: String,
}

impl FilesystemEndpoint {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            container: default_container(),
        }
    }

    pub fn directory(&self) -> PathBuf {
        self.root.join(&self.container)
    }

    /// Base URI of every object of this endpoint
    pub fn base_uri(&self) -> String {
        format!("file://{}/", self.directory().display())
    }
}

/// Handle on a [`FilesystemEndpoint`]
pub struct FilesystemClient {
    endpoint: FilesystemEndpoint,
    dir: PathBuf,
    tracker: Arc<TransferTracker>,
    connected: bool,
}

impl FilesystemClient {
    pub fn new(endpoint: FilesystemEndpoint) -> Self {
        let dir = endpoint.directory();
        Self {
            endpoint,
            dir,
            tracker: TransferTracker::new(),
            connected: false,
        }
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        if !self.connected {
            return Err(Error::BackendUnavailable(format!(
                "{} not connected",
                self.endpoint.name
            )));
        }
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(Error::Backend(format!("invalid object name {:?}", name)));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl StorageClient for FilesystemClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    fn version(&self) -> &str {
        STORAGE_VERSION
    }

    fn endpoint_name(&self) -> &str {
        &self.endpoint.name
    }

    fn uri(&self, name: &str) -> String {
        format!("{}{}", self.endpoint.base_uri(), name)
    }

    async fn connect(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("{}: {}", self.endpoint.name, e)))?;
        self.connected = true;
        info!("Connected to {} at {:?}", self.endpoint.name, self.dir);
        Ok(())
    }

    async fn write_data(
        &self,
        name: &str,
        size: u64,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<DataWriter> {
        let path = self.object_path(name)?;
        let part = self.dir.join(format!(".{}.part", name));
        let uri = self.uri(name);

        Ok(self
            .tracker
            .open_pipe(uri.clone(), size, observer, move |mut reader| async move {
                let mut file = tokio::fs::File::create(&part).await?;
                let copied = tokio::io::copy(&mut (&mut reader).take(size + 1), &mut file).await;
                let result = match copied {
                    Ok(got) => check_size(&uri, size, got),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(e);
                }
                file.sync_all().await?;
                drop(file);
                tokio::fs::rename(&part, &path).await?;
                Ok(())
            }))
    }

    async fn read_data(
        &self,
        name: &str,
        size: u64,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<DataReader> {
        let path = self.object_path(name)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(self.uri(name)))
            }
            Err(e) => return Err(e.into()),
        };
        self.tracker.begin(size);
        Ok(Box::new(ProgressReader::new(
            file,
            Arc::clone(&self.tracker),
            observer,
        )))
    }

    async fn object_size(&self, name: &str) -> Result<Option<u64>> {
        let path = self.object_path(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::DeleteFailed(format!("{}: {}", self.uri(name), e))),
        }
    }

    fn transfer_progress(&self) -> u8 {
        self.tracker.progress()
    }

    async fn wait_write_complete(&self, timeout: Duration) -> Result<()> {
        self.tracker.wait(timeout).await
    }

    fn write_completed(&self) -> bool {
        self.tracker.status() == WriteStatus::Committed
    }

    async fn cancel_write(&self) {
        self.tracker.cancel().await;
    }

    fn is_reusable(&self) -> bool {
        self.connected
    }

    async fn logout(&mut self) {
        self.tracker.cancel().await;
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    async fn connected(dir: &TempDir) -> FilesystemClient {
        let mut client = FilesystemClient::new(FilesystemEndpoint::new("fs-0", dir.path()));
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_write_commits_by_rename() {
        let dir = TempDir::new().unwrap();
        let client = connected(&dir).await;

        let mut writer = client.write_data("s.0", 4, None).await.unwrap();
        writer.write_all(b"data").await.unwrap();
        writer.shutdown().await.unwrap();
        client
            .wait_write_complete(Duration::from_secs(5))
            .await
            .unwrap();

        let stored = dir.path().join("dispersa").join("s.0");
        assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"data");
        assert!(!dir.path().join("dispersa").join(".s.0.part").exists());
        assert_eq!(
            client.uri("s.0"),
            format!("file://{}/s.0", dir.path().join("dispersa").display())
        );
    }

    #[tokio::test]
    async fn test_oversized_write_discarded() {
        let dir = TempDir::new().unwrap();
        let client = connected(&dir).await;

        let mut writer = client.write_data("s.1", 2, None).await.unwrap();
        // The sink stops reading after the overflow, so the write may fail
        let _ = writer.write_all(b"toolong").await;
        let _ = writer.shutdown().await;
        drop(writer);

        assert!(client
            .wait_write_complete(Duration::from_secs(5))
            .await
            .is_err());
        assert_eq!(client.object_size("s.1").await.unwrap(), None);
        assert!(!dir.path().join("dispersa").join(".s.1.part").exists());
    }

    #[tokio::test]
    async fn test_read_missing_and_delete() {
        let dir = TempDir::new().unwrap();
        let client = connected(&dir).await;

        assert!(matches!(
            client.read_data("nope", 1, None).await,
            Err(Error::FileNotFound(_))
        ));
        client.delete_file("nope").await.unwrap();
        assert!(client.object_size("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_unconnected_client_fails() {
        let dir = TempDir::new().unwrap();
        let client = FilesystemClient::new(FilesystemEndpoint::new("fs-0", dir.path()));
        assert!(matches!(
            client.check_file("x").await,
            Err(Error::BackendUnavailable(_))
        ));
    }
}

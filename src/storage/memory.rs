//! In-process object store backend

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::transfer::{ProgressReader, TransferTracker};
use super::{
    check_size, BackendKind, DataReader, DataWriter, StorageClient, TransferObserver,
    STORAGE_VERSION,
};
use crate::error::{Error, Result};

/// Shared object map standing in for one storage server
pub struct MemoryStore {
    name: String,
    objects: DashMap<String, Bytes>,
    online: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            objects: DashMap::new(),
            online: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulate an outage
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.objects.get(name).map(|o| o.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    /// Drop an object behind the client's back
    pub fn remove(&self, name: &str) -> Option<Bytes> {
        self.objects.remove(name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Base URI of every object in this store
    pub fn base_uri(&self) -> String {
        format!("mem://{}/", self.name)
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::BackendUnavailable(self.base_uri()))
        }
    }
}

/// Handle on a [`MemoryStore`]
pub struct MemoryClient {
    store: Arc<MemoryStore>,
    tracker: Arc<TransferTracker>,
    connected: bool,
}

impl MemoryClient {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            tracker: TransferTracker::new(),
            connected: false,
        }
    }

    fn ready(&self) -> Result<()> {
        if !self.connected {
            return Err(Error::BackendUnavailable(format!(
                "{} not connected",
                self.store.base_uri()
            )));
        }
        self.store.check_online()
    }
}

#[async_trait]
impl StorageClient for MemoryClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn version(&self) -> &str {
        STORAGE_VERSION
    }

    fn endpoint_name(&self) -> &str {
        self.store.name()
    }

    fn uri(&self, name: &str) -> String {
        format!("mem://{}/{}", self.store.name, name)
    }

    async fn connect(&mut self) -> Result<()> {
        self.store.check_online()?;
        self.connected = true;
        Ok(())
    }

    async fn write_data(
        &self,
        name: &str,
        size: u64,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<DataWriter> {
        self.ready()?;
        let store = Arc::clone(&self.store);
        let key = name.to_string();
        let uri = self.uri(name);

        Ok(self
            .tracker
            .open_pipe(uri.clone(), size, observer, move |mut reader| async move {
                let mut buf = Vec::with_capacity(size as usize);
                (&mut reader).take(size + 1).read_to_end(&mut buf).await?;
                check_size(&uri, size, buf.len() as u64)?;
                store.check_online()?;
                store.objects.insert(key, Bytes::from(buf));
                Ok(())
            }))
    }

    async fn read_data(
        &self,
        name: &str,
        size: u64,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<DataReader> {
        self.ready()?;
        let data = self
            .store
            .get(name)
            .ok_or_else(|| Error::FileNotFound(self.uri(name)))?;
        self.tracker.begin(size);
        Ok(Box::new(ProgressReader::new(
            Cursor::new(data),
            Arc::clone(&self.tracker),
            observer,
        )))
    }

    async fn object_size(&self, name: &str) -> Result<Option<u64>> {
        self.ready()?;
        Ok(self.store.get(name).map(|data| data.len() as u64))
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        self.ready()?;
        self.store.remove(name);
        debug!("Deleted {}", self.uri(name));
        Ok(())
    }

    fn transfer_progress(&self) -> u8 {
        self.tracker.progress()
    }

    async fn wait_write_complete(&self, timeout: Duration) -> Result<()> {
        self.tracker.wait(timeout).await
    }

    fn write_completed(&self) -> bool {
        self.tracker.status() == super::WriteStatus::Committed
    }

    async fn cancel_write(&self) {
        self.tracker.cancel().await;
    }

    fn is_reusable(&self) -> bool {
        self.connected && self.store.is_online()
    }

    async fn logout(&mut self) {
        self.tracker.cancel().await;
        self.connected = false;
    }
}

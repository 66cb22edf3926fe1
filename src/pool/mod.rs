//! Pool of storage backend handles
//!
//! Handles are handed out per request and returned afterwards. Idle handles
//! are reused first-match; fresh connections go round-robin over the known
//! endpoints of the requested kind, or to the endpoint a URI designates.

mod sla;

pub use sla::ServiceLevel;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::storage::{
    normalized_prefix, BackendKind, FilesystemClient, FilesystemEndpoint, MemoryClient,
    MemoryStore, StorageClient, STORAGE_VERSION,
};

/// One storage server the pool may connect to
#[derive(Clone)]
pub enum Endpoint {
    Filesystem(FilesystemEndpoint),
    Memory(Arc<MemoryStore>),
}

impl Endpoint {
    pub fn kind(&self) -> BackendKind {
        match self {
            Endpoint::Filesystem(_) => BackendKind::Filesystem,
            Endpoint::Memory(_) => BackendKind::Memory,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Endpoint::Filesystem(ep) => &ep.name,
            Endpoint::Memory(store) => store.name(),
        }
    }

    pub fn base_uri(&self) -> String {
        match self {
            Endpoint::Filesystem(ep) => ep.base_uri(),
            Endpoint::Memory(store) => store.base_uri(),
        }
    }

    /// Unconnected handle for this endpoint
    fn client(&self) -> Box<dyn StorageClient> {
        match self {
            Endpoint::Filesystem(ep) => Box::new(FilesystemClient::new(ep.clone())),
            Endpoint::Memory(store) => Box::new(MemoryClient::new(Arc::clone(store))),
        }
    }
}

struct PoolState {
    idle: Vec<Box<dyn StorageClient>>,
    /// Round-robin position per backend kind
    cursors: HashMap<BackendKind, usize>,
}

/// Storage backend pool
pub struct StoragePool {
    endpoints: Vec<Endpoint>,
    state: Mutex<PoolState>,
    config: PoolConfig,
}

impl StoragePool {
    pub fn new(endpoints: Vec<Endpoint>, config: PoolConfig) -> Result<Self> {
        let mut names = HashSet::new();
        for endpoint in &endpoints {
            if !names.insert(endpoint.name().to_string()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate backend name {}",
                    endpoint.name()
                )));
            }
        }

        info!("Storage pool with {} endpoints", endpoints.len());
        Ok(Self {
            endpoints,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                cursors: HashMap::new(),
            }),
            config,
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn has_kind(&self, kind: BackendKind) -> bool {
        self.endpoints.iter().any(|e| e.kind() == kind)
    }

    /// Get a connected handle, `None` if no matching backend is reachable
    pub async fn get_storage_client(
        &self,
        uri: Option<&str>,
        kind: BackendKind,
        version: Option<&str>,
    ) -> Option<Box<dyn StorageClient>> {
        self.acquire(uri, kind, version, &HashSet::new()).await
    }

    async fn acquire(
        &self,
        uri: Option<&str>,
        kind: BackendKind,
        version: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Option<Box<dyn StorageClient>> {
        if let Some(version) = version {
            if version != STORAGE_VERSION {
                debug!("No {} backend speaks version {}", kind, version);
                return None;
            }
        }
        let prefix = uri.map(normalized_prefix);

        let endpoint = {
            let mut state = self.state.lock();

            let found = state.idle.iter().position(|handle| {
                handle.kind() == kind
                    && version.map_or(true, |v| handle.version() == v)
                    && prefix.map_or(true, |p| handle.base_uri() == p)
                    && !exclude.contains(handle.endpoint_name())
            });
            if let Some(pos) = found {
                let handle = state.idle.remove(pos);
                debug!("Reusing idle handle for {}", handle.endpoint_name());
                return Some(handle);
            }

            match prefix {
                Some(prefix) => self
                    .endpoints
                    .iter()
                    .find(|e| e.kind() == kind && e.base_uri() == prefix)?
                    .clone(),
                None => {
                    let candidates: Vec<&Endpoint> = self
                        .endpoints
                        .iter()
                        .filter(|e| e.kind() == kind && !exclude.contains(e.name()))
                        .collect();
                    if candidates.is_empty() {
                        return None;
                    }
                    let cursor = state.cursors.entry(kind).or_insert(0);
                    let picked = candidates[*cursor % candidates.len()].clone();
                    *cursor = cursor.wrapping_add(1);
                    picked
                }
            }
        };

        let mut client = endpoint.client();
        match client.connect().await {
            Ok(()) => {
                debug!("Connected new handle to {}", endpoint.name());
                Some(client)
            }
            Err(e) => {
                warn!("Backend {} unavailable: {}", endpoint.name(), e);
                None
            }
        }
    }

    /// Give a handle back; it is kept idle if there is room and it is reusable
    pub async fn return_storage(&self, handle: Box<dyn StorageClient>) {
        let rejected = {
            let mut state = self.state.lock();
            if handle.is_reusable() && state.idle.len() < self.config.max_idle {
                state.idle.push(handle);
                None
            } else {
                Some(handle)
            }
        };

        if let Some(mut handle) = rejected {
            debug!("Discarding handle for {}", handle.endpoint_name());
            handle.logout().await;
        }
    }

    pub async fn return_all(&self, handles: Vec<Box<dyn StorageClient>>) {
        for handle in handles {
            self.return_storage(handle).await;
        }
    }

    /// Get `count` handles on distinct endpoints, alternating over the
    /// backend kinds of `sla`
    pub async fn storage_for_sla(
        &self,
        sla: &ServiceLevel,
        count: usize,
    ) -> Result<Vec<Box<dyn StorageClient>>> {
        let mix: Vec<BackendKind> = sla
            .backends
            .iter()
            .copied()
            .filter(|kind| self.has_kind(*kind))
            .collect();

        let mut handles: Vec<Box<dyn StorageClient>> = Vec::with_capacity(count);
        let mut used = HashSet::new();
        let mut tries = self.config.max_tries;
        let mut turn = 0usize;

        while handles.len() < count && !mix.is_empty() {
            let kind = mix[turn % mix.len()];
            turn += 1;

            match self.acquire(None, kind, Some(STORAGE_VERSION), &used).await {
                Some(handle) => {
                    used.insert(handle.endpoint_name().to_string());
                    handles.push(handle);
                }
                None => {
                    tries = tries.saturating_sub(1);
                    if tries == 0 {
                        break;
                    }
                }
            }
        }

        if handles.len() < count {
            let obtained = handles.len();
            warn!(
                "Only {} of {} backends available for {}",
                obtained, count, sla.name
            );
            self.return_all(handles).await;
            return Err(Error::PoolExhausted {
                obtained,
                required: count,
            });
        }

        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pool(count: usize) -> (StoragePool, Vec<Arc<MemoryStore>>) {
        let stores: Vec<_> = (0..count)
            .map(|i| MemoryStore::new(format!("s{}", i)))
            .collect();
        let endpoints = stores.iter().cloned().map(Endpoint::Memory).collect();
        let pool = StoragePool::new(endpoints, PoolConfig::default()).unwrap();
        (pool, stores)
    }

    #[tokio::test]
    async fn test_returned_handle_is_reused() {
        let (pool, stores) = memory_pool(2);
        let handle = pool
            .get_storage_client(Some("mem://s0/file.0"), BackendKind::Memory, None)
            .await
            .unwrap();
        assert_eq!(handle.endpoint_name(), "s0");
        pool.return_storage(handle).await;
        assert_eq!(pool.idle_count(), 1);

        // A fresh connect would fail now, so success means reuse
        stores[0].set_online(false);
        let again = pool
            .get_storage_client(Some("mem://s0/other.3"), BackendKind::Memory, Some("1.0"))
            .await
            .unwrap();
        assert_eq!(again.endpoint_name(), "s0");
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_non_matching_uri_never_gets_idle_handle() {
        let (pool, _stores) = memory_pool(2);
        let handle = pool
            .get_storage_client(Some("mem://s0/a"), BackendKind::Memory, None)
            .await
            .unwrap();
        pool.return_storage(handle).await;

        let other = pool
            .get_storage_client(Some("mem://s1/a"), BackendKind::Memory, None)
            .await
            .unwrap();
        assert_eq!(other.endpoint_name(), "s1");
        assert_eq!(pool.idle_count(), 1);

        assert!(pool
            .get_storage_client(Some("mem://unknown/a"), BackendKind::Memory, None)
            .await
            .is_none());
        assert!(pool
            .get_storage_client(Some("mem://s0/a"), BackendKind::Filesystem, None)
            .await
            .is_none());
        assert!(pool
            .get_storage_client(None, BackendKind::Memory, Some("2.0"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_round_robin() {
        let (pool, _stores) = memory_pool(3);
        let mut names = Vec::new();
        for _ in 0..3 {
            let handle = pool
                .get_storage_client(None, BackendKind::Memory, None)
                .await
                .unwrap();
            names.push(handle.endpoint_name().to_string());
        }
        names.sort();
        assert_eq!(names, vec!["s0", "s1", "s2"]);
    }

    #[tokio::test]
    async fn test_idle_cap() {
        let (pool, _stores) = memory_pool(7);
        let handles = pool
            .storage_for_sla(&ServiceLevel::premium(), 7)
            .await
            .unwrap();
        pool.return_all(handles).await;
        assert_eq!(pool.idle_count(), PoolConfig::default().max_idle);
    }

    #[tokio::test]
    async fn test_sla_handles_are_distinct() {
        let (pool, _stores) = memory_pool(7);
        let handles = pool
            .storage_for_sla(&ServiceLevel::premium(), 7)
            .await
            .unwrap();
        let names: HashSet<_> = handles.iter().map(|h| h.endpoint_name().to_string()).collect();
        assert_eq!(names.len(), 7);
    }

    #[tokio::test]
    async fn test_sla_exhausted() {
        let (pool, stores) = memory_pool(7);
        stores[3].set_online(false);
        let Err(err) = pool.storage_for_sla(&ServiceLevel::premium(), 7).await else {
            panic!("seven handles from six reachable backends");
        };
        assert!(matches!(
            err,
            Error::PoolExhausted {
                obtained: 6,
                required: 7
            }
        ));
        // Obtained handles went back to the pool
        assert_eq!(pool.idle_count(), 5);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let store = MemoryStore::new("dup");
        let endpoints = vec![Endpoint::Memory(store.clone()), Endpoint::Memory(store)];
        assert!(StoragePool::new(endpoints, PoolConfig::default()).is_err());
    }
}

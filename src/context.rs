//! Process-wide store context
//!
//! Owns the backend pool, the escrow endpoints and the metadata service.
//! Built once at startup and handed to the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{BackendConfig, Config, EscrowEndpointConfig, TransferConfig};
use crate::escrow::{DirectoryEscrow, EscrowEndpoint, KeyEscrow};
use crate::metadata::{MetadataService, MetadataStore};
use crate::error::Result;
use crate::pool::{Endpoint, StoragePool};

/// Everything an operation needs
pub struct StoreContext {
    pub pool: StoragePool,
    pub escrow: KeyEscrow,
    pub metadata: Arc<dyn MetadataService>,
    pub transfer: TransferConfig,
    /// Shares needed to rebuild a file key
    pub escrow_threshold: u8,
}

impl StoreContext {
    pub fn new(
        pool: StoragePool,
        escrow: KeyEscrow,
        metadata: Arc<dyn MetadataService>,
        transfer: TransferConfig,
        escrow_threshold: u8,
    ) -> Self {
        Self {
            pool,
            escrow,
            metadata,
            transfer,
            escrow_threshold,
        }
    }

    /// Build the context described by a configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let endpoints = config
            .backends
            .iter()
            .map(|backend| match backend {
                BackendConfig::Filesystem(ep) => Endpoint::Filesystem(ep.clone()),
            })
            .collect();
        let pool = StoragePool::new(endpoints, config.pool.clone())?;

        let escrow_endpoints = config
            .escrow
            .endpoints
            .iter()
            .map(|endpoint| -> Arc<dyn EscrowEndpoint> {
                match endpoint {
                    EscrowEndpointConfig::Directory { name, path } => {
                        Arc::new(DirectoryEscrow::new(name.clone(), path))
                    }
                }
            })
            .collect();
        let escrow = KeyEscrow::new(
            escrow_endpoints,
            Duration::from_millis(config.escrow.rpc_timeout_ms),
        );

        let metadata = MetadataStore::open(config.metadata_path(), &config.user)?;
        info!(
            "Store context ready: {} backends, {} escrow endpoints",
            config.backends.len(),
            config.escrow.endpoints.len()
        );

        Ok(Self::new(
            pool,
            escrow,
            Arc::new(metadata),
            config.transfer.clone(),
            config.escrow.threshold,
        ))
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer.completion_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.transfer.poll_interval_ms)
    }
}

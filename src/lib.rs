//! dispersa - Dispersed, fault-tolerant file storage
//!
//! Files are split with a `k`-of-`n` erasure code into stripes placed on
//! independent storage backends, optionally encrypted under a per-file key
//! that is itself split across key escrow endpoints. Any `k` stripes and any
//! threshold of key shares are enough to rebuild a file.

pub mod config;
pub mod context;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod escrow;
pub mod metadata;
pub mod pool;
pub mod storage;
pub mod transfer;

pub use config::Config;
pub use context::StoreContext;
pub use error::{Error, Result};
pub use transfer::Orchestrator;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::StoreContext;
    pub use crate::error::{Error, Result};
    pub use crate::metadata::{FileId, FileRecord, MetadataService};
    pub use crate::pool::ServiceLevel;
    pub use crate::transfer::{Orchestrator, UploadOptions};
}

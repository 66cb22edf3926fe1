//! Threshold key escrow
//!
//! File keys are split with a K-of-N secret sharing scheme and one share is
//! stored per escrow endpoint, so no single endpoint can recover a key.

mod client;
mod endpoint;
mod entry;
mod sharing;

pub use client::{Distribution, KeyEscrow, DEFAULT_RPC_TIMEOUT};
pub use endpoint::{DirectoryEscrow, EscrowEndpoint, KeyShare, MemoryEscrow, ESCROW_VERSION};
pub use entry::entry_name;
pub use sharing::{SecretSharing, ShamirGf256, Share};

/// Default number of shares needed to rebuild a key
pub const DEFAULT_THRESHOLD: u8 = 2;

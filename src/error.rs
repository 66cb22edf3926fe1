//! Error types for dispersa

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dispersa
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    // Erasure coding errors
    #[error("Insufficient stripes: only {available} of {required} stripes available")]
    InsufficientStripes { available: usize, required: usize },

    #[error("Unexpected end of stripe {stripe} after {written} reconstructed bytes")]
    UnexpectedEof { stripe: usize, written: u64 },

    #[error("Stripe input exceeds logical end size of {limit} bytes")]
    StripeOverrun { limit: u64 },

    #[error("Erasure encoding failed: {0}")]
    ErasureEncode(String),

    #[error("Erasure decoding failed: {0}")]
    ErasureDecode(String),

    #[error("Invalid erasure configuration: {0}")]
    InvalidErasureConfig(String),

    // Key escrow errors
    #[error("Insufficient key shares: only {available} of {required} shares available")]
    InsufficientShares { available: usize, required: usize },

    #[error("Inconsistent key shares: {0}")]
    InconsistentShares(String),

    #[error("Secret sharing error: {0}")]
    SecretSharing(String),

    #[error("Escrow endpoint {endpoint} failed: {reason}")]
    EscrowEndpoint { endpoint: String, reason: String },

    #[error("Escrow entry not found: {0}")]
    EntryNotFound(String),

    // Storage and pool errors
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Pool exhausted: obtained {obtained} of {required} backend handles")]
    PoolExhausted { obtained: usize, required: usize },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unknown service level: {0}")]
    UnknownServiceLevel(String),

    // Transfer errors
    #[error("Stripe verification failed: {0}")]
    VerificationFailed(String),

    #[error("Transfer incomplete: {0}")]
    TransferIncomplete(String),

    #[error("Stripe delete failed: {0}")]
    DeleteFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Metadata errors
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure means the addressed file or path does not exist
    pub fn is_path_error(&self) -> bool {
        matches!(
            self,
            Error::FileNotFound(_)
                | Error::PathNotFound(_)
                | Error::NotADirectory(_)
                | Error::NotAFile(_)
        )
    }

    /// Whether a whole-operation retry may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::BackendUnavailable(_)
            | Error::PoolExhausted { .. }
            | Error::VerificationFailed(_)
            | Error::TransferIncomplete(_)
            | Error::Timeout(_)
            | Error::EscrowEndpoint { .. }
            | Error::InsufficientShares { .. }
            | Error::Backend(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

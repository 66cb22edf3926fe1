//! Cryptography module for dispersa
//!
//! Files are encrypted with AES-256-CBC (PKCS#7 padding) as streams, so
//! plaintext is never buffered whole. Keys are per file and only ever held
//! in memory; the escrow layer splits them for storage.

mod keys;
mod stream;

pub use keys::SymmetricKey;
pub use stream::{ciphertext_len, DecryptingWriter, EncryptingReader};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the CBC initialization vector in bytes
pub const IV_SIZE: usize = 16;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Algorithm identifier recorded alongside escrowed keys
pub const ALGORITHM: &str = "AES-256-CBC";

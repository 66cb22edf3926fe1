//! Per-file symmetric keys
//!
//! A key exists only in memory: it is generated for an upload, split into
//! escrow shares, and rebuilt from shares for a download.

use std::fmt;

use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::{ALGORITHM, IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};

/// Raw key bytes, algorithm id and optional IV
#[derive(Clone)]
pub struct SymmetricKey {
    /// The actual key material
    key: Zeroizing<Vec<u8>>,
    /// Algorithm identifier, e.g. "AES-256-CBC"
    algorithm: String,
    /// Initialization vector, if the algorithm uses one
    iv: Option<Vec<u8>>,
}

impl SymmetricKey {
    /// Generate a fresh random AES-256 key and IV
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = Zeroizing::new(vec![0u8; KEY_SIZE]);
        rng.fill_bytes(key.as_mut_slice());
        let mut iv = vec![0u8; IV_SIZE];
        rng.fill_bytes(&mut iv);

        SymmetricKey {
            key,
            algorithm: ALGORITHM.to_string(),
            iv: Some(iv),
        }
    }

    /// Rebuild a key from its parts (e.g. after combining escrow shares)
    pub fn from_parts(key: Vec<u8>, algorithm: impl Into<String>, iv: Option<Vec<u8>>) -> Self {
        SymmetricKey {
            key: Zeroizing::new(key),
            algorithm: algorithm.into(),
            iv,
        }
    }

    /// Get the raw key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn iv(&self) -> Option<&[u8]> {
        self.iv.as_deref()
    }

    /// Key and IV checked for use with AES-256-CBC
    pub(crate) fn cbc_params(&self) -> Result<(&[u8], &[u8])> {
        if self.algorithm != ALGORITHM {
            return Err(Error::Encryption(format!(
                "unsupported algorithm: {}",
                self.algorithm
            )));
        }
        if self.key.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: self.key.len(),
            });
        }
        let iv = self
            .iv
            .as_deref()
            .ok_or_else(|| Error::Encryption("missing initialization vector".to_string()))?;
        if iv.len() != IV_SIZE {
            return Err(Error::Encryption(format!(
                "invalid IV length: expected {}, got {}",
                IV_SIZE,
                iv.len()
            )));
        }
        Ok((self.key.as_slice(), iv))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("algorithm", &self.algorithm)
            .field("len", &self.key.len())
            .finish_non_exhaustive()
    }
}

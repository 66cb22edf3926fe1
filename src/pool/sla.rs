//! Service levels
//!
//! A service level names the redundancy of a file (k of n stripes), whether
//! it is encrypted by default, and which backend kinds its stripes go to.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::BackendKind;

/// Redundancy policy for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLevel {
    pub name: String,

    /// Stripes needed to reconstruct (k)
    pub data_stripes: usize,

    /// Stripes written (n)
    pub total_stripes: usize,

    /// Encrypt unless the caller says otherwise
    pub encrypt: bool,

    /// Backend kinds stripes alternate over
    pub backends: Vec<BackendKind>,
}

const MIX: [BackendKind; 2] = [BackendKind::Filesystem, BackendKind::Memory];

impl ServiceLevel {
    fn preset(name: &str, data_stripes: usize, total_stripes: usize, encrypt: bool) -> Self {
        ServiceLevel {
            name: name.to_string(),
            data_stripes,
            total_stripes,
            encrypt,
            backends: MIX.to_vec(),
        }
    }

    /// 5 of 7, encrypted
    pub fn premium() -> Self {
        Self::preset("Premium", 5, 7, true)
    }

    /// 2 of 3, encrypted
    pub fn free() -> Self {
        Self::preset("Free", 2, 3, true)
    }

    /// 1 of 2, plaintext
    pub fn open() -> Self {
        Self::preset("Open", 1, 2, false)
    }

    /// 3 of 7, encrypted
    pub fn paranoid() -> Self {
        Self::preset("Paranoid", 3, 7, true)
    }

    /// Every known service level
    pub fn catalog() -> Vec<ServiceLevel> {
        vec![Self::premium(), Self::free(), Self::open(), Self::paranoid()]
    }

    /// Look up a service level by name, ignoring case
    pub fn by_name(name: &str) -> Result<Self> {
        Self::catalog()
            .into_iter()
            .find(|sla| sla.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::UnknownServiceLevel(name.to_string()))
    }

    /// Stripes that may be lost without losing the file
    pub fn fault_tolerance(&self) -> usize {
        self.total_stripes - self.data_stripes
    }
}

impl Default for ServiceLevel {
    fn default() -> Self {
        Self::premium()
    }
}

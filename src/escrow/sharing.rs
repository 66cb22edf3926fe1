//! Threshold secret sharing over GF(256)
//!
//! Shamir's scheme applied byte-wise: each secret byte is the constant term
//! of a random polynomial of degree `k - 1`, and share `x` holds the
//! polynomial evaluated at `x` for every byte. Any `k` shares recover the
//! secret by Lagrange interpolation at zero; fewer reveal nothing.
//!
//! Field arithmetic uses the AES polynomial x^8 + x^4 + x^3 + x + 1 (0x11b)
//! with generator 3.

use std::collections::HashSet;

use rand::RngCore;

use crate::error::{Error, Result};

/// One share: evaluation point and one value byte per secret byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Evaluation point, 1..=n
    pub index: u8,
    pub value: Vec<u8>,
}

/// Pluggable K-of-N secret sharing
pub trait SecretSharing: Send + Sync {
    /// Split `secret` into `shares` shares, any `threshold` of which recombine it
    fn split(&self, secret: &[u8], shares: u8, threshold: u8) -> Result<Vec<Share>>;

    /// Recombine a secret from at least `threshold` distinct shares
    fn combine(&self, shares: &[Share], threshold: u8) -> Result<Vec<u8>>;
}

const fn build_tables() -> ([u8; 256], [u8; 512]) {
    let mut log = [0u8; 256];
    let mut exp = [0u8; 512];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        // x *= 3, i.e. x ^ (x << 1) reduced by 0x11b
        let mut doubled = x << 1;
        if doubled & 0x100 != 0 {
            doubled ^= 0x11b;
        }
        x ^= doubled;
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    (log, exp)
}

const TABLES: ([u8; 256], [u8; 512]) = build_tables();
const LOG: [u8; 256] = TABLES.0;
const EXP: [u8; 512] = TABLES.1;

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
}

/// `a / b`; `b` must be non-zero
fn gf_div(a: u8, b: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + 255 - LOG[b as usize] as usize]
}

/// Shamir secret sharing over GF(256)
#[derive(Debug, Default, Clone, Copy)]
pub struct ShamirGf256;

impl ShamirGf256 {
    pub fn new() -> Self {
        ShamirGf256
    }
}

impl SecretSharing for ShamirGf256 {
    fn split(&self, secret: &[u8], shares: u8, threshold: u8) -> Result<Vec<Share>> {
        if threshold == 0 || threshold > shares {
            return Err(Error::SecretSharing(format!(
                "threshold must be in 1..={}, got {}",
                shares, threshold
            )));
        }

        let mut rng = rand::thread_rng();
        let mut coefficients = vec![0u8; threshold as usize - 1];
        let mut out: Vec<Share> = (1..=shares)
            .map(|index| Share {
                index,
                value: Vec::with_capacity(secret.len()),
            })
            .collect();

        for &byte in secret {
            rng.fill_bytes(&mut coefficients);
            for share in out.iter_mut() {
                // Horner: ((c_{k-1} x + c_{k-2}) x + ...) x + secret
                let mut y = 0u8;
                for &c in coefficients.iter().rev() {
                    y = gf_mul(y, share.index) ^ c;
                }
                y = gf_mul(y, share.index) ^ byte;
                share.value.push(y);
            }
        }
        coefficients.fill(0);

        Ok(out)
    }

    fn combine(&self, shares: &[Share], threshold: u8) -> Result<Vec<u8>> {
        let threshold = threshold as usize;
        if threshold == 0 {
            return Err(Error::SecretSharing("threshold must be at least 1".to_string()));
        }
        if shares.len() < threshold {
            return Err(Error::InsufficientShares {
                available: shares.len(),
                required: threshold,
            });
        }

        let used = &shares[..threshold];
        let mut seen = HashSet::new();
        for share in used {
            if share.index == 0 || !seen.insert(share.index) {
                return Err(Error::SecretSharing(format!(
                    "invalid or duplicate share index {}",
                    share.index
                )));
            }
        }
        let len = used[0].value.len();
        if used.iter().any(|s| s.value.len() != len) {
            return Err(Error::SecretSharing("share lengths differ".to_string()));
        }

        // Lagrange basis at x = 0: l_i = prod_{j != i} x_j / (x_j - x_i)
        let basis: Vec<u8> = used
            .iter()
            .map(|si| {
                used.iter()
                    .filter(|sj| sj.index != si.index)
                    .fold(1u8, |acc, sj| gf_mul(acc, gf_div(sj.index, sj.index ^ si.index)))
            })
            .collect();

        let secret = (0..len)
            .map(|pos| {
                used.iter()
                    .zip(&basis)
                    .fold(0u8, |acc, (share, &l)| acc ^ gf_mul(share.value[pos], l))
            })
            .collect();

        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_tables() {
        // every non-zero element appears exactly once as a power of 3
        let mut seen = [false; 256];
        for &v in &EXP[..255] {
            assert!(!seen[v as usize]);
            seen[v as usize] = true;
        }
        assert!(!seen[0]);

        assert_eq!(gf_mul(0x57, 0x83), 0xc1); // FIPS-197 example
        for a in 1..=255u8 {
            assert_eq!(gf_mul(gf_div(1, a), a), 1);
        }
    }

    #[test]
    fn test_any_k_subset_recovers() {
        let sharing = ShamirGf256::new();
        let secret: Vec<u8> = (0..33).map(|i| (i * 37 + 5) as u8).collect();
        let shares = sharing.split(&secret, 5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        for a in 0..5 {
            for b in (a + 1)..5 {
                for c in (b + 1)..5 {
                    let subset = vec![shares[c].clone(), shares[a].clone(), shares[b].clone()];
                    assert_eq!(sharing.combine(&subset, 3).unwrap(), secret);
                }
            }
        }
    }

    #[test]
    fn test_threshold_one_and_n() {
        let sharing = ShamirGf256::new();
        let secret = b"0123456789abcdef".to_vec();

        let shares = sharing.split(&secret, 3, 1).unwrap();
        for share in &shares {
            assert_eq!(sharing.combine(std::slice::from_ref(share), 1).unwrap(), secret);
        }

        let shares = sharing.split(&secret, 4, 4).unwrap();
        assert_eq!(sharing.combine(&shares, 4).unwrap(), secret);
    }

    #[test]
    fn test_too_few_shares() {
        let sharing = ShamirGf256::new();
        let shares = sharing.split(b"secret", 3, 2).unwrap();
        assert!(matches!(
            sharing.combine(&shares[..1], 2),
            Err(Error::InsufficientShares { available: 1, required: 2 })
        ));
    }

    #[test]
    fn test_duplicate_share_rejected() {
        let sharing = ShamirGf256::new();
        let shares = sharing.split(b"secret", 3, 2).unwrap();
        let dup = vec![shares[0].clone(), shares[0].clone()];
        assert!(sharing.combine(&dup, 2).is_err());
    }

    #[test]
    fn test_invalid_threshold() {
        let sharing = ShamirGf256::new();
        assert!(sharing.split(b"x", 3, 0).is_err());
        assert!(sharing.split(b"x", 3, 4).is_err());
    }
}

//! Reed-Solomon block code behind the striper
//!
//! Provides the K-of-N encode/reconstruct capability for one round of packets.
//! Any K packets of a round can rebuild the K data packets.

use reed_solomon_erasure::galois_8::ReedSolomon;

use super::MAX_STRIPES;
use crate::error::{Error, Result};

/// K-of-N block code over equally sized packets
pub trait ErasureCode: Send + Sync {
    /// K, the number of data packets per round
    fn data_shards(&self) -> usize;

    /// N, the number of packets (data + parity) per round
    fn total_shards(&self) -> usize;

    /// Compute parity packets `[k..n]` from data packets `[0..k]`
    fn encode(&self, shards: &mut [Vec<u8>]) -> Result<()>;

    /// Rebuild every missing data packet in place
    ///
    /// Missing parity packets may stay `None`.
    fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()>;
}

/// Systematic Reed-Solomon code over GF(2^8)
pub struct ReedSolomonCode {
    /// `None` when N == K and there is no parity to compute
    rs: Option<ReedSolomon>,
    data_shards: usize,   // K
    parity_shards: usize, // N-K
}

impl ReedSolomonCode {
    /// Create a code with K data shards and N total shards
    ///
    /// # Errors
    /// Returns error unless `0 < K <= N <= 256`
    pub fn new(data_shards: usize, total_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::InvalidErasureConfig(
                "data_shards must be greater than 0".to_string(),
            ));
        }
        if total_shards < data_shards {
            return Err(Error::InvalidErasureConfig(format!(
                "total_shards ({}) must not be less than data_shards ({})",
                total_shards, data_shards
            )));
        }
        if total_shards > MAX_STRIPES {
            return Err(Error::InvalidErasureConfig(format!(
                "at most {} total shards supported, got {}",
                MAX_STRIPES, total_shards
            )));
        }

        let parity_shards = total_shards - data_shards;
        let rs = if parity_shards == 0 {
            None
        } else {
            Some(ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
                Error::InvalidErasureConfig(format!(
                    "Failed to create Reed-Solomon encoder: {:?}",
                    e
                ))
            })?)
        };

        Ok(Self {
            rs,
            data_shards,
            parity_shards,
        })
    }

    /// Check if enough packets are present to reconstruct
    pub fn can_reconstruct(&self, shards: &[Option<Vec<u8>>]) -> bool {
        shards.iter().filter(|s| s.is_some()).count() >= self.data_shards
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.total_shards() {
            return Err(Error::InvalidErasureConfig(format!(
                "Expected {} shards, got {}",
                self.total_shards(),
                len
            )));
        }
        Ok(())
    }
}

impl ErasureCode for ReedSolomonCode {
    fn data_shards(&self) -> usize {
        self.data_shards
    }

    fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    fn encode(&self, shards: &mut [Vec<u8>]) -> Result<()> {
        self.check_len(shards.len())?;
        if let Some(rs) = &self.rs {
            rs.encode(&mut *shards)
                .map_err(|e| Error::ErasureEncode(format!("Reed-Solomon encoding failed: {:?}", e)))?;
        }
        Ok(())
    }

    fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.check_len(shards.len())?;

        if !self.can_reconstruct(shards) {
            return Err(Error::InsufficientStripes {
                available: shards.iter().filter(|s| s.is_some()).count(),
                required: self.data_shards,
            });
        }

        match &self.rs {
            Some(rs) => rs.reconstruct_data(shards).map_err(|e| {
                Error::ErasureDecode(format!("Reed-Solomon reconstruction failed: {:?}", e))
            }),
            // Without parity every shard is a data shard and all are present
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(code: &ReedSolomonCode, packet: usize) -> Vec<Vec<u8>> {
        let mut shards: Vec<Vec<u8>> = (0..code.total_shards())
            .map(|i| {
                if i < code.data_shards() {
                    (0..packet).map(|b| (b * 7 + i * 31) as u8).collect()
                } else {
                    vec![0u8; packet]
                }
            })
            .collect();
        code.encode(&mut shards).unwrap();
        shards
    }

    #[test]
    fn test_code_creation() {
        assert!(ReedSolomonCode::new(2, 3).is_ok());
        assert!(ReedSolomonCode::new(5, 7).is_ok());
        assert!(ReedSolomonCode::new(3, 3).is_ok()); // no parity

        assert!(ReedSolomonCode::new(0, 3).is_err()); // K = 0
        assert!(ReedSolomonCode::new(5, 3).is_err()); // N < K
        assert!(ReedSolomonCode::new(10, 257).is_err());
    }

    #[test]
    fn test_reconstruct_missing_data_shards() {
        let code = ReedSolomonCode::new(3, 5).unwrap();
        let shards = encoded(&code, 64);

        let mut partial: Vec<Option<Vec<u8>>> = vec![
            None,
            Some(shards[1].clone()),
            None,
            Some(shards[3].clone()),
            Some(shards[4].clone()),
        ];
        code.reconstruct(&mut partial).unwrap();

        for i in 0..3 {
            assert_eq!(partial[i].as_ref().unwrap(), &shards[i]);
        }
    }

    #[test]
    fn test_not_enough_shards() {
        let code = ReedSolomonCode::new(3, 5).unwrap();
        let shards = encoded(&code, 16);

        let mut partial: Vec<Option<Vec<u8>>> = vec![
            Some(shards[0].clone()),
            None,
            None,
            None,
            Some(shards[4].clone()),
        ];

        match code.reconstruct(&mut partial) {
            Err(Error::InsufficientStripes { available, required }) => {
                assert_eq!(available, 2);
                assert_eq!(required, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_without_parity() {
        let code = ReedSolomonCode::new(2, 2).unwrap();
        let shards = encoded(&code, 8);

        let mut all: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        code.reconstruct(&mut all).unwrap();

        let mut missing: Vec<Option<Vec<u8>>> = vec![Some(shards[0].clone()), None];
        assert!(code.reconstruct(&mut missing).is_err());
    }

    #[test]
    fn test_wrong_shard_count() {
        let code = ReedSolomonCode::new(2, 3).unwrap();
        let mut shards = vec![vec![0u8; 4]; 2];
        assert!(code.encode(&mut shards).is_err());
    }

    #[test]
    fn test_accessors() {
        let code = ReedSolomonCode::new(5, 7).unwrap();
        assert_eq!(code.data_shards(), 5);
        assert_eq!(code.total_shards(), 7);
    }
}

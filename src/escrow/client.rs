//! Threshold key escrow across independent endpoints
//!
//! A file key is split into one share per endpoint, any `k` of which
//! rebuild it. Endpoints are contacted concurrently and independently; a
//! single failing endpoint never aborts an operation by itself.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::endpoint::{EscrowEndpoint, KeyShare};
use super::entry::entry_name;
use super::sharing::{SecretSharing, ShamirGf256, Share};
use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use crate::metadata::AclEntry;

/// Default bound on a single endpoint call
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a successful distribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub entry_name: String,
    pub threshold: u8,
    /// Shares actually stored
    pub stored: usize,
    /// Endpoints asked to store a share
    pub total: usize,
}

impl Distribution {
    /// Fewer than all endpoints hold a share
    pub fn is_degraded(&self) -> bool {
        self.stored < self.total
    }
}

/// Client for the set of escrow endpoints
pub struct KeyEscrow {
    endpoints: Vec<Arc<dyn EscrowEndpoint>>,
    sharing: Arc<dyn SecretSharing>,
    rpc_timeout: Duration,
}

impl KeyEscrow {
    /// Create an escrow client using Shamir sharing over GF(256)
    pub fn new(endpoints: Vec<Arc<dyn EscrowEndpoint>>, rpc_timeout: Duration) -> Self {
        Self::with_sharing(endpoints, Arc::new(ShamirGf256::new()), rpc_timeout)
    }

    pub fn with_sharing(
        endpoints: Vec<Arc<dyn EscrowEndpoint>>,
        sharing: Arc<dyn SecretSharing>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            endpoints,
            sharing,
            rpc_timeout,
        }
    }

    pub fn endpoints(&self) -> &[Arc<dyn EscrowEndpoint>] {
        &self.endpoints
    }

    /// Split `key` into one share per endpoint and store them.
    ///
    /// Fails with [`Error::InsufficientShares`] when fewer than `threshold`
    /// shares could be stored; whatever was stored is removed again.
    pub async fn distribute_key(
        &self,
        threshold: u8,
        key: &SymmetricKey,
        owner: &str,
        file_id: &str,
    ) -> Result<Distribution> {
        let total = self.endpoints.len();
        if total == 0 || total > u8::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "escrow needs 1..=255 endpoints, have {}",
                total
            )));
        }
        if threshold == 0 || threshold as usize > total {
            return Err(Error::InvalidConfig(format!(
                "escrow threshold {} not in 1..={}",
                threshold, total
            )));
        }

        let entry = entry_name(file_id, owner);
        let secret = encode_secret(key.key());
        let shares = self.sharing.split(&secret, total as u8, threshold)?;
        let acl = vec![AclEntry::owner(owner)];
        let iv = key.iv().map(<[u8]>::to_vec).unwrap_or_default();

        let puts = self
            .endpoints
            .iter()
            .zip(shares)
            .map(|(endpoint, share)| {
                let piece = KeyShare {
                    index: share.index,
                    value: share.value,
                    threshold,
                    entry_name: entry.clone(),
                    algorithm: key.algorithm().to_string(),
                    iv: iv.clone(),
                    acl: acl.clone(),
                };
                let entry = &entry;
                async move {
                    let result = self
                        .bounded(endpoint.name(), endpoint.put_key_piece(entry, &piece))
                        .await;
                    (endpoint.name(), result)
                }
            });

        let mut stored = 0;
        for (name, result) in join_all(puts).await {
            match result {
                Ok(()) => stored += 1,
                Err(e) => warn!("Failed to store key piece at {}: {}", name, e),
            }
        }

        if stored < threshold as usize {
            error!(
                "Key escrow for {} failed: only {}/{} shares stored, need {}",
                file_id, stored, total, threshold
            );
            self.force_remove_entries(owner, file_id).await;
            return Err(Error::InsufficientShares {
                available: stored,
                required: threshold as usize,
            });
        }

        if stored < total {
            warn!(
                "DEGRADED: key for {} escrowed at {}/{} endpoints (threshold {})",
                file_id, stored, total, threshold
            );
        } else {
            debug!("Key for {} escrowed at all {} endpoints", file_id, total);
        }

        Ok(Distribution {
            entry_name: entry,
            threshold,
            stored,
            total,
        })
    }

    /// Collect shares from every endpoint and rebuild the key.
    ///
    /// Succeeds whenever at least `k` consistent shares arrive, regardless
    /// of how many endpoints failed.
    pub async fn gather_key(&self, owner: &str, file_id: &str) -> Result<SymmetricKey> {
        let entry = entry_name(file_id, owner);

        let gets = self.endpoints.iter().map(|endpoint| {
            let entry = &entry;
            async move {
                let result = self
                    .bounded(endpoint.name(), endpoint.get_key_piece(entry))
                    .await;
                (endpoint.name(), result)
            }
        });

        let mut shares: BTreeMap<u8, KeyShare> = BTreeMap::new();
        let mut failures = 0;
        for (name, result) in join_all(gets).await {
            match result {
                Ok(share) if share.entry_name == entry => {
                    shares.entry(share.index).or_insert(share);
                }
                Ok(share) => {
                    failures += 1;
                    warn!(
                        "Endpoint {} returned share for {} instead of {}",
                        name, share.entry_name, entry
                    );
                }
                Err(e) => {
                    failures += 1;
                    warn!("Failed to fetch key piece from {}: {}", name, e);
                }
            }
        }

        let first = match shares.values().next() {
            Some(share) => share.clone(),
            None => {
                return Err(Error::InsufficientShares {
                    available: 0,
                    required: 1,
                })
            }
        };
        if shares.values().any(|s| {
            s.threshold != first.threshold || s.algorithm != first.algorithm || s.iv != first.iv
        }) {
            return Err(Error::InconsistentShares(format!(
                "shares for {} disagree on threshold or cipher parameters",
                file_id
            )));
        }

        let k = first.threshold as usize;
        if k == 0 {
            return Err(Error::InconsistentShares("share threshold is zero".to_string()));
        }
        if shares.len() < k {
            return Err(Error::InsufficientShares {
                available: shares.len(),
                required: k,
            });
        }
        if failures > 0 {
            info!(
                "Recovering key for {} from {} shares despite {} failed endpoints",
                file_id,
                shares.len(),
                failures
            );
        }

        let list: Vec<Share> = shares
            .values()
            .map(|s| Share {
                index: s.index,
                value: s.value.clone(),
            })
            .collect();
        let secret = Zeroizing::new(self.sharing.combine(&list[..k], first.threshold)?);
        if list.len() > k {
            let check = Zeroizing::new(self.sharing.combine(&list[list.len() - k..], first.threshold)?);
            if *check != *secret {
                return Err(Error::InconsistentShares(format!(
                    "share subsets for {} reconstruct different keys",
                    file_id
                )));
            }
        }

        let iv = (!first.iv.is_empty()).then(|| first.iv.clone());
        Ok(SymmetricKey::from_parts(
            decode_secret(&secret),
            first.algorithm,
            iv,
        ))
    }

    /// Remove the share set from every endpoint, reporting the first failure
    pub async fn remove_entries(&self, owner: &str, file_id: &str) -> Result<()> {
        let mut first_error = None;
        for (name, result) in self.remove_all(owner, file_id).await {
            if let Err(e) = result {
                warn!("Failed to remove key piece at {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove the share set from every endpoint, ignoring failures
    pub async fn force_remove_entries(&self, owner: &str, file_id: &str) {
        for (name, result) in self.remove_all(owner, file_id).await {
            if let Err(e) = result {
                debug!("Ignoring key piece removal failure at {}: {}", name, e);
            }
        }
    }

    /// Move a file key to a new file identity
    pub async fn rekey(
        &self,
        threshold: u8,
        owner: &str,
        old_file_id: &str,
        new_file_id: &str,
    ) -> Result<Distribution> {
        let key = self.gather_key(owner, old_file_id).await?;
        let distribution = self.distribute_key(threshold, &key, owner, new_file_id).await?;
        if let Err(e) = self.remove_entries(owner, old_file_id).await {
            warn!("Key for {} re-escrowed but old entries remain: {}", old_file_id, e);
        }
        Ok(distribution)
    }

    async fn remove_all(&self, owner: &str, file_id: &str) -> Vec<(&str, Result<()>)> {
        let entry = entry_name(file_id, owner);
        let removes = self.endpoints.iter().map(|endpoint| {
            let entry = &entry;
            async move {
                let result = self
                    .bounded(endpoint.name(), endpoint.remove_key_piece(entry))
                    .await;
                (endpoint.name(), result)
            }
        });
        join_all(removes).await
    }

    async fn bounded<T>(&self, endpoint: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "escrow endpoint {} did not answer within {:?}",
                endpoint, self.rpc_timeout
            ))),
        }
    }
}

/// Key bytes as an unsigned big-endian integer with one zero sign byte
fn encode_secret(key: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut secret = Zeroizing::new(Vec::with_capacity(key.len() + 1));
    secret.push(0);
    secret.extend_from_slice(key);
    secret
}

/// Strip exactly one leading zero sign byte, if present
fn decode_secret(secret: &[u8]) -> Vec<u8> {
    match secret.split_first() {
        Some((0, rest)) => rest.to_vec(),
        _ => secret.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DecryptingWriter, EncryptingReader, ALGORITHM, KEY_SIZE};
    use crate::escrow::MemoryEscrow;
    use async_trait::async_trait;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn memory_endpoints(n: usize) -> (Vec<Arc<MemoryEscrow>>, KeyEscrow) {
        let mems: Vec<Arc<MemoryEscrow>> = (0..n)
            .map(|i| Arc::new(MemoryEscrow::new(format!("escrow-{}", i))))
            .collect();
        let endpoints = mems
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn EscrowEndpoint>)
            .collect();
        (mems, KeyEscrow::new(endpoints, Duration::from_secs(5)))
    }

    struct StallingEscrow;

    #[async_trait]
    impl EscrowEndpoint for StallingEscrow {
        fn name(&self) -> &str {
            "stalling"
        }
        async fn put_key_piece(&self, _entry: &str, _share: &KeyShare) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
        async fn get_key_piece(&self, entry: &str) -> Result<KeyShare> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(Error::EntryNotFound(entry.to_string()))
        }
        async fn remove_key_piece(&self, _entry: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
        async fn version(&self) -> Result<String> {
            Ok("1.0".to_string())
        }
    }

    #[tokio::test]
    async fn test_distribute_and_gather() {
        let (mems, escrow) = memory_endpoints(3);
        let key = SymmetricKey::generate();

        let dist = escrow.distribute_key(2, &key, "alice", "file-1").await.unwrap();
        assert_eq!(dist.stored, 3);
        assert!(!dist.is_degraded());
        assert!(mems.iter().all(|m| m.contains(&dist.entry_name)));

        let gathered = escrow.gather_key("alice", "file-1").await.unwrap();
        assert_eq!(gathered.key(), key.key());
        assert_eq!(gathered.iv(), key.iv());
        assert_eq!(gathered.algorithm(), ALGORITHM);
    }

    #[tokio::test]
    async fn test_gather_with_endpoint_offline_decrypts() {
        let (mems, escrow) = memory_endpoints(3);
        let key = SymmetricKey::generate();
        assert_eq!(key.key().len(), 32);

        let plain = b"dispersed storage survives one escrow outage".to_vec();
        let mut reader = EncryptingReader::new(Cursor::new(plain.clone()), &key).unwrap();
        let mut cipher = Vec::new();
        reader.read_to_end(&mut cipher).await.unwrap();

        escrow.distribute_key(2, &key, "alice", "file-2").await.unwrap();
        mems[1].set_online(false);

        let gathered = escrow.gather_key("alice", "file-2").await.unwrap();
        let mut out = Vec::new();
        let mut writer = DecryptingWriter::new(&mut out, &gathered).unwrap();
        writer.write_all(&cipher).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        assert_eq!(out, plain);
    }

    #[tokio::test]
    async fn test_distribute_below_threshold_leaves_nothing() {
        let (mems, escrow) = memory_endpoints(3);
        mems[0].set_online(false);
        mems[2].set_online(false);

        let key = SymmetricKey::generate();
        let err = escrow.distribute_key(2, &key, "alice", "file-3").await.unwrap_err();
        assert!(matches!(err, Error::InsufficientShares { available: 1, required: 2 }));
        assert!(mems[1].is_empty());

        mems[0].set_online(true);
        mems[2].set_online(true);
        assert!(escrow.gather_key("alice", "file-3").await.is_err());
    }

    #[tokio::test]
    async fn test_degraded_distribute() {
        let (mems, escrow) = memory_endpoints(3);
        mems[2].set_online(false);

        let key = SymmetricKey::generate();
        let dist = escrow.distribute_key(2, &key, "bob", "file-4").await.unwrap();
        assert_eq!(dist.stored, 2);
        assert!(dist.is_degraded());

        mems[2].set_online(true);
        assert_eq!(escrow.gather_key("bob", "file-4").await.unwrap().key(), key.key());
    }

    #[tokio::test]
    async fn test_gather_below_threshold_fails() {
        let (mems, escrow) = memory_endpoints(3);
        let key = SymmetricKey::generate();
        escrow.distribute_key(3, &key, "alice", "file-5").await.unwrap();

        mems[0].set_online(false);
        let err = escrow.gather_key("alice", "file-5").await.unwrap_err();
        assert!(matches!(err, Error::InsufficientShares { available: 2, required: 3 }));
    }

    #[tokio::test]
    async fn test_leading_zero_key_survives() {
        let (_mems, escrow) = memory_endpoints(4);
        let mut raw = vec![0u8; KEY_SIZE];
        raw[2] = 0x42;
        raw[KEY_SIZE - 1] = 0xff;
        let key = SymmetricKey::from_parts(raw.clone(), ALGORITHM, Some(vec![9; 16]));

        escrow.distribute_key(3, &key, "carol", "file-6").await.unwrap();
        let gathered = escrow.gather_key("carol", "file-6").await.unwrap();
        assert_eq!(gathered.key(), raw.as_slice());
    }

    #[tokio::test]
    async fn test_tampered_share_detected() {
        let (mems, escrow) = memory_endpoints(3);
        let key = SymmetricKey::generate();
        let dist = escrow.distribute_key(2, &key, "alice", "file-7").await.unwrap();

        let mut piece = mems[0].get_key_piece(&dist.entry_name).await.unwrap();
        piece.value[5] ^= 0x01;
        mems[0].put_key_piece(&dist.entry_name, &piece).await.unwrap();

        assert!(matches!(
            escrow.gather_key("alice", "file-7").await,
            Err(Error::InconsistentShares(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_endpoint_times_out() {
        let mems: Vec<Arc<MemoryEscrow>> = (0..2)
            .map(|i| Arc::new(MemoryEscrow::new(format!("escrow-{}", i))))
            .collect();
        let mut endpoints: Vec<Arc<dyn EscrowEndpoint>> = mems
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn EscrowEndpoint>)
            .collect();
        endpoints.push(Arc::new(StallingEscrow));
        let escrow = KeyEscrow::new(endpoints, Duration::from_millis(50));

        let key = SymmetricKey::generate();
        let dist = escrow.distribute_key(2, &key, "dave", "file-8").await.unwrap();
        assert_eq!(dist.stored, 2);
        assert_eq!(escrow.gather_key("dave", "file-8").await.unwrap().key(), key.key());
    }

    #[tokio::test]
    async fn test_remove_entries() {
        let (mems, escrow) = memory_endpoints(3);
        let key = SymmetricKey::generate();
        escrow.distribute_key(2, &key, "alice", "file-9").await.unwrap();

        mems[1].set_online(false);
        assert!(escrow.remove_entries("alice", "file-9").await.is_err());
        escrow.force_remove_entries("alice", "file-9").await;
        assert!(mems[0].is_empty());
        assert!(!mems[1].is_empty());

        mems[1].set_online(true);
        escrow.remove_entries("alice", "file-9").await.unwrap();
        assert!(mems.iter().all(|m| m.is_empty()));
    }

    #[tokio::test]
    async fn test_rekey() {
        let (mems, escrow) = memory_endpoints(3);
        let key = SymmetricKey::generate();
        escrow.distribute_key(2, &key, "alice", "old").await.unwrap();

        escrow.rekey(2, "alice", "old", "new").await.unwrap();
        assert!(escrow.gather_key("alice", "old").await.is_err());
        assert_eq!(escrow.gather_key("alice", "new").await.unwrap().key(), key.key());
        assert!(mems.iter().all(|m| m.len() == 1));
    }

    #[test]
    fn test_secret_encoding() {
        assert_eq!(*encode_secret(&[0, 1]), vec![0, 0, 1]);
        assert_eq!(decode_secret(&[0, 0, 1]), vec![0, 1]);
        assert_eq!(decode_secret(&[5, 1]), vec![5, 1]);
        assert!(decode_secret(&[]).is_empty());
    }
}

//! Escrow endpoints holding one key share each

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::metadata::AclEntry;

/// Protocol version reported by the bundled endpoints
pub const ESCROW_VERSION: &str = "1.0";

/// One share of a file key as stored at a single endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    /// Share index, 1..=n
    pub index: u8,

    /// Share value
    #[serde(with = "hex_serde")]
    pub value: Vec<u8>,

    /// Shares needed to recombine (k)
    pub threshold: u8,

    /// Entry name the share set is addressed by
    pub entry_name: String,

    /// Cipher the key belongs to
    pub algorithm: String,

    /// Initialization vector of the key, empty if none
    #[serde(with = "hex_serde", default)]
    pub iv: Vec<u8>,

    /// Principals allowed to read or replace the share
    #[serde(default)]
    pub acl: Vec<AclEntry>,
}

/// Capability of one escrow server
#[async_trait]
pub trait EscrowEndpoint: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    async fn put_key_piece(&self, entry: &str, share: &KeyShare) -> Result<()>;

    async fn get_key_piece(&self, entry: &str) -> Result<KeyShare>;

    /// Remove a share; removing an absent entry succeeds
    async fn remove_key_piece(&self, entry: &str) -> Result<()>;

    async fn version(&self) -> Result<String>;
}

/// In-process escrow endpoint
///
/// Can be switched offline to simulate an unreachable server.
pub struct MemoryEscrow {
    name: String,
    entries: DashMap<String, KeyShare>,
    online: AtomicBool,
}

impl MemoryEscrow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains_key(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::EscrowEndpoint {
                endpoint: self.name.clone(),
                reason: "endpoint offline".to_string(),
            })
        }
    }
}

#[async_trait]
impl EscrowEndpoint for MemoryEscrow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_key_piece(&self, entry: &str, share: &KeyShare) -> Result<()> {
        self.check_online()?;
        self.entries.insert(entry.to_string(), share.clone());
        Ok(())
    }

    async fn get_key_piece(&self, entry: &str) -> Result<KeyShare> {
        self.check_online()?;
        self.entries
            .get(entry)
            .map(|share| share.value().clone())
            .ok_or_else(|| Error::EntryNotFound(entry.to_string()))
    }

    async fn remove_key_piece(&self, entry: &str) -> Result<()> {
        self.check_online()?;
        self.entries.remove(entry);
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        self.check_online()?;
        Ok(ESCROW_VERSION.to_string())
    }
}

/// Escrow endpoint keeping one JSON document per entry in a directory
pub struct DirectoryEscrow {
    name: String,
    root: PathBuf,
}

impl DirectoryEscrow {
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            root: root.as_ref().to_path_buf(),
        }
    }

    fn entry_path(&self, entry: &str) -> PathBuf {
        let file: String = entry
            .chars()
            .map(|c| if c == '/' || c == '\0' { '_' } else { c })
            .collect();
        self.root.join(format!("{}.json", file))
    }

    fn endpoint_error(&self, e: impl std::fmt::Display) -> Error {
        Error::EscrowEndpoint {
            endpoint: self.name.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl EscrowEndpoint for DirectoryEscrow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_key_piece(&self, entry: &str, share: &KeyShare) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| self.endpoint_error(e))?;

        let path = self.entry_path(entry);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(share)?;
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| self.endpoint_error(e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| self.endpoint_error(e))?;

        debug!("Stored key piece {} at {:?}", share.index, path);
        Ok(())
    }

    async fn get_key_piece(&self, entry: &str) -> Result<KeyShare> {
        match tokio::fs::read(self.entry_path(entry)).await {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::EntryNotFound(entry.to_string()))
            }
            Err(e) => Err(self.endpoint_error(e)),
        }
    }

    async fn remove_key_piece(&self, entry: &str) -> Result<()> {
        match tokio::fs::remove_file(self.entry_path(entry)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.endpoint_error(e)),
        }
    }

    async fn version(&self) -> Result<String> {
        if tokio::fs::metadata(&self.root).await.is_err() {
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| self.endpoint_error(e))?;
        }
        Ok(ESCROW_VERSION.to_string())
    }
}

mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn share(index: u8) -> KeyShare {
        KeyShare {
            index,
            value: vec![index, 0xde, 0xad],
            threshold: 2,
            entry_name: "entry".to_string(),
            algorithm: "AES-256-CBC".to_string(),
            iv: vec![1; 16],
            acl: vec![AclEntry::owner("alice")],
        }
    }

    #[tokio::test]
    async fn test_memory_escrow() {
        let escrow = MemoryEscrow::new("mem-0");
        escrow.put_key_piece("e1", &share(1)).await.unwrap();
        assert_eq!(escrow.get_key_piece("e1").await.unwrap(), share(1));
        assert!(matches!(
            escrow.get_key_piece("missing").await,
            Err(Error::EntryNotFound(_))
        ));

        escrow.set_online(false);
        assert!(escrow.get_key_piece("e1").await.is_err());
        assert!(escrow.version().await.is_err());

        escrow.set_online(true);
        escrow.remove_key_piece("e1").await.unwrap();
        escrow.remove_key_piece("e1").await.unwrap();
        assert!(escrow.is_empty());
    }

    #[tokio::test]
    async fn test_directory_escrow() {
        let dir = TempDir::new().unwrap();
        let escrow = DirectoryEscrow::new("dir-0", dir.path().join("escrow"));
        assert_eq!(escrow.version().await.unwrap(), ESCROW_VERSION);

        let entry = "some/file#user_abc";
        escrow.put_key_piece(entry, &share(3)).await.unwrap();
        assert_eq!(escrow.get_key_piece(entry).await.unwrap(), share(3));

        escrow.remove_key_piece(entry).await.unwrap();
        assert!(matches!(
            escrow.get_key_piece(entry).await,
            Err(Error::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_share_json_uses_hex() {
        let json = serde_json::to_string(&share(2)).unwrap();
        assert!(json.contains("\"value\":\"02dead\""));
        let back: KeyShare = serde_json::from_str(&json).unwrap();
        assert_eq!(back, share(2));
    }
}

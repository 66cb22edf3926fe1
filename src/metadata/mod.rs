//! File metadata
//!
//! File records (tree of files and directories with ACLs and stripe
//! locations) live in a metadata service. The orchestrator only uses the
//! small get/put/list capability below; [`MetadataStore`] implements it on
//! top of sled.

mod store;

pub use store::MetadataStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::StripeLocation;

/// Opaque file identity
pub type FileId = Uuid;

/// Access rights of one principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub principal: String,
    pub read: bool,
    pub write: bool,
}

impl AclEntry {
    /// Full access, as granted to the uploading user
    pub fn owner(principal: impl Into<String>) -> Self {
        AclEntry {
            principal: principal.into(),
            read: true,
            write: true,
        }
    }

    pub fn read_only(principal: impl Into<String>) -> Self {
        AclEntry {
            principal: principal.into(),
            read: true,
            write: false,
        }
    }
}

/// The calling user and the roots of their trees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub roots: Vec<FileId>,
}

/// One file or directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub parent: Option<FileId>,
    pub directory: bool,
    pub acl: Vec<AclEntry>,

    /// Service level the stripes were written under
    pub sla: String,
    /// Stripes needed for reconstruction (k)
    pub min_stripes: usize,
    /// Packet size used for every stripe
    pub block_size: usize,
    /// Bytes added past the (possibly encrypted) length before striping
    pub pad_length: u64,
    /// Pad bytes the striper reported
    pub stripe_pad_length: u64,
    /// Plaintext length
    pub length: u64,
    pub encrypted: bool,
    /// One location per stripe index
    pub stripes: Vec<StripeLocation>,

    /// Child ids, for directories
    pub children: Vec<FileId>,
    pub owner: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl FileRecord {
    /// New, empty file record owned by `owner`
    pub fn new_file(name: impl Into<String>, parent: Option<FileId>, owner: &str) -> Self {
        let now = Utc::now();
        FileRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            parent,
            directory: false,
            acl: vec![AclEntry::owner(owner)],
            sla: String::new(),
            min_stripes: 0,
            block_size: 0,
            pad_length: 0,
            stripe_pad_length: 0,
            length: 0,
            encrypted: false,
            stripes: Vec::new(),
            children: Vec::new(),
            owner: owner.to_string(),
            created: now,
            modified: now,
        }
    }

    pub fn new_directory(name: impl Into<String>, parent: Option<FileId>, owner: &str) -> Self {
        FileRecord {
            directory: true,
            ..Self::new_file(name, parent, owner)
        }
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn add_child(&mut self, id: FileId) {
        if !self.children.contains(&id) {
            self.children.push(id);
        }
        self.touch();
    }

    /// Returns whether `id` was a child
    pub fn remove_child(&mut self, id: FileId) -> bool {
        let before = self.children.len();
        self.children.retain(|c| *c != id);
        self.touch();
        self.children.len() != before
    }

    pub fn touch(&mut self) {
        self.modified = Utc::now();
    }

    /// Length of the data that was striped (ciphertext when encrypted)
    pub fn striped_length(&self) -> u64 {
        self.length + self.pad_length - self.stripe_pad_length
    }
}

/// Metadata service capability
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// The calling user
    async fn user_info(&self) -> Result<UserInfo>;

    async fn get_file(&self, id: FileId) -> Result<FileRecord>;

    /// Store a new record
    async fn put_file(&self, record: &FileRecord) -> Result<()>;

    /// Replace an existing record
    async fn update_file(&self, record: &FileRecord) -> Result<()>;

    /// Children of a directory
    async fn list_files(&self, id: FileId) -> Result<Vec<FileRecord>>;

    /// Resolve `/root/dir/name`
    async fn get_file_by_path(&self, path: &str) -> Result<FileRecord>;

    /// Forget a record
    async fn remove_file(&self, id: FileId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children() {
        let mut dir = FileRecord::new_directory("docs", None, "alice");
        let child = Uuid::new_v4();
        dir.add_child(child);
        dir.add_child(child);
        assert_eq!(dir.children, vec![child]);
        assert!(dir.remove_child(child));
        assert!(!dir.remove_child(child));
        assert!(dir.is_directory());
    }

    #[test]
    fn test_striped_length() {
        let mut file = FileRecord::new_file("a.bin", None, "alice");
        file.length = 1000;
        file.pad_length = 256;
        file.stripe_pad_length = 240;
        assert_eq!(file.striped_length(), 1016);
        assert_eq!(file.acl, vec![AclEntry::owner("alice")]);
    }
}

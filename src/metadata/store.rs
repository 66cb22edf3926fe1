//! Sled-based metadata store
//!
//! Records are bincode-encoded and keyed by file id. Each user has one
//! root directory named after them, created on first open.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use sled::{Db, Tree};
use tracing::{debug, info};

use super::{FileId, FileRecord, MetadataService, UserInfo};
use crate::error::{Error, Result};

/// Metadata store using sled
pub struct MetadataStore {
    /// Sled database
    db: Db,
    /// File records by id
    records: Tree,
    /// User info by name
    users: Tree,
    /// User this store acts for
    user: String,
    /// In-memory record cache
    cache: RwLock<HashMap<FileId, FileRecord>>,
}

impl MetadataStore {
    /// Open or create a metadata store
    pub fn open<P: AsRef<Path>>(path: P, user: &str) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self::with_db(db, user)?;
        info!(
            "Metadata store opened at {:?}, {} records",
            path.as_ref(),
            store.records.len()
        );
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory(user: &str) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, user)
    }

    fn with_db(db: Db, user: &str) -> Result<Self> {
        let records = db.open_tree("records")?;
        let users = db.open_tree("users")?;

        let store = MetadataStore {
            db,
            records,
            users,
            user: user.to_string(),
            cache: RwLock::new(HashMap::new()),
        };
        store.init_user()?;
        Ok(store)
    }

    /// Make sure the user exists and owns a root directory
    fn init_user(&self) -> Result<()> {
        if self.load_user()?.is_some() {
            return Ok(());
        }
        let root = FileRecord::new_directory(self.user.clone(), None, &self.user);
        self.save_record(&root)?;
        let info = UserInfo {
            name: self.user.clone(),
            roots: vec![root.id],
        };
        self.users
            .insert(self.user.as_bytes(), bincode::serialize(&info)?)?;
        info!("Root directory initialized for {}", self.user);
        Ok(())
    }

    fn load_user(&self) -> Result<Option<UserInfo>> {
        match self.users.get(self.user.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn save_record(&self, record: &FileRecord) -> Result<()> {
        self.records
            .insert(record.id.as_bytes(), bincode::serialize(record)?)?;
        self.cache.write().insert(record.id, record.clone());
        debug!("Saved record {} ({})", record.id, record.name);
        Ok(())
    }

    fn load_record(&self, id: FileId) -> Result<Option<FileRecord>> {
        if let Some(record) = self.cache.read().get(&id) {
            return Ok(Some(record.clone()));
        }
        match self.records.get(id.as_bytes())? {
            Some(data) => {
                let record: FileRecord = bincode::deserialize(&data)?;
                self.cache.write().insert(id, record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// The user's first root directory
    pub fn root(&self) -> Result<FileRecord> {
        let info = self
            .load_user()?
            .ok_or_else(|| Error::PathNotFound(format!("/{}", self.user)))?;
        let id = info
            .roots
            .first()
            .copied()
            .ok_or_else(|| Error::PathNotFound(format!("/{}", self.user)))?;
        self.load_record(id)?
            .ok_or_else(|| Error::FileNotFound(id.to_string()))
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl MetadataService for MetadataStore {
    async fn user_info(&self) -> Result<UserInfo> {
        self.load_user()?
            .ok_or_else(|| Error::PathNotFound(format!("/{}", self.user)))
    }

    async fn get_file(&self, id: FileId) -> Result<FileRecord> {
        self.load_record(id)?
            .ok_or_else(|| Error::FileNotFound(id.to_string()))
    }

    async fn put_file(&self, record: &FileRecord) -> Result<()> {
        if self.records.contains_key(record.id.as_bytes())? {
            return Err(Error::AlreadyExists(record.id.to_string()));
        }
        self.save_record(record)
    }

    async fn update_file(&self, record: &FileRecord) -> Result<()> {
        if !self.records.contains_key(record.id.as_bytes())? {
            return Err(Error::FileNotFound(record.id.to_string()));
        }
        self.save_record(record)
    }

    async fn list_files(&self, id: FileId) -> Result<Vec<FileRecord>> {
        let dir = self.get_file(id).await?;
        if !dir.is_directory() {
            return Err(Error::NotADirectory(dir.name));
        }
        let mut children = Vec::with_capacity(dir.children.len());
        for child in &dir.children {
            match self.load_record(*child)? {
                Some(record) => children.push(record),
                None => debug!("Dangling child {} in {}", child, dir.name),
            }
        }
        Ok(children)
    }

    async fn get_file_by_path(&self, path: &str) -> Result<FileRecord> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let root_name = parts
            .next()
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;

        let info = self.user_info().await?;
        let mut current = None;
        for id in &info.roots {
            if let Some(root) = self.load_record(*id)? {
                if root.name == root_name {
                    current = Some(root);
                    break;
                }
            }
        }
        let mut current = current.ok_or_else(|| Error::PathNotFound(path.to_string()))?;

        for part in parts {
            if !current.is_directory() {
                return Err(Error::NotADirectory(current.name));
            }
            current = self
                .list_files(current.id)
                .await?
                .into_iter()
                .find(|child| child.name == part)
                .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    async fn remove_file(&self, id: FileId) -> Result<()> {
        self.records.remove(id.as_bytes())?;
        self.cache.write().remove(&id);
        debug!("Removed record {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_store() {
        let store = MetadataStore::in_memory("alice").unwrap();

        // Root should exist
        let info = store.user_info().await.unwrap();
        assert_eq!(info.roots.len(), 1);
        let root = store.get_file(info.roots[0]).await.unwrap();
        assert!(root.is_directory());
        assert_eq!(root.name, "alice");
    }

    #[tokio::test]
    async fn test_put_get_update() {
        let store = MetadataStore::in_memory("alice").unwrap();
        let root = store.root().unwrap();

        let mut file = FileRecord::new_file("a.txt", Some(root.id), "alice");
        store.put_file(&file).await.unwrap();
        assert!(matches!(
            store.put_file(&file).await,
            Err(Error::AlreadyExists(_))
        ));

        file.length = 42;
        store.update_file(&file).await.unwrap();
        assert_eq!(store.get_file(file.id).await.unwrap().length, 42);

        let stranger = FileRecord::new_file("b.txt", None, "alice");
        assert!(matches!(
            store.update_file(&stranger).await,
            Err(Error::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_path_lookup_and_listing() {
        let store = MetadataStore::in_memory("alice").unwrap();
        let mut root = store.root().unwrap();

        let mut docs = FileRecord::new_directory("docs", Some(root.id), "alice");
        let file = FileRecord::new_file("plan.txt", Some(docs.id), "alice");
        docs.add_child(file.id);
        root.add_child(docs.id);
        store.put_file(&docs).await.unwrap();
        store.put_file(&file).await.unwrap();
        store.update_file(&root).await.unwrap();

        let found = store.get_file_by_path("/alice/docs/plan.txt").await.unwrap();
        assert_eq!(found.id, file.id);
        assert_eq!(store.get_file_by_path("/alice").await.unwrap().id, root.id);
        assert!(matches!(
            store.get_file_by_path("/alice/docs/missing").await,
            Err(Error::PathNotFound(_))
        ));
        assert!(matches!(
            store.get_file_by_path("/alice/docs/plan.txt/x").await,
            Err(Error::NotADirectory(_))
        ));

        let listing = store.list_files(root.id).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "docs");
    }

    #[tokio::test]
    async fn test_remove_file() {
        let store = MetadataStore::in_memory("alice").unwrap();
        let file = FileRecord::new_file("gone.txt", None, "alice");
        store.put_file(&file).await.unwrap();
        store.remove_file(file.id).await.unwrap();
        assert!(store.get_file(file.id).await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.db");

        let id = {
            let store = MetadataStore::open(&path, "alice").unwrap();
            let file = FileRecord::new_file("keep.txt", None, "alice");
            store.put_file(&file).await.unwrap();
            store.flush().unwrap();
            file.id
        };

        let store = MetadataStore::open(&path, "alice").unwrap();
        assert_eq!(store.get_file(id).await.unwrap().name, "keep.txt");
        assert_eq!(store.user_info().await.unwrap().roots.len(), 1);
    }
}

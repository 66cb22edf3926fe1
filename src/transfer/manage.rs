//! Tree operations: directories, listing, lookup, move and delete

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::progress::Progress;
use super::Orchestrator;
use crate::error::{Error, Result};
use crate::metadata::{FileId, FileRecord};
use crate::storage::{TransferObserver, TransferState};

impl Orchestrator {
    /// Create directory `name` under `parent`
    pub async fn create_directory(&self, parent: FileId, name: &str) -> Result<FileRecord> {
        let user = self.ctx.metadata.user_info().await?;
        let parent_record = self.ctx.metadata.get_file(parent).await?;
        if !parent_record.is_directory() {
            return Err(Error::NotADirectory(parent_record.name));
        }
        check_name(name)?;
        self.check_free_name(&parent_record, name).await?;

        let dir = FileRecord::new_directory(name, Some(parent), &user.name);
        self.ctx.metadata.put_file(&dir).await?;
        self.link_child(parent, dir.id).await?;
        debug!("Created directory {} in {}", name, parent_record.name);
        Ok(dir)
    }

    pub async fn list_directory(&self, id: FileId) -> Result<Vec<FileRecord>> {
        self.ctx.metadata.list_files(id).await
    }

    /// Resolve `/root/dir/name`
    pub async fn find(&self, path: &str) -> Result<FileRecord> {
        self.ctx.metadata.get_file_by_path(path).await
    }

    /// The user's first root directory
    pub async fn root(&self) -> Result<FileRecord> {
        let user = self.ctx.metadata.user_info().await?;
        let id = user
            .roots
            .first()
            .copied()
            .ok_or_else(|| Error::PathNotFound(format!("/{}", user.name)))?;
        self.ctx.metadata.get_file(id).await
    }

    /// Slash-joined path from the root down to `id`
    pub async fn canonical_name(&self, id: FileId) -> Result<String> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(next) = current {
            let record = self.ctx.metadata.get_file(next).await?;
            if names.len() > 4096 {
                return Err(Error::Internal(format!("parent cycle at {}", record.id)));
            }
            names.push(record.name);
            current = record.parent;
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    /// Rename in place
    pub async fn rename(&self, id: FileId, new_name: &str) -> Result<FileRecord> {
        check_name(new_name)?;
        let mut record = self.ctx.metadata.get_file(id).await?;
        if record.name == new_name {
            return Ok(record);
        }
        if let Some(parent) = record.parent {
            let parent_record = self.ctx.metadata.get_file(parent).await?;
            self.check_free_name(&parent_record, new_name).await?;
        }
        record.name = new_name.to_string();
        record.touch();
        self.ctx.metadata.update_file(&record).await?;
        Ok(record)
    }

    /// Move a file or directory under `target`, optionally renaming it
    pub async fn move_entry(
        &self,
        id: FileId,
        target: FileId,
        new_name: Option<&str>,
    ) -> Result<FileRecord> {
        let record = self.ctx.metadata.get_file(id).await?;
        if record.is_directory() {
            self.move_directory(record, target, new_name).await
        } else {
            self.move_file(record, target, new_name).await
        }
    }

    /// A file moved to another directory gets a new identity and its key
    /// is escrowed again under it
    pub async fn move_file(
        &self,
        record: FileRecord,
        target: FileId,
        new_name: Option<&str>,
    ) -> Result<FileRecord> {
        if record.is_directory() {
            return Err(Error::NotAFile(record.name));
        }
        let name = new_name.unwrap_or(record.name.as_str()).to_string();
        if record.parent == Some(target) {
            return self.rename(record.id, &name).await;
        }

        let target_record = self.directory(target).await?;
        check_name(&name)?;
        self.check_free_name(&target_record, &name).await?;
        let user = self.ctx.metadata.user_info().await?;

        let mut moved = FileRecord::new_file(name, Some(target), &user.name);
        moved.sla = record.sla.clone();
        moved.min_stripes = record.min_stripes;
        moved.block_size = record.block_size;
        moved.pad_length = record.pad_length;
        moved.stripe_pad_length = record.stripe_pad_length;
        moved.length = record.length;
        moved.encrypted = record.encrypted;
        moved.stripes = record.stripes.clone();
        moved.created = record.created;

        if record.encrypted {
            let distribution = self
                .ctx
                .escrow
                .rekey(
                    self.ctx.escrow_threshold,
                    &record.owner,
                    &record.id.to_string(),
                    &moved.id.to_string(),
                )
                .await?;
            if distribution.is_degraded() {
                warn!(
                    "Key for {} escrowed on {} of {} endpoints only",
                    moved.name, distribution.stored, distribution.total
                );
            }
        }

        self.ctx.metadata.put_file(&moved).await?;
        self.link_child(target, moved.id).await?;
        if let Some(parent) = record.parent {
            self.unlink_child(parent, record.id).await?;
        }
        self.ctx.metadata.remove_file(record.id).await?;

        info!("Moved {} to {}", record.name, target_record.name);
        Ok(moved)
    }

    /// Directories keep their identity; only the parent links change
    pub async fn move_directory(
        &self,
        mut record: FileRecord,
        target: FileId,
        new_name: Option<&str>,
    ) -> Result<FileRecord> {
        if !record.is_directory() {
            return Err(Error::NotADirectory(record.name));
        }
        let name = new_name.unwrap_or(record.name.as_str()).to_string();
        if record.parent == Some(target) {
            return self.rename(record.id, &name).await;
        }
        let old_parent = record
            .parent
            .ok_or_else(|| Error::NotPermitted(format!("cannot move root {}", record.name)))?;

        let target_record = self.directory(target).await?;
        check_name(&name)?;
        self.check_free_name(&target_record, &name).await?;

        // Refuse to move a directory below itself
        let mut cursor = Some(target);
        while let Some(ancestor) = cursor {
            if ancestor == record.id {
                return Err(Error::NotPermitted(format!(
                    "cannot move {} into itself",
                    record.name
                )));
            }
            cursor = self.ctx.metadata.get_file(ancestor).await?.parent;
        }

        record.name = name;
        record.parent = Some(target);
        record.touch();
        self.ctx.metadata.update_file(&record).await?;
        self.link_child(target, record.id).await?;
        self.unlink_child(old_parent, record.id).await?;

        info!("Moved directory {} to {}", record.name, target_record.name);
        Ok(record)
    }

    /// Delete a file with its stripes and key, or an empty directory
    pub async fn delete(
        &self,
        id: FileId,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<()> {
        let progress = Progress::new(observer);
        progress.state(TransferState::Initializing);
        let result = self.delete_entry(id, &progress).await;
        progress.finish(&result);
        result
    }

    async fn delete_entry(&self, id: FileId, progress: &Progress) -> Result<()> {
        let record = self.ctx.metadata.get_file(id).await?;
        let parent = record
            .parent
            .ok_or_else(|| Error::NotPermitted(format!("cannot delete root {}", record.name)))?;

        if record.is_directory() {
            if !record.children.is_empty() {
                return Err(Error::DirectoryNotEmpty(record.name));
            }
        } else {
            progress.state(TransferState::Active);
            self.delete_stripes(&record, progress).await?;

            if record.encrypted {
                if let Err(e) = self
                    .ctx
                    .escrow
                    .remove_entries(&record.owner, &record.id.to_string())
                    .await
                {
                    warn!("Key pieces of {} not fully removed: {}", record.name, e);
                }
            }
        }

        self.unlink_child(parent, record.id).await?;
        self.ctx.metadata.remove_file(record.id).await?;
        info!("Deleted {}", record.name);
        Ok(())
    }

    /// Remove every reachable stripe; a reachable stripe that cannot be
    /// removed fails the whole delete
    async fn delete_stripes(&self, record: &FileRecord, progress: &Progress) -> Result<()> {
        let total = record.stripes.len().max(1);
        for (index, location) in record.stripes.iter().enumerate() {
            let handle = self
                .ctx
                .pool
                .get_storage_client(Some(&location.uri), location.kind, Some(&location.version))
                .await;
            let Some(handle) = handle else {
                warn!("No backend reachable for stripe {}, skipping", location.uri);
                continue;
            };

            let result = handle.delete_file(location.object_name()).await;
            self.ctx.pool.return_storage(handle).await;
            match result {
                Ok(()) => {}
                Err(Error::BackendUnavailable(reason)) => {
                    warn!("Backend for stripe {} unreachable, skipping: {}", location.uri, reason);
                    continue;
                }
                Err(e) => return Err(Error::DeleteFailed(format!("{}: {}", location.uri, e))),
            }
            progress.advance(
                ((index + 1) * 90 / total) as u8,
                TransferState::IntermediateResult,
            );
        }
        Ok(())
    }

    /// Best-effort removal of an uploaded file's stripes and key
    pub(super) async fn discard_data(&self, record: &FileRecord) {
        let progress = Progress::new(None);
        if let Err(e) = self.delete_stripes(record, &progress).await {
            warn!("Could not discard stripes of {}: {}", record.name, e);
        }
        if record.encrypted {
            self.ctx
                .escrow
                .force_remove_entries(&record.owner, &record.id.to_string())
                .await;
        }
    }

    async fn directory(&self, id: FileId) -> Result<FileRecord> {
        let record = self.ctx.metadata.get_file(id).await?;
        if !record.is_directory() {
            return Err(Error::NotADirectory(record.name));
        }
        Ok(record)
    }

    pub(super) async fn check_free_name(&self, parent: &FileRecord, name: &str) -> Result<()> {
        let taken = self
            .ctx
            .metadata
            .list_files(parent.id)
            .await?
            .iter()
            .any(|child| child.name == name);
        if taken {
            return Err(Error::AlreadyExists(format!("{}/{}", parent.name, name)));
        }
        Ok(())
    }

    pub(super) async fn link_child(&self, parent: FileId, child: FileId) -> Result<()> {
        let mut parent = self.ctx.metadata.get_file(parent).await?;
        parent.add_child(child);
        self.ctx.metadata.update_file(&parent).await
    }

    async fn unlink_child(&self, parent: FileId, child: FileId) -> Result<()> {
        let mut parent = self.ctx.metadata.get_file(parent).await?;
        if parent.remove_child(child) {
            self.ctx.metadata.update_file(&parent).await?;
        }
        Ok(())
    }
}

pub(super) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::PathNotFound(format!("invalid name {:?}", name)));
    }
    Ok(())
}

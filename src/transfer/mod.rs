//! Upload/download orchestration
//!
//! An upload acquires `n` backend handles for the file's service level,
//! optionally encrypts the source under a fresh escrowed key, stripes it onto
//! the handles, waits for every stripe to commit and verifies each one before
//! the metadata record is written. A download opens whatever stripes are
//! reachable and rebuilds the file from any `k` of them.

mod manage;
mod progress;

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::context::StoreContext;
use crate::crypto::{DecryptingWriter, EncryptingReader, SymmetricKey, BLOCK_SIZE};
use crate::erasure::{stripe_len, Striper};
use crate::error::{Error, Result};
use crate::metadata::{FileId, FileRecord};
use crate::pool::ServiceLevel;
use crate::storage::{DataReader, StorageClient, StripeLocation, TransferObserver, TransferState};

use progress::Progress;

/// Per-upload choices
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub sla: ServiceLevel,
    /// Name in the parent directory, defaults to the source file name
    pub name: Option<String>,
    /// Overrides the service level's encryption default
    pub encrypt: Option<bool>,
}

impl UploadOptions {
    pub fn new(sla: ServiceLevel) -> Self {
        Self {
            sla,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = Some(encrypt);
        self
    }
}

/// Object name of stripe `index` of a file
pub fn stripe_name(id: FileId, index: usize) -> String {
    format!("{}.{}", id, index)
}

/// Drives uploads, downloads and tree operations against a [`StoreContext`]
pub struct Orchestrator {
    ctx: Arc<StoreContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    /// Upload a local file into directory `parent`
    pub async fn upload(
        &self,
        source: &Path,
        parent: FileId,
        options: &UploadOptions,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<FileRecord> {
        let progress = Progress::new(observer);
        progress.state(TransferState::Initializing);
        let result = self.upload_file(source, parent, options, &progress).await;
        progress.finish(&result);
        result
    }

    async fn upload_file(
        &self,
        source: &Path,
        parent: FileId,
        options: &UploadOptions,
        progress: &Progress,
    ) -> Result<FileRecord> {
        let user = self.ctx.metadata.user_info().await?;
        let parent_record = self.ctx.metadata.get_file(parent).await?;
        if !parent_record.is_directory() {
            return Err(Error::NotADirectory(parent_record.name));
        }

        let name = match &options.name {
            Some(name) => name.clone(),
            None => source
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| Error::NotAFile(source.display().to_string()))?,
        };
        manage::check_name(&name)?;
        self.check_free_name(&parent_record, &name).await?;

        let length = match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(Error::NotAFile(source.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::PathNotFound(source.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let encrypt = options.encrypt.unwrap_or(options.sla.encrypt);

        let mut record = FileRecord::new_file(name, Some(parent), &user.name);
        let attempts = self.ctx.transfer.retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .upload_once(source, length, encrypt, &options.sla, &mut record, progress)
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Upload of {} failed, retrying ({}/{}): {}",
                        record.name, attempt, attempts, e
                    );
                    tokio::time::sleep(self.ctx.poll_interval()).await;
                }
                Err(e) => {
                    error!("Upload of {} failed after {} attempts: {}", record.name, attempt, e);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.commit_record(&record).await {
            error!("Metadata update for {} failed: {}", record.name, e);
            self.discard_data(&record).await;
            return Err(e);
        }

        info!(
            "Uploaded {} ({} bytes, {} of {} stripes, encrypted: {})",
            record.name,
            record.length,
            record.min_stripes,
            record.stripes.len(),
            record.encrypted
        );
        Ok(record)
    }

    async fn commit_record(&self, record: &FileRecord) -> Result<()> {
        self.ctx.metadata.put_file(record).await?;
        if let Some(parent) = record.parent {
            self.link_child(parent, record.id).await?;
        }
        Ok(())
    }

    /// One attempt: stripes written, committed and verified, or nothing left behind
    async fn upload_once(
        &self,
        source: &Path,
        length: u64,
        encrypt: bool,
        sla: &ServiceLevel,
        record: &mut FileRecord,
        progress: &Progress,
    ) -> Result<()> {
        let transfer = &self.ctx.transfer;
        record.sla = sla.name.clone();
        record.min_stripes = sla.data_stripes;
        record.block_size = transfer.packet_size;
        record.pad_length = transfer.pad_length;
        record.length = length;
        record.encrypted = encrypt && length > 0;
        record.stripe_pad_length = 0;
        record.stripes.clear();

        if length == 0 {
            debug!("{} is empty, nothing to stripe", record.name);
            return Ok(());
        }
        if record.encrypted && transfer.pad_length < BLOCK_SIZE as u64 {
            return Err(Error::InvalidConfig(format!(
                "pad length {} cannot hold cipher padding",
                transfer.pad_length
            )));
        }

        let striper = Striper::new(sla.data_stripes, sla.total_stripes, transfer.packet_size)?;
        let handles = self.ctx.pool.storage_for_sla(sla, sla.total_stripes).await?;
        progress.advance(10, TransferState::Initializing);

        let result = self
            .write_stripes(source, record, &striper, &handles, progress)
            .await;

        if let Err(e) = &result {
            warn!("Rolling back upload of {}: {}", record.name, e);
            for handle in &handles {
                handle.cancel_write().await;
            }
            if record.encrypted {
                self.ctx
                    .escrow
                    .force_remove_entries(&record.owner, &record.id.to_string())
                    .await;
            }
            for (index, handle) in handles.iter().enumerate() {
                if let Err(e) = handle.delete_file(&stripe_name(record.id, index)).await {
                    debug!("Could not remove partial stripe {}: {}", index, e);
                }
            }
            record.stripes.clear();
        }

        self.ctx.pool.return_all(handles).await;
        result
    }

    async fn write_stripes(
        &self,
        source: &Path,
        record: &mut FileRecord,
        striper: &Striper,
        handles: &[Box<dyn StorageClient>],
        progress: &Progress,
    ) -> Result<()> {
        let file_id = record.id.to_string();
        // Cipher padding fits inside pad_length, so the plaintext length bounds both cases
        let logical_end = record.length + record.pad_length;
        let size = stripe_len(logical_end, striper.data_stripes(), striper.packet_size());

        let key = if record.encrypted {
            let key = SymmetricKey::generate();
            let distribution = self
                .ctx
                .escrow
                .distribute_key(self.ctx.escrow_threshold, &key, &record.owner, &file_id)
                .await?;
            if distribution.is_degraded() {
                warn!(
                    "Key for {} escrowed on {} of {} endpoints only",
                    record.name, distribution.stored, distribution.total
                );
            }
            Some(key)
        } else {
            None
        };

        let mut writers = Vec::with_capacity(handles.len());
        for (index, handle) in handles.iter().enumerate() {
            writers.push(
                handle
                    .write_data(&stripe_name(record.id, index), size, None)
                    .await?,
            );
        }
        progress.advance(15, TransferState::Active);

        let file = tokio::fs::File::open(source).await?;
        let stripe_pad = match &key {
            Some(key) => {
                let mut reader = EncryptingReader::new(file, key)?;
                striper.stripe(&mut reader, &mut writers, logical_end).await?
            }
            None => {
                let mut reader = file;
                striper.stripe(&mut reader, &mut writers, logical_end).await?
            }
        };
        for writer in writers.iter_mut() {
            writer.shutdown().await?;
        }
        drop(writers);
        record.stripe_pad_length = stripe_pad;

        self.wait_for_stripes(handles, progress).await?;
        self.verify_stripes(record.id, handles, size, progress).await?;

        record.stripes = handles
            .iter()
            .enumerate()
            .map(|(index, handle)| StripeLocation {
                uri: handle.uri(&stripe_name(record.id, index)),
                kind: handle.kind(),
                version: handle.version().to_string(),
            })
            .collect();
        Ok(())
    }

    /// Wait for every backend to commit, reporting progress meanwhile
    async fn wait_for_stripes(
        &self,
        handles: &[Box<dyn StorageClient>],
        progress: &Progress,
    ) -> Result<()> {
        let timeout = self.ctx.completion_timeout();
        let waits = join_all(handles.iter().map(|h| h.wait_write_complete(timeout)));
        tokio::pin!(waits);
        let mut ticker = tokio::time::interval(self.ctx.poll_interval());

        let results = loop {
            tokio::select! {
                results = &mut waits => break results,
                _ = ticker.tick() => {
                    let sum: u32 = handles.iter().map(|h| h.transfer_progress() as u32).sum();
                    let average = sum / handles.len().max(1) as u32;
                    progress.advance((15 + average * 75 / 100) as u8, TransferState::Active);
                }
            }
        };

        let mut first_error = None;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                warn!("Stripe on {} did not complete: {}", handle.endpoint_name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Every stripe must be present with its full size, not just `k` of them
    async fn verify_stripes(
        &self,
        id: FileId,
        handles: &[Box<dyn StorageClient>],
        size: u64,
        progress: &Progress,
    ) -> Result<()> {
        let total = handles.len();
        for (index, handle) in handles.iter().enumerate() {
            let name = stripe_name(id, index);
            let uri = handle.uri(&name);
            match handle.object_size(&name).await {
                Ok(Some(stored)) if stored == size => {}
                Ok(Some(stored)) => {
                    return Err(Error::VerificationFailed(format!(
                        "{} holds {} of {} bytes",
                        uri, stored, size
                    )))
                }
                Ok(None) => return Err(Error::VerificationFailed(format!("{} is missing", uri))),
                Err(e) => return Err(Error::VerificationFailed(format!("{}: {}", uri, e))),
            }
            progress.advance(
                (90 + (index + 1) * 9 / total) as u8,
                TransferState::IntermediateResult,
            );
        }
        Ok(())
    }

    /// Rebuild file `id` into `output`, returning the bytes written
    pub async fn download<W>(
        &self,
        id: FileId,
        output: &mut W,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let progress = Progress::new(observer);
        progress.state(TransferState::Initializing);
        let result = self.download_file(id, output, &progress).await;
        progress.finish(&result);
        result
    }

    /// Download into a local file; a partial file is removed on failure
    pub async fn download_to_path(
        &self,
        id: FileId,
        target: &Path,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::create(target).await?;
        let result = self.download(id, &mut file, observer).await;
        drop(file);
        if result.is_err() {
            let _ = tokio::fs::remove_file(target).await;
        }
        result
    }

    async fn download_file<W>(&self, id: FileId, output: &mut W, progress: &Progress) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let record = self.ctx.metadata.get_file(id).await?;
        if record.is_directory() {
            return Err(Error::NotAFile(record.name));
        }
        if record.stripes.is_empty() {
            if record.length == 0 {
                output.flush().await?;
                return Ok(0);
            }
            return Err(Error::InsufficientStripes {
                available: 0,
                required: record.min_stripes.max(1),
            });
        }

        let (handles, mut inputs) = self.open_stripes(&record).await;
        let available = inputs.iter().filter(|input| input.is_some()).count();
        if available < record.min_stripes {
            drop(inputs);
            self.ctx.pool.return_all(handles).await;
            return Err(Error::InsufficientStripes {
                available,
                required: record.min_stripes,
            });
        }
        progress.advance(10, TransferState::Initializing);

        let result = self.reconstruct(&record, &mut inputs, output, progress).await;

        // Trailing padding is read out before the handles go back
        for input in inputs.iter_mut().flatten() {
            if let Err(e) = tokio::io::copy(input, &mut tokio::io::sink()).await {
                debug!("Draining stripe of {} failed: {}", record.name, e);
            }
        }
        drop(inputs);
        self.ctx.pool.return_all(handles).await;

        if result.is_ok() {
            info!("Downloaded {} ({} bytes)", record.name, record.length);
        }
        result
    }

    /// Open every listed stripe that is reachable and present
    async fn open_stripes(
        &self,
        record: &FileRecord,
    ) -> (Vec<Box<dyn StorageClient>>, Vec<Option<DataReader>>) {
        let mut handles = Vec::with_capacity(record.stripes.len());
        let mut inputs = Vec::with_capacity(record.stripes.len());

        for location in &record.stripes {
            let handle = self
                .ctx
                .pool
                .get_storage_client(Some(&location.uri), location.kind, Some(&location.version))
                .await;
            let Some(handle) = handle else {
                warn!("No backend reachable for stripe {}", location.uri);
                inputs.push(None);
                continue;
            };

            let name = location.object_name();
            let input = match handle.object_size(name).await {
                Ok(Some(size)) => match handle.read_data(name, size, None).await {
                    Ok(reader) => Some(reader),
                    Err(e) => {
                        warn!("Cannot read stripe {}: {}", location.uri, e);
                        None
                    }
                },
                Ok(None) => {
                    warn!("Stripe {} is missing", location.uri);
                    None
                }
                Err(e) => {
                    warn!("Cannot check stripe {}: {}", location.uri, e);
                    None
                }
            };
            inputs.push(input);
            handles.push(handle);
        }

        (handles, inputs)
    }

    async fn reconstruct<W>(
        &self,
        record: &FileRecord,
        inputs: &mut [Option<DataReader>],
        output: &mut W,
        progress: &Progress,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let key = if record.encrypted {
            Some(
                self.ctx
                    .escrow
                    .gather_key(&record.owner, &record.id.to_string())
                    .await?,
            )
        } else {
            None
        };
        progress.advance(20, TransferState::Active);

        let striper = Striper::new(record.min_stripes, record.stripes.len(), record.block_size)?;
        let target = record.striped_length();
        match key {
            Some(key) => {
                let mut writer = DecryptingWriter::new(&mut *output, &key)?;
                striper.construct(inputs, &mut writer, target).await?;
                writer.shutdown().await.map_err(|e| {
                    Error::Decryption(format!("{}: {}", record.name, e))
                })?;
            }
            None => {
                striper.construct(inputs, output, target).await?;
                output.flush().await?;
            }
        }
        progress.advance(95, TransferState::IntermediateResult);
        Ok(record.length)
    }
}

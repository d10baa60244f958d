//! One resumable, chunked transfer of a file.
//!
//! [`UploadSession::run`] drives the state machine
//! `pending -> uploading <-> retrying -> succeeded | failed | canceled`
//! against a [`ResumableTransport`]. Chunks go out strictly in offset order
//! and only after the previous one was acknowledged; the acknowledged offset
//! is the checkpoint a retry resumes from.
//!
//! Progress is published on a `tokio::sync::watch` channel, see
//! [`UploadSession::subscribe`].

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::contract::{DatasetType, ImportRequest, NewUpload, ResumableTransport, UploadHandle};
use crate::error::{TransferError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Pending,
    Uploading,
    Retrying,
    Succeeded,
    Failed,
    Canceled,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Succeeded | UploadState::Failed | UploadState::Canceled
        )
    }
}

/// Snapshot of a session, as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub state: UploadState,
    pub offset: u64,
    pub total_size: u64,
    pub retry_count: u32,
}

/// Cooperative cancellation flag shared between a session and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where an import of the uploaded file should land. Fixed for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportTarget {
    pub dataset_id: i64,
    pub dataset_type: DatasetType,
    pub group: Option<String>,
}

/// Bytes to transfer. Files are read one chunk at a time.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Memory(Vec<u8>),
    File(PathBuf),
}

impl UploadSource {
    async fn read_chunk(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        match self {
            UploadSource::Memory(bytes) => {
                let start = usize::try_from(offset).map_err(std::io::Error::other)?;
                bytes
                    .get(start..start + len)
                    .map(|slice| slice.to_vec())
                    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
            }
            UploadSource::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

pub struct UploadSession {
    file_id: String,
    source: UploadSource,
    total_size: u64,
    mimetype: Option<String>,
    target: ImportTarget,
    config: UploadConfig,
    offset: u64,
    state: UploadState,
    retry_count: u32,
    cancel: CancelHandle,
    progress: watch::Sender<UploadProgress>,
}

impl UploadSession {
    /// Session over in-memory bytes.
    pub fn new(
        file_id: impl Into<String>,
        bytes: Vec<u8>,
        target: ImportTarget,
        config: UploadConfig,
    ) -> Self {
        let total_size = bytes.len() as u64;
        Self::with_source(file_id.into(), UploadSource::Memory(bytes), total_size, target, config)
    }

    /// Session over a file on disk, identified by its file name.
    pub async fn from_path(
        path: impl AsRef<Path>,
        target: ImportTarget,
        config: UploadConfig,
    ) -> std::io::Result<Self> {
        let path = path.as_ref();
        let total_size = tokio::fs::metadata(path).await?.len();
        let file_id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("'{}' does not name a file", path.display()),
                )
            })?;
        Ok(Self::with_source(
            file_id,
            UploadSource::File(path.to_path_buf()),
            total_size,
            target,
            config,
        ))
    }

    fn with_source(
        file_id: String,
        source: UploadSource,
        total_size: u64,
        target: ImportTarget,
        config: UploadConfig,
    ) -> Self {
        let (progress, _) = watch::channel(UploadProgress {
            state: UploadState::Pending,
            offset: 0,
            total_size,
            retry_count: 0,
        });
        UploadSession {
            file_id,
            source,
            total_size,
            mimetype: None,
            target,
            config,
            offset: 0,
            state: UploadState::Pending,
            retry_count: 0,
            cancel: CancelHandle::default(),
            progress,
        }
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn target(&self) -> &ImportTarget {
        &self.target
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadProgress> {
        self.progress.subscribe()
    }

    /// The import this session hands over once it has succeeded.
    pub fn import_request(&self) -> ImportRequest {
        ImportRequest {
            file_id: self.file_id.clone(),
            dataset_id: self.target.dataset_id,
            dataset_type: self.target.dataset_type,
            group: self.target.group.clone(),
        }
    }

    /// Runs the transfer to a terminal state. Returns the number of bytes stored remotely.
    pub async fn run<T>(&mut self, transport: &T) -> Result<u64, TransferError>
    where
        T: ResumableTransport + ?Sized,
    {
        if self.state.is_terminal() {
            return Err(TransferError::AlreadyFinished {
                file_id: self.file_id.clone(),
            });
        }
        if self.total_size > self.config.max_upload_size {
            return Err(self.fail(format!(
                "file is {} bytes, the endpoint accepts at most {}",
                self.total_size, self.config.max_upload_size
            )));
        }
        if self.cancel.is_canceled() {
            return Err(self.canceled(transport, None).await);
        }

        info!(file = %self.file_id, total_size = self.total_size, "[UPLOAD] Starting transfer");
        self.transition(UploadState::Uploading);

        let handle = self.create(transport).await?;
        debug!(file = %self.file_id, location = %handle.location, "[UPLOAD] Upload resource created");

        let delays = self.config.retry_delays();
        let chunk_size = self.config.chunk_size.max(1);
        let mut consecutive_failures = 0usize;

        while self.offset < self.total_size {
            if self.cancel.is_canceled() {
                return Err(self.canceled(transport, Some(&handle)).await);
            }

            let len = chunk_size.min(self.total_size - self.offset) as usize;
            let chunk = match self.source.read_chunk(self.offset, len).await {
                Ok(chunk) => chunk,
                Err(e) => return Err(self.fail(format!("reading bytes at {}: {e}", self.offset))),
            };

            match transport.send_chunk(&handle, self.offset, &chunk).await {
                Ok(ack) => {
                    if ack.offset <= self.offset || ack.offset > self.total_size {
                        return Err(self.fail(format!(
                            "endpoint acknowledged offset {} after a chunk at {} (size {})",
                            ack.offset, self.offset, self.total_size
                        )));
                    }
                    self.offset = ack.offset;
                    consecutive_failures = 0;
                    self.transition(UploadState::Uploading);
                    debug!(file = %self.file_id, offset = self.offset, "[UPLOAD] Chunk acknowledged");
                }
                Err(e) => {
                    self.back_off(&e, &delays, &mut consecutive_failures).await?;
                    if self.cancel.is_canceled() {
                        return Err(self.canceled(transport, Some(&handle)).await);
                    }
                    self.resync(transport, &handle).await?;
                    self.transition(UploadState::Uploading);
                }
            }
        }

        self.transition(UploadState::Succeeded);
        info!(
            file = %self.file_id,
            bytes = self.offset,
            retries = self.retry_count,
            "[UPLOAD] Transfer succeeded"
        );
        Ok(self.offset)
    }

    async fn create<T>(&mut self, transport: &T) -> Result<UploadHandle, TransferError>
    where
        T: ResumableTransport + ?Sized,
    {
        let request = NewUpload {
            file_id: self.file_id.clone(),
            total_size: self.total_size,
            mimetype: self.mimetype.clone(),
        };
        let delays = self.config.retry_delays();
        let mut consecutive_failures = 0usize;
        loop {
            if self.cancel.is_canceled() {
                return Err(self.canceled(transport, None).await);
            }
            match transport.create(&request).await {
                Ok(handle) => {
                    self.transition(UploadState::Uploading);
                    return Ok(handle);
                }
                Err(e) => self.back_off(&e, &delays, &mut consecutive_failures).await?,
            }
        }
    }

    /// Waits out the next delay of the schedule, or fails the session if
    /// `error` is fatal or the schedule is used up.
    async fn back_off(
        &mut self,
        error: &TransportError,
        delays: &[Duration],
        consecutive_failures: &mut usize,
    ) -> Result<(), TransferError> {
        if !error.is_transient() {
            return Err(self.fail(error.to_string()));
        }
        let Some(delay) = delays.get(*consecutive_failures).copied() else {
            return Err(self.fail(format!(
                "giving up after {} retries: {error}",
                self.retry_count
            )));
        };
        *consecutive_failures += 1;
        self.retry_count += 1;
        self.transition(UploadState::Retrying);
        warn!(
            file = %self.file_id,
            offset = self.offset,
            retry = self.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "[UPLOAD] Transient failure, retrying"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Adopts the endpoint's offset when it has stored more than we know of,
    /// e.g. because an acknowledgment was lost.
    async fn resync<T>(&mut self, transport: &T, handle: &UploadHandle) -> Result<(), TransferError>
    where
        T: ResumableTransport + ?Sized,
    {
        match transport.current_offset(handle).await {
            Ok(remote) if remote < self.offset || remote > self.total_size => Err(self.fail(format!(
                "endpoint reports offset {remote}, expected between {} and {}",
                self.offset, self.total_size
            ))),
            Ok(remote) => {
                if remote != self.offset {
                    info!(file = %self.file_id, from = self.offset, to = remote, "[UPLOAD] Resuming from endpoint offset");
                    self.offset = remote;
                }
                Ok(())
            }
            Err(e) => {
                debug!(file = %self.file_id, error = %e, "[UPLOAD] Offset query failed, keeping local checkpoint");
                Ok(())
            }
        }
    }

    async fn canceled<T>(&mut self, transport: &T, handle: Option<&UploadHandle>) -> TransferError
    where
        T: ResumableTransport + ?Sized,
    {
        if let Some(handle) = handle {
            if let Err(e) = transport.terminate(handle).await {
                warn!(file = %self.file_id, error = %e, "[UPLOAD] Terminating canceled upload failed");
            }
        }
        self.transition(UploadState::Canceled);
        info!(file = %self.file_id, offset = self.offset, "[UPLOAD] Transfer canceled");
        TransferError::Canceled {
            file_id: self.file_id.clone(),
        }
    }

    fn fail(&mut self, reason: String) -> TransferError {
        self.transition(UploadState::Failed);
        error!(file = %self.file_id, offset = self.offset, reason = %reason, "[UPLOAD][ERROR] Transfer failed");
        TransferError::Failed {
            file_id: self.file_id.clone(),
            reason,
        }
    }

    fn transition(&mut self, state: UploadState) {
        self.state = state;
        self.progress.send_replace(UploadProgress {
            state,
            offset: self.offset,
            total_size: self.total_size,
            retry_count: self.retry_count,
        });
    }
}

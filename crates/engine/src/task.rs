//! Single-transfer state machine.
//!
//! A [`TransferTask`] owns the lifecycle of one upload, download, or
//! multipart sub-operation. Every status mutation is applied under the
//! task lock, persisted to the store, and only then published on the
//! event stream, so observers never see a state the disk does not.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use stowage_protocol::{
    CompletedPartRecord, HandleId, MultipartRecord, PersistedTask, TransferId, TransferKind,
    TransferStatus,
};
use tracing::{debug, info, warn};

use crate::checksum;
use crate::error::TransferError;
use crate::events::{EventSink, TransferEvent};
use crate::host::{BackgroundTransferHost, ByteRange, RequestKind, TransferRequest};
use crate::store::TransferStore;

/// One transfer task. Shared between the caller-facing API and the
/// host callback path; all mutation goes through the inner mutex.
pub struct TransferTask {
    id: TransferId,
    kind: TransferKind,
    bucket: String,
    key: String,
    file_path: PathBuf,
    /// Byte range of `file_path` this task moves. Set for part tasks.
    range: Option<ByteRange>,
    store: Arc<TransferStore>,
    events: EventSink,
    inner: Mutex<TaskInner>,
}

struct TaskInner {
    status: TransferStatus,
    /// Attached OS handle, present only while `InProgress`.
    handle: Option<HandleId>,
    /// Suspended OS handle kept for reattachment while `Paused`. Never
    /// persisted: a process death while paused reverts the task to a
    /// fresh start.
    parked_handle: Option<HandleId>,
    bytes_transferred: u64,
    total_bytes: u64,
    etag: Option<String>,
    downloaded_to: Option<PathBuf>,
    response_body: Vec<u8>,
    /// Set once `Failed` has been emitted. Cancellation and error
    /// race through the host callback path; exactly one wins.
    failure_reported: bool,
    multipart: Option<MultipartRecord>,
}

impl TransferTask {
    /// Creates a task and writes its `Ready` record before returning.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        id: TransferId,
        kind: TransferKind,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<PathBuf>,
        range: Option<ByteRange>,
        total_bytes: u64,
        store: Arc<TransferStore>,
        events: EventSink,
    ) -> Result<Arc<Self>, TransferError> {
        let task = Arc::new(Self {
            id,
            kind,
            bucket: bucket.into(),
            key: key.into(),
            file_path: file_path.into(),
            range,
            store,
            events,
            inner: Mutex::new(TaskInner {
                status: TransferStatus::Ready,
                handle: None,
                parked_handle: None,
                bytes_transferred: 0,
                total_bytes,
                etag: None,
                downloaded_to: None,
                response_body: Vec::new(),
                failure_reported: false,
                multipart: None,
            }),
        });

        {
            let inner = task.inner.lock().unwrap();
            task.persist(&inner)?;
        }
        Ok(task)
    }

    /// Rebuilds a task from a recovered record. When `handle` is set
    /// the task comes back attached and `InProgress`; otherwise it
    /// starts over from `Ready`.
    pub fn from_record(
        record: PersistedTask,
        handle: Option<HandleId>,
        range: Option<ByteRange>,
        store: Arc<TransferStore>,
        events: EventSink,
    ) -> Arc<Self> {
        let status = if handle.is_some() {
            TransferStatus::InProgress
        } else {
            TransferStatus::Ready
        };
        Arc::new(Self {
            id: record.transfer_id,
            kind: record.kind,
            bucket: record.bucket,
            key: record.key,
            file_path: PathBuf::from(record.file_path),
            range,
            store,
            events,
            inner: Mutex::new(TaskInner {
                status,
                handle,
                parked_handle: None,
                bytes_transferred: 0,
                total_bytes: record.total_bytes,
                etag: None,
                downloaded_to: None,
                response_body: record.response_body,
                failure_reported: false,
                multipart: record.multipart,
            }),
        })
    }

    pub fn id(&self) -> &TransferId {
        &self.id
    }

    pub fn kind(&self) -> &TransferKind {
        &self.kind
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.lock().unwrap().status
    }

    pub fn handle(&self) -> Option<HandleId> {
        self.inner.lock().unwrap().handle
    }

    pub fn multipart(&self) -> Option<MultipartRecord> {
        self.inner.lock().unwrap().multipart.clone()
    }

    /// Starts or resumes the task. Returns the newly attached handle
    /// so the caller can bind it; `None` when no handle was attached
    /// (already running, terminal, or a local-only parent task).
    pub fn resume(
        &self,
        host: &dyn BackgroundTransferHost,
    ) -> Result<Option<HandleId>, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.status {
            TransferStatus::Ready | TransferStatus::Paused => {}
            other => {
                debug!(transfer = %self.id, status = ?other, "resume is a no-op");
                return Ok(None);
            }
        }

        // The multipart parent performs no byte movement itself; its
        // create/complete calls run outside the handle machinery.
        if matches!(self.kind, TransferKind::MultipartCreate) {
            inner.status = TransferStatus::InProgress;
            self.persist(&inner)?;
            self.emit(TransferEvent::Initiated);
            return Ok(None);
        }

        let handle = match inner.parked_handle.take() {
            Some(parked) => {
                host.resume(parked);
                debug!(transfer = %self.id, handle = parked.0, "reattached parked handle");
                parked
            }
            None => {
                let request = self.request()?;
                let handle = host.submit(&request)?;
                info!(transfer = %self.id, handle = handle.0, "submitted transfer");
                handle
            }
        };

        inner.handle = Some(handle);
        inner.status = TransferStatus::InProgress;
        self.persist(&inner)?;
        self.emit(TransferEvent::Initiated);
        Ok(Some(handle))
    }

    /// Suspends the task. The OS handle stays alive in memory for
    /// reattachment but is dropped from the persisted record: a kill
    /// while paused must not leave a stale handle claim on disk.
    /// Returns the suspended handle so the caller can unbind it.
    pub fn pause(
        &self,
        host: &dyn BackgroundTransferHost,
    ) -> Result<Option<HandleId>, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != TransferStatus::InProgress {
            debug!(transfer = %self.id, status = ?inner.status, "pause is a no-op");
            return Ok(None);
        }

        let handle = inner.handle.take();
        if let Some(h) = handle {
            host.suspend(h);
            inner.parked_handle = Some(h);
        }
        inner.status = TransferStatus::Paused;
        self.persist(&inner)?;
        info!(transfer = %self.id, "paused");
        Ok(handle)
    }

    /// Applies a benign interruption: the OS stopped the handle
    /// without losing data and can bring it back, so the task parks
    /// the handle and waits in `Paused` instead of failing. Returns
    /// the parked handle so the caller can unbind it.
    pub fn interrupted(&self) -> Result<Option<HandleId>, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != TransferStatus::InProgress {
            return Ok(None);
        }

        let handle = inner.handle.take();
        inner.parked_handle = handle;
        inner.status = TransferStatus::Paused;
        self.persist(&inner)?;
        info!(transfer = %self.id, "interrupted, waiting to resume");
        Ok(handle)
    }

    /// Cancels the task, discarding any OS handle. Terminal tasks are
    /// left alone. Returns the handle that was attached, if any.
    pub fn cancel(
        &self,
        host: &dyn BackgroundTransferHost,
    ) -> Result<Option<HandleId>, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status.is_terminal() {
            return Ok(None);
        }

        let handle = inner.handle.take();
        if let Some(h) = handle.or(inner.parked_handle.take()) {
            host.cancel(h);
        }
        inner.status = TransferStatus::Cancelled;
        self.store.remove(&self.id)?;
        info!(transfer = %self.id, "cancelled");
        if !inner.failure_reported {
            inner.failure_reported = true;
            self.emit(TransferEvent::Failed {
                error: "cancelled".into(),
            });
        }
        Ok(handle)
    }

    /// Applies a successful completion. Idempotent against late host
    /// callbacks. Returns the handle that was attached, if any.
    pub fn complete(&self, etag: Option<String>) -> Option<HandleId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status.is_terminal() {
            return None;
        }

        let handle = inner.handle.take();
        inner.status = TransferStatus::Completed;
        inner.etag = etag.clone();
        if let Err(e) = self.store.remove(&self.id) {
            warn!(transfer = %self.id, error = %e, "failed to remove completed record");
        }
        info!(transfer = %self.id, "completed");
        self.emit(TransferEvent::Completed {
            etag,
            location: inner.downloaded_to.clone(),
        });
        handle
    }

    /// Applies a failure. The latch guarantees a single `Failed` event
    /// even when error and cancellation race. Returns the handle that
    /// was attached, if any.
    pub fn fail(&self, error: impl Into<String>) -> Option<HandleId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status.is_terminal() || inner.status == TransferStatus::Error {
            return None;
        }

        let handle = inner.handle.take();
        inner.parked_handle = None;
        inner.status = TransferStatus::Error;
        if let Err(e) = self.store.remove(&self.id) {
            warn!(transfer = %self.id, error = %e, "failed to remove errored record");
        }
        let error = error.into();
        warn!(transfer = %self.id, error = %error, "transfer failed");
        if !inner.failure_reported {
            inner.failure_reported = true;
            self.emit(TransferEvent::Failed { error });
        }
        handle
    }

    /// Records byte movement. Progress is not a status change and is
    /// not persisted per tick; a recovered task re-learns its offset
    /// from the OS handle.
    pub fn progress(&self, bytes_transferred: u64, total_bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.bytes_transferred = bytes_transferred;
        if total_bytes > 0 {
            inner.total_bytes = total_bytes;
        }
        self.emit(TransferEvent::ProgressUpdated {
            bytes_transferred,
            total_bytes: inner.total_bytes,
        });
    }

    /// Moves a finished download out of the host's temporary location
    /// into the destination path. Must run before the callback returns
    /// or the OS reclaims the temporary file.
    pub fn finish_download(&self, temp_path: &Path) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();
        if let Err(rename_err) = fs::rename(temp_path, &self.file_path) {
            // Rename fails across filesystems; fall back to a copy.
            debug!(transfer = %self.id, error = %rename_err, "rename failed, copying instead");
            fs::copy(temp_path, &self.file_path)?;
            fs::remove_file(temp_path)?;
        }
        inner.downloaded_to = Some(self.file_path.clone());
        Ok(())
    }

    /// Keeps the raw network response on the task for introspection.
    pub fn record_response(&self, body: Vec<u8>) {
        self.inner.lock().unwrap().response_body = body;
    }

    pub fn response_body(&self) -> Vec<u8> {
        self.inner.lock().unwrap().response_body.clone()
    }

    /// Attaches multipart sub-state to the parent record and persists
    /// it. Called once the upload id is known.
    pub fn set_multipart(&self, multipart: MultipartRecord) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();
        inner.multipart = Some(multipart);
        self.persist(&inner)
    }

    /// Records one finished part on the parent record. The persisted
    /// eTag is what lets recovery finish the upload without re-sending
    /// the part.
    pub fn record_completed_part(
        &self,
        part_number: i32,
        etag: impl Into<String>,
    ) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();
        let multipart = inner
            .multipart
            .as_mut()
            .ok_or_else(|| TransferError::Service("task has no multipart state".into()))?;
        let etag = etag.into();
        if let Some(existing) = multipart
            .completed_parts
            .iter_mut()
            .find(|p| p.part_number == part_number)
        {
            existing.etag = etag;
        } else {
            multipart
                .completed_parts
                .push(CompletedPartRecord { part_number, etag });
        }
        self.persist(&inner)
    }

    fn request(&self) -> Result<TransferRequest, TransferError> {
        let operation = match &self.kind {
            TransferKind::Upload => RequestKind::PutObject,
            TransferKind::Download => RequestKind::GetObject,
            TransferKind::MultipartPart {
                upload_id,
                part_number,
            } => RequestKind::UploadPart {
                upload_id: upload_id.clone(),
                part_number: *part_number,
                checksum: checksum::file_checksum(&self.file_path, self.range)?,
            },
            TransferKind::MultipartCreate => {
                return Err(TransferError::Service(
                    "multipart parent has no transfer request".into(),
                ));
            }
        };
        Ok(TransferRequest {
            operation,
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            file_path: self.file_path.clone(),
            range: self.range,
        })
    }

    fn persist(&self, inner: &TaskInner) -> Result<(), TransferError> {
        let mut record = PersistedTask::new(
            self.id.clone(),
            self.kind.clone(),
            self.bucket.clone(),
            self.key.clone(),
            self.file_path.to_string_lossy().into_owned(),
        );
        record.status = inner.status;
        record.handle = inner.handle;
        record.multipart = inner.multipart.clone();
        record.total_bytes = inner.total_bytes;
        record.response_body = inner.response_body.clone();
        record.updated_at = chrono::Utc::now();
        self.store.upsert(record)
    }

    // Senders are called under the task lock so per-task event order
    // matches transition order. A dropped receiver just means nobody
    // is listening.
    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send((self.id.clone(), event));
    }
}

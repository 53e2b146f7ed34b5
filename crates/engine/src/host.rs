//! Background-transfer host contract.
//!
//! The OS background-transfer subsystem keeps resumable transfer
//! handles alive across process suspension and relaunch. The embedder
//! implements [`BackgroundTransferHost`] on top of the actual platform
//! facility and forwards its callbacks to the
//! [`SessionController`](crate::controller::SessionController) as
//! [`HandleEvent`]s.

use std::path::PathBuf;

use stowage_protocol::HandleId;

use crate::error::TransferError;

/// A byte range of a local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

/// The resumable operation a handle performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Whole-object upload.
    PutObject,
    /// Whole-object download, delivered to a temporary file.
    GetObject,
    /// Upload of one part of a multipart upload. The checksum is the
    /// hex SHA-256 of the exact byte range being sent.
    UploadPart {
        upload_id: String,
        part_number: i32,
        checksum: String,
    },
}

/// Work description handed to the background-transfer subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub operation: RequestKind,
    pub bucket: String,
    pub key: String,
    /// Upload source or download destination.
    pub file_path: PathBuf,
    /// Byte range of `file_path` to send. `None` sends (or receives)
    /// the whole file.
    pub range: Option<ByteRange>,
}

/// Error reported by an OS transfer handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleError {
    /// Platform error code, opaque to the engine.
    pub code: i32,
    pub message: String,
}

impl std::fmt::Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Callback delivered by the background-transfer subsystem.
///
/// Events arrive on an arbitrary delivery context and are concurrent
/// with caller-initiated operations; the controller serializes them
/// per task.
#[derive(Debug, Clone)]
pub enum HandleEvent {
    /// The OS-level session became unusable; the host must create and
    /// re-register a fresh one. Surfaced for diagnostics, not fatal.
    BecameInvalid { reason: String },
    /// Bytes moved on a handle.
    Progress {
        handle: HandleId,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    /// A download handle delivered its payload to a temporary file.
    /// The file must be consumed before the OS reclaims it.
    DownloadFinished { handle: HandleId, temp_path: PathBuf },
    /// A handle finished, successfully or not.
    Completed {
        handle: HandleId,
        /// eTag from the response, when the store returned one.
        etag: Option<String>,
        /// Raw response body, kept on the task for introspection.
        response_body: Vec<u8>,
        error: Option<HandleError>,
    },
}

/// Contract implemented by the OS integration layer.
///
/// `submit` creates a handle and starts it; it must not block on the
/// network call itself. Handles survive process suspension; after a
/// relaunch [`live_handles`](Self::live_handles) enumerates the ones
/// the OS kept alive so recovery can re-associate them.
pub trait BackgroundTransferHost: Send + Sync {
    /// Creates and starts a resumable transfer handle.
    fn submit(&self, request: &TransferRequest) -> Result<HandleId, TransferError>;

    /// Suspends a handle without destroying it.
    fn suspend(&self, handle: HandleId);

    /// Resumes a previously suspended handle.
    fn resume(&self, handle: HandleId);

    /// Cancels and discards a handle.
    fn cancel(&self, handle: HandleId);

    /// Handles the OS kept alive across the last process death.
    fn live_handles(&self) -> Vec<HandleId>;

    /// Whether an error means "interrupted without data loss" — the OS
    /// may resume the handle later, so the engine treats it as a pause
    /// rather than a failure. Interruption codes are not portable, so
    /// the policy lives here, in the OS integration layer.
    fn is_benign_interruption(&self, error: &HandleError) -> bool;
}

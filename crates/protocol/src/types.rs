use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable opaque identifier of a transfer task.
///
/// Generated once at task creation and used as the persistence key,
/// so it must never change for the lifetime of a logical transfer —
/// including across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransferId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of an OS-managed background transfer handle.
///
/// Assigned by the background-transfer subsystem, stable across process
/// suspension (the OS keeps the transfer alive), but *not* across a
/// handle being cancelled and recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of network work a transfer task performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Whole-file upload (single PUT).
    #[serde(rename = "upload")]
    Upload,
    /// Whole-file download.
    #[serde(rename = "download")]
    Download,
    /// Parent task of a multipart upload. Owns the multipart state;
    /// has no OS handle of its own (create/complete are plain
    /// request/response calls).
    #[serde(rename = "multipartCreate")]
    MultipartCreate,
    /// One part of a multipart upload.
    #[serde(rename = "multipartPart", rename_all = "camelCase")]
    MultipartPart { upload_id: String, part_number: i32 },
}

/// Current state of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "inProgress")]
    InProgress,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "error")]
    Error,
}

impl TransferStatus {
    /// Terminal states accept no further transitions or OS callbacks.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Cancelled)
    }
}

/// State of one part within a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "inProgress", rename_all = "camelCase")]
    InProgress { bytes_transferred: u64 },
    #[serde(rename = "completed")]
    Completed { etag: String },
    #[serde(rename = "failed")]
    Failed { error: String },
}

impl PartStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, PartStatus::Completed { .. })
    }

    /// Returns the eTag for completed parts.
    pub fn etag(&self) -> Option<&str> {
        match self {
            PartStatus::Completed { etag } => Some(etag),
            _ => None,
        }
    }
}

/// Lifecycle state of a multipart upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultipartState {
    #[serde(rename = "creating")]
    Creating,
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "inProgress")]
    InProgress,
    #[serde(rename = "completing")]
    Completing,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "aborting")]
    Aborting,
    #[serde(rename = "aborted")]
    Aborted,
    #[serde(rename = "failed")]
    Failed,
}

impl MultipartState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MultipartState::Completed | MultipartState::Aborted | MultipartState::Failed
        )
    }
}

/// Byte-level progress of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Progress as a percentage (0-100). Zero when the total is unknown.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0
    }
}

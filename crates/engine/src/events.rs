//! Engine event streams.
//!
//! Events for a single task are delivered in the order the transitions
//! were applied to its state machine; senders are called under the
//! task lock to guarantee it. Across different tasks there is no
//! ordering guarantee.

use std::path::PathBuf;

use stowage_protocol::{TransferId, TransferProgress};
use tokio::sync::mpsc;

/// Event emitted by a transfer task.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The task attached an OS handle and moved to `InProgress`.
    Initiated,
    /// Bytes moved. Never a status change.
    ProgressUpdated {
        bytes_transferred: u64,
        total_bytes: u64,
    },
    /// Terminal success. Downloads carry the final file location,
    /// uploads the eTag the store returned (when it returned one).
    Completed {
        etag: Option<String>,
        location: Option<PathBuf>,
    },
    /// Terminal failure or cancellation. Emitted exactly once.
    Failed { error: String },
}

/// Event emitted by a multipart upload session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The upload id was acquired and part dispatch started.
    Initiated,
    /// Aggregate progress across all parts.
    InProcess { progress: TransferProgress },
    /// Every part completed and the upload was finalized.
    Completed,
    /// The session failed or was aborted. Intermediate per-part
    /// retries are not surfaced; only ceiling exhaustion, completion
    /// failure, or abort is.
    Failed { error: String },
}

/// Receiving end of a task event stream.
pub type TaskEvents = mpsc::UnboundedReceiver<(TransferId, TransferEvent)>;

/// Sending end of a task event stream.
pub type EventSink = mpsc::UnboundedSender<(TransferId, TransferEvent)>;

/// Receiving end of a session event stream.
pub type SessionEvents = mpsc::UnboundedReceiver<(TransferId, SessionEvent)>;

/// Sending end of a session event stream.
pub type SessionEventSink = mpsc::UnboundedSender<(TransferId, SessionEvent)>;

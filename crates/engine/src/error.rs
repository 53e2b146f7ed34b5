//! Error types for the transfer engine.

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Part planning rejected the input (zero-length file, zero part
    /// size, or a fixed part size that would exceed the part limit).
    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// Transient network failure on a single call. Retried per part up
    /// to the retry ceiling, never engine-fatal.
    #[error("network error: {0}")]
    Network(String),

    /// The remote store rejected a call (unknown upload id, bad part).
    #[error("service error: {0}")]
    Service(String),

    /// Durable write/read failure. Fatal for the affected task only —
    /// the engine must not report a transfer as in-flight if it cannot
    /// durably record that fact.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Caller- or OS-initiated cancellation. Terminal, never retried.
    #[error("cancelled")]
    Cancelled,

    /// A persisted record could not be matched to a live OS handle and
    /// cannot be safely auto-resumed.
    #[error("recovery ambiguity: {0}")]
    RecoveryAmbiguity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

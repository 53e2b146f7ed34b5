//! Object store client contract.
//!
//! The engine issues the plain request/response calls of the multipart
//! protocol itself: create, complete, abort. Everything that moves
//! object bytes is resumable work and goes through the
//! [`BackgroundTransferHost`](crate::host::BackgroundTransferHost)
//! instead. Using a trait keeps the engine decoupled from the wire
//! client and testable with mocks; per-call retry/backoff is the
//! client's responsibility, not the engine's.

use std::future::Future;
use std::pin::Pin;

use crate::error::TransferError;

/// Boxed future returned by client calls.
pub type ClientFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// A part that finished uploading, as reported to `complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Abstract connection to the remote object store.
pub trait ObjectStoreClient: Send + Sync {
    /// Requests a new multipart upload and returns its upload id.
    fn create_multipart_upload(&self, bucket: &str, key: &str) -> ClientFuture<'_, String>;

    /// Completes a multipart upload from the full set of part eTags,
    /// in part-number order.
    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ClientFuture<'_, ()>;

    /// Aborts a multipart upload, releasing the store-side state.
    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> ClientFuture<'_, ()>;
}

//! Host callback routing.
//!
//! The OS delivers [`HandleEvent`]s on its own threads, concurrent
//! with caller-initiated pause/cancel calls. The controller looks the
//! owning task up by handle and applies the matching transition; the
//! task's own lock serializes the race. Events for handles no task
//! claims are logged and dropped, never acted on: the handle may
//! belong to a transfer whose record was already removed, or to a
//! previous install, and guessing would corrupt live state.

use std::sync::Arc;

use stowage_protocol::{HandleId, TransferStatus};
use tracing::{debug, warn};

use crate::host::{BackgroundTransferHost, HandleEvent};
use crate::registry::Registry;
use crate::task::TransferTask;

pub struct SessionController {
    registry: Arc<Registry>,
    host: Arc<dyn BackgroundTransferHost>,
}

impl SessionController {
    pub fn new(registry: Arc<Registry>, host: Arc<dyn BackgroundTransferHost>) -> Self {
        Self { registry, host }
    }

    /// Applies one host callback. Never fails: a transfer-level error
    /// becomes a task failure, not a callback error.
    pub fn handle_event(&self, event: HandleEvent) {
        match event {
            HandleEvent::BecameInvalid { reason } => {
                warn!(reason = %reason, "background session became invalid");
            }
            HandleEvent::Progress {
                handle,
                bytes_transferred,
                total_bytes,
            } => {
                let Some(task) = self.claimed(handle) else {
                    return;
                };
                task.progress(bytes_transferred, total_bytes);
            }
            HandleEvent::DownloadFinished { handle, temp_path } => {
                let Some(task) = self.claimed(handle) else {
                    return;
                };
                // The temporary file must be consumed before this
                // callback returns; failing to claim it is a task
                // failure.
                if let Err(e) = task.finish_download(&temp_path) {
                    task.fail(format!("claiming downloaded file: {e}"));
                    self.registry.unbind_handle(handle);
                    self.finish_terminal(&task);
                }
            }
            HandleEvent::Completed {
                handle,
                etag,
                response_body,
                error,
            } => {
                let Some(task) = self.claimed(handle) else {
                    return;
                };
                if !response_body.is_empty() {
                    task.record_response(response_body);
                }
                match error {
                    None => {
                        task.complete(etag);
                        self.registry.unbind_handle(handle);
                        self.finish_terminal(&task);
                    }
                    Some(e) if self.host.is_benign_interruption(&e) => {
                        debug!(handle = handle.0, error = %e, "benign interruption");
                        match task.interrupted() {
                            Ok(Some(parked)) => self.registry.unbind_handle(parked),
                            Ok(None) => {}
                            Err(persist_err) => {
                                task.fail(persist_err.to_string());
                                self.registry.unbind_handle(handle);
                                self.finish_terminal(&task);
                            }
                        }
                    }
                    Some(e) => {
                        task.fail(e.to_string());
                        self.registry.unbind_handle(handle);
                        self.finish_terminal(&task);
                    }
                }
            }
        }
    }

    fn claimed(&self, handle: HandleId) -> Option<Arc<TransferTask>> {
        let task = self.registry.task_for_handle(handle);
        if task.is_none() {
            debug!(handle = handle.0, "event for unclaimed handle, ignoring");
        }
        task
    }

    fn finish_terminal(&self, task: &Arc<TransferTask>) {
        let status = task.status();
        if status.is_terminal() || status == TransferStatus::Error {
            self.registry.remove(task.id());
        }
    }
}

//! Multipart upload session.
//!
//! A session owns one multipart upload end to end: it acquires the
//! upload id, fans the part plan out over the background-transfer host
//! with bounded concurrency, records each finished part's eTag on the
//! parent record, and finalizes or aborts the upload. Part byte
//! movement itself runs on OS handles; the session only issues the
//! create/complete/abort calls and reacts to part task events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stowage_protocol::{
    MultipartRecord, MultipartState, TransferId, TransferKind, TransferProgress,
};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{CompletedPart, ObjectStoreClient};
use crate::error::TransferError;
use crate::events::{SessionEvent, SessionEventSink, TransferEvent};
use crate::host::{BackgroundTransferHost, ByteRange};
use crate::planner::PartPlan;
use crate::registry::Registry;
use crate::store::TransferStore;
use crate::task::TransferTask;

/// Knobs for part dispatch.
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Parts in flight at once.
    pub max_concurrency: usize,
    /// Attempts per part before the session aborts the whole upload.
    pub part_attempt_limit: u32,
    /// Attempts at the final complete call. Exhausting these fails the
    /// session but keeps the parent record, so a later run can finish
    /// the upload from the persisted eTags without re-sending bytes.
    pub complete_attempt_limit: u32,
    /// Delay between complete retries.
    pub complete_retry_delay: Duration,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            part_attempt_limit: 3,
            complete_attempt_limit: 3,
            complete_retry_delay: Duration::from_millis(500),
        }
    }
}

/// A part task currently in flight.
struct ActivePart {
    part_number: i32,
    byte_count: u64,
    bytes_transferred: u64,
}

struct SessionInner {
    state: MultipartState,
    paused: bool,
    active: HashMap<TransferId, ActivePart>,
}

/// Drives one multipart upload. Constructed by the engine for fresh
/// uploads and for recovered parent records alike; recovery passes the
/// reconstructed plan and the session skips parts whose eTags are
/// already on the record.
pub struct MultipartSession {
    parent: Arc<TransferTask>,
    plan: PartPlan,
    client: Arc<dyn ObjectStoreClient>,
    host: Arc<dyn BackgroundTransferHost>,
    registry: Arc<Registry>,
    store: Arc<TransferStore>,
    config: MultipartConfig,
    events: SessionEventSink,
    cancel: CancellationToken,
    wake: Notify,
    /// Part records recovery matched to live handles. Taken once by
    /// the driving loop, which adopts them instead of re-sending.
    recovered: Mutex<Vec<(stowage_protocol::PersistedTask, stowage_protocol::HandleId)>>,
    inner: Mutex<SessionInner>,
}

impl MultipartSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent: Arc<TransferTask>,
        plan: PartPlan,
        client: Arc<dyn ObjectStoreClient>,
        host: Arc<dyn BackgroundTransferHost>,
        registry: Arc<Registry>,
        store: Arc<TransferStore>,
        config: MultipartConfig,
        events: SessionEventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            parent,
            plan,
            client,
            host,
            registry,
            store,
            config,
            events,
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            recovered: Mutex::new(Vec::new()),
            inner: Mutex::new(SessionInner {
                state: MultipartState::Creating,
                paused: false,
                active: HashMap::new(),
            }),
        })
    }

    /// Hands the session in-flight part tasks that survived a process
    /// death. Must be called before [`run`](Self::run); the loop binds
    /// them into its dispatch window so their callbacks count like any
    /// other part.
    pub fn adopt_recovered_parts(
        &self,
        parts: Vec<(stowage_protocol::PersistedTask, stowage_protocol::HandleId)>,
    ) {
        self.recovered.lock().unwrap().extend(parts);
    }

    pub fn id(&self) -> &TransferId {
        self.parent.id()
    }

    pub fn state(&self) -> MultipartState {
        self.inner.lock().unwrap().state
    }

    /// Requests cancellation. The driving loop aborts the upload and
    /// reports `Failed`.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Suspends all in-flight part handles and stops dispatching new
    /// parts until [`resume`](Self::resume).
    pub fn pause(&self) {
        let ids: Vec<TransferId> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.paused {
                return;
            }
            inner.paused = true;
            inner.active.keys().cloned().collect()
        };
        for id in ids {
            if let Some(task) = self.registry.get(&id)
                && let Ok(Some(handle)) = task.pause(self.host.as_ref())
            {
                self.registry.unbind_handle(handle);
            }
        }
        info!(session = %self.id(), "session paused");
    }

    /// Reattaches suspended part handles and refills the dispatch
    /// window.
    pub fn resume(&self) {
        let ids: Vec<TransferId> = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.paused {
                return;
            }
            inner.paused = false;
            inner.active.keys().cloned().collect()
        };
        for id in ids {
            if let Some(task) = self.registry.get(&id) {
                match task.resume(self.host.as_ref()) {
                    Ok(Some(handle)) => self.registry.bind_handle(handle, &id),
                    Ok(None) => {}
                    Err(e) => warn!(session = %self.id(), part = %id, error = %e, "part resume failed"),
                }
            }
        }
        info!(session = %self.id(), "session resumed");
        self.wake.notify_one();
    }

    /// Runs the session to a terminal state. The returned error is
    /// also reported on the event stream; callers that only watch
    /// events may discard it.
    pub async fn run(self: Arc<Self>) -> Result<(), TransferError> {
        match Arc::clone(&self).drive().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, TransferError::Cancelled) {
                    self.finish_aborted().await;
                } else if self.state() != MultipartState::Failed {
                    // Completion exhaustion already reported itself and
                    // deliberately keeps both the upload and the record.
                    self.finish_failed(&e).await;
                }
                Err(e)
            }
        }
    }

    async fn drive(self: Arc<Self>) -> Result<(), TransferError> {
        let upload_id = self.acquire_upload_id().await?;
        self.set_state(MultipartState::Created);
        self.parent.resume(self.host.as_ref())?;
        self.set_state(MultipartState::InProgress);
        self.emit(SessionEvent::Initiated);

        // eTags already on the record mean the bytes are with the
        // store; those parts are never re-sent.
        let done: HashMap<i32, String> = self
            .parent
            .multipart()
            .map(|m| {
                m.completed_parts
                    .into_iter()
                    .map(|p| (p.part_number, p.etag))
                    .collect()
            })
            .unwrap_or_default();

        let mut pending: VecDeque<i32> = self
            .plan
            .parts
            .iter()
            .map(|p| p.part_number)
            .filter(|n| !done.contains_key(n))
            .collect();
        let mut attempts: HashMap<i32, u32> = HashMap::new();
        let mut completed_bytes: u64 = self
            .plan
            .parts
            .iter()
            .filter(|p| done.contains_key(&p.part_number))
            .map(|p| p.byte_count)
            .sum();
        let total_bytes = self.plan.total_bytes();
        let remaining = pending.len();
        debug!(
            session = %self.id(),
            upload_id = %upload_id,
            parts = self.plan.parts.len(),
            remaining,
            "dispatching parts"
        );

        let (part_sink, mut part_events) = mpsc::unbounded_channel();

        // Parts already on a live handle keep running; the loop adopts
        // them instead of dispatching duplicates.
        for (record, handle) in self.recovered.lock().unwrap().drain(..) {
            let part_number = match &record.kind {
                TransferKind::MultipartPart { part_number, .. } => *part_number,
                _ => continue,
            };
            let Some(part) = self.plan.parts.iter().find(|p| p.part_number == part_number)
            else {
                warn!(session = %self.id(), part = part_number, "recovered part not in plan");
                continue;
            };
            pending.retain(|&n| n != part_number);
            attempts.insert(part_number, 1);
            let range = ByteRange {
                offset: part.offset(self.plan.part_size),
                len: part.byte_count,
            };
            let task = TransferTask::from_record(
                record,
                Some(handle),
                Some(range),
                Arc::clone(&self.store),
                part_sink.clone(),
            );
            self.inner.lock().unwrap().active.insert(
                task.id().clone(),
                ActivePart {
                    part_number,
                    byte_count: part.byte_count,
                    bytes_transferred: 0,
                },
            );
            self.registry.register(Arc::clone(&task));
            self.registry.bind_handle(handle, task.id());
            debug!(session = %self.id(), part = part_number, handle = handle.0, "adopted recovered part");
        }

        self.dispatch(&upload_id, &mut pending, &mut attempts, &part_sink)?;

        while !self.inner.lock().unwrap().active.is_empty() || !pending.is_empty() {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = self.wake.notified() => {
                    self.dispatch(&upload_id, &mut pending, &mut attempts, &part_sink)?;
                    continue;
                }
                event = part_events.recv() => event,
            };
            let Some((task_id, event)) = event else {
                return Err(TransferError::Service("part event stream closed".into()));
            };

            match event {
                TransferEvent::ProgressUpdated {
                    bytes_transferred, ..
                } => {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(part) = inner.active.get_mut(&task_id) {
                        part.bytes_transferred = bytes_transferred;
                    }
                    let in_flight: u64 =
                        inner.active.values().map(|p| p.bytes_transferred).sum();
                    drop(inner);
                    self.emit(SessionEvent::InProcess {
                        progress: TransferProgress {
                            bytes_transferred: completed_bytes + in_flight,
                            total_bytes,
                        },
                    });
                }
                TransferEvent::Completed { etag, .. } => {
                    let Some(part) = self.take_active(&task_id) else {
                        continue;
                    };
                    let etag = etag.unwrap_or_default();
                    self.parent
                        .record_completed_part(part.part_number, etag)?;
                    completed_bytes += part.byte_count;
                    debug!(
                        session = %self.id(),
                        part = part.part_number,
                        "part completed"
                    );
                    self.emit(SessionEvent::InProcess {
                        progress: TransferProgress {
                            bytes_transferred: completed_bytes,
                            total_bytes,
                        },
                    });
                    self.dispatch(&upload_id, &mut pending, &mut attempts, &part_sink)?;
                }
                TransferEvent::Failed { error } => {
                    let Some(part) = self.take_active(&task_id) else {
                        continue;
                    };
                    let made = attempts.get(&part.part_number).copied().unwrap_or(0);
                    if made >= self.config.part_attempt_limit {
                        warn!(
                            session = %self.id(),
                            part = part.part_number,
                            attempts = made,
                            error = %error,
                            "part exhausted its attempts"
                        );
                        return Err(TransferError::Network(format!(
                            "part {} failed after {made} attempts: {error}",
                            part.part_number
                        )));
                    }
                    debug!(
                        session = %self.id(),
                        part = part.part_number,
                        attempt = made,
                        error = %error,
                        "retrying part"
                    );
                    pending.push_back(part.part_number);
                    self.dispatch(&upload_id, &mut pending, &mut attempts, &part_sink)?;
                }
                TransferEvent::Initiated => {}
            }
        }

        self.finish_completed(&upload_id).await
    }

    /// Re-uses a recovered upload id when the parent record carries
    /// one; otherwise asks the store for a fresh one and persists it
    /// before any part moves.
    async fn acquire_upload_id(&self) -> Result<String, TransferError> {
        if let Some(multipart) = self.parent.multipart() {
            debug!(session = %self.id(), upload_id = %multipart.upload_id, "reusing upload id");
            return Ok(multipart.upload_id);
        }

        let upload_id = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            result = self.client.create_multipart_upload(
                self.parent.bucket(),
                self.parent.key(),
            ) => result?,
        };
        self.parent.set_multipart(MultipartRecord {
            upload_id: upload_id.clone(),
            file_size: self.plan.total_bytes(),
            part_size: self.plan.part_size,
            completed_parts: Vec::new(),
        })?;
        info!(session = %self.id(), upload_id = %upload_id, "multipart upload created");
        Ok(upload_id)
    }

    /// Fills the dispatch window up to the concurrency cap. No-op
    /// while paused.
    fn dispatch(
        &self,
        upload_id: &str,
        pending: &mut VecDeque<i32>,
        attempts: &mut HashMap<i32, u32>,
        part_sink: &mpsc::UnboundedSender<(TransferId, TransferEvent)>,
    ) -> Result<(), TransferError> {
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if inner.paused || inner.active.len() >= self.config.max_concurrency {
                    return Ok(());
                }
            }
            let Some(part_number) = pending.pop_front() else {
                return Ok(());
            };
            *attempts.entry(part_number).or_insert(0) += 1;

            let part = self
                .plan
                .parts
                .iter()
                .find(|p| p.part_number == part_number)
                .ok_or_else(|| {
                    TransferError::Service(format!("part {part_number} missing from plan"))
                })?;

            let task = TransferTask::create(
                TransferId::new(),
                TransferKind::MultipartPart {
                    upload_id: upload_id.to_string(),
                    part_number,
                },
                self.parent.bucket(),
                self.parent.key(),
                self.parent.file_path(),
                Some(ByteRange {
                    offset: part.offset(self.plan.part_size),
                    len: part.byte_count,
                }),
                part.byte_count,
                Arc::clone(&self.store),
                part_sink.clone(),
            )?;

            self.inner.lock().unwrap().active.insert(
                task.id().clone(),
                ActivePart {
                    part_number,
                    byte_count: part.byte_count,
                    bytes_transferred: 0,
                },
            );
            self.registry.register(Arc::clone(&task));
            match task.resume(self.host.as_ref()) {
                Ok(Some(handle)) => self.registry.bind_handle(handle, task.id()),
                Ok(None) => {}
                Err(e) => {
                    // Submission never left the process; count it as a
                    // failed attempt through the normal path.
                    self.take_active(task.id());
                    self.registry.remove(task.id());
                    let made = attempts.get(&part_number).copied().unwrap_or(0);
                    if made >= self.config.part_attempt_limit {
                        return Err(e);
                    }
                    pending.push_back(part_number);
                }
            }
        }
    }

    fn take_active(&self, task_id: &TransferId) -> Option<ActivePart> {
        let part = self.inner.lock().unwrap().active.remove(task_id);
        if part.is_some() {
            self.registry.remove(task_id);
        }
        part
    }

    async fn finish_completed(&self, upload_id: &str) -> Result<(), TransferError> {
        self.set_state(MultipartState::Completing);

        let mut parts: Vec<CompletedPart> = self
            .parent
            .multipart()
            .map(|m| {
                m.completed_parts
                    .into_iter()
                    .map(|p| CompletedPart {
                        part_number: p.part_number,
                        etag: p.etag,
                    })
                    .collect()
            })
            .unwrap_or_default();
        parts.sort_by_key(|p| p.part_number);
        if parts.len() != self.plan.parts.len() {
            return Err(TransferError::Service(format!(
                "have {} eTags for {} parts",
                parts.len(),
                self.plan.parts.len()
            )));
        }

        let mut last_err = None;
        for attempt in 1..=self.config.complete_attempt_limit {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                result = self.client.complete_multipart_upload(
                    self.parent.bucket(),
                    self.parent.key(),
                    upload_id,
                    parts.clone(),
                ) => result,
            };
            match result {
                Ok(()) => {
                    self.set_state(MultipartState::Completed);
                    self.parent.complete(None);
                    info!(session = %self.id(), upload_id = %upload_id, "multipart upload completed");
                    self.emit(SessionEvent::Completed);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        session = %self.id(),
                        attempt,
                        error = %e,
                        "complete call failed"
                    );
                    last_err = Some(e);
                    if attempt < self.config.complete_attempt_limit {
                        tokio::time::sleep(self.config.complete_retry_delay).await;
                    }
                }
            }
        }

        // The parts are all with the store and their eTags are
        // persisted; the record is left in place so a later run can
        // retry completion without re-uploading anything.
        let error = last_err
            .unwrap_or_else(|| TransferError::Service("complete failed".into()));
        self.set_state(MultipartState::Failed);
        self.emit(SessionEvent::Failed {
            error: error.to_string(),
        });
        Err(error)
    }

    /// Tears a failed session down: in-flight parts are cancelled and
    /// the store-side upload is aborted, exactly once. An abort-driven
    /// teardown ends in `Aborted`; `Failed` is reserved for sessions
    /// that never got an upload id to abort (and for completion
    /// exhaustion, which keeps the upload alive).
    async fn finish_failed(&self, error: &TransferError) {
        self.set_state(MultipartState::Aborting);
        self.cancel_active_parts();
        let had_upload = self.parent.multipart().is_some();
        self.abort_upload().await;
        self.set_state(if had_upload {
            MultipartState::Aborted
        } else {
            MultipartState::Failed
        });
        self.parent.fail(error.to_string());
        self.emit(SessionEvent::Failed {
            error: error.to_string(),
        });
    }

    async fn finish_aborted(&self) {
        self.set_state(MultipartState::Aborting);
        self.cancel_active_parts();
        self.abort_upload().await;
        self.set_state(MultipartState::Aborted);
        self.parent.cancel(self.host.as_ref()).ok();
        self.emit(SessionEvent::Failed {
            error: "cancelled".into(),
        });
    }

    fn cancel_active_parts(&self) {
        let ids: Vec<TransferId> = self
            .inner
            .lock()
            .unwrap()
            .active
            .keys()
            .cloned()
            .collect();
        for id in &ids {
            if let Some(task) = self.registry.get(id) {
                if let Err(e) = task.cancel(self.host.as_ref()) {
                    warn!(session = %self.id(), part = %id, error = %e, "part cancel failed");
                }
            }
            self.take_active(id);
        }
    }

    async fn abort_upload(&self) {
        let Some(multipart) = self.parent.multipart() else {
            return;
        };
        if let Err(e) = self
            .client
            .abort_multipart_upload(
                self.parent.bucket(),
                self.parent.key(),
                &multipart.upload_id,
            )
            .await
        {
            // Store-side garbage collection will reap it eventually.
            warn!(session = %self.id(), upload_id = %multipart.upload_id, error = %e, "abort call failed");
        } else {
            info!(session = %self.id(), upload_id = %multipart.upload_id, "multipart upload aborted");
        }
    }

    fn set_state(&self, state: MultipartState) {
        self.inner.lock().unwrap().state = state;
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send((self.id().clone(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stowage_protocol::HandleId;
    use tempfile::TempDir;

    use crate::client::ClientFuture;
    use crate::host::{HandleError, RequestKind, TransferRequest};
    use crate::planner::{self, PartSizePolicy};

    struct MockClient {
        created: Mutex<Vec<String>>,
        completed: Mutex<Vec<Vec<CompletedPart>>>,
        aborted: Mutex<Vec<String>>,
        create_failures: AtomicU32,
        complete_failures: AtomicU32,
    }

    impl MockClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: Mutex::new(Vec::new()),
                completed: Mutex::new(Vec::new()),
                aborted: Mutex::new(Vec::new()),
                create_failures: AtomicU32::new(0),
                complete_failures: AtomicU32::new(0),
            })
        }

        fn failing_creates(failures: u32) -> Arc<Self> {
            let client = Self::new();
            client.create_failures.store(failures, Ordering::SeqCst);
            client
        }

        fn failing_completes(failures: u32) -> Arc<Self> {
            let client = Self::new();
            client.complete_failures.store(failures, Ordering::SeqCst);
            client
        }
    }

    impl ObjectStoreClient for MockClient {
        fn create_multipart_upload(&self, _bucket: &str, key: &str) -> ClientFuture<'_, String> {
            let key = key.to_string();
            Box::pin(async move {
                if self.create_failures.load(Ordering::SeqCst) > 0 {
                    self.create_failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(TransferError::Service("internal error".into()));
                }
                self.created.lock().unwrap().push(key);
                Ok("upload-1".to_string())
            })
        }

        fn complete_multipart_upload(
            &self,
            _bucket: &str,
            _key: &str,
            _upload_id: &str,
            parts: Vec<CompletedPart>,
        ) -> ClientFuture<'_, ()> {
            Box::pin(async move {
                if self.complete_failures.load(Ordering::SeqCst) > 0 {
                    self.complete_failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(TransferError::Service("internal error".into()));
                }
                self.completed.lock().unwrap().push(parts);
                Ok(())
            })
        }

        fn abort_multipart_upload(
            &self,
            _bucket: &str,
            _key: &str,
            upload_id: &str,
        ) -> ClientFuture<'_, ()> {
            let upload_id = upload_id.to_string();
            Box::pin(async move {
                self.aborted.lock().unwrap().push(upload_id);
                Ok(())
            })
        }
    }

    /// Host that finishes every submitted part on a background task,
    /// optionally failing a part's first N attempts.
    struct InstantHost {
        next_handle: AtomicU32,
        registry: Mutex<Option<Arc<Registry>>>,
        fail_attempts: Mutex<HashMap<i32, u32>>,
        submissions: Mutex<Vec<i32>>,
    }

    impl InstantHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_handle: AtomicU32::new(1),
                registry: Mutex::new(None),
                fail_attempts: Mutex::new(HashMap::new()),
                submissions: Mutex::new(Vec::new()),
            })
        }

        fn attach(&self, registry: &Arc<Registry>) {
            *self.registry.lock().unwrap() = Some(Arc::clone(registry));
        }

        fn fail_part(&self, part_number: i32, times: u32) {
            self.fail_attempts
                .lock()
                .unwrap()
                .insert(part_number, times);
        }

        fn submitted_parts(&self) -> Vec<i32> {
            self.submissions.lock().unwrap().clone()
        }
    }

    impl BackgroundTransferHost for InstantHost {
        fn submit(&self, request: &TransferRequest) -> Result<HandleId, TransferError> {
            let RequestKind::UploadPart { part_number, .. } = request.operation else {
                return Err(TransferError::Service("unexpected request".into()));
            };
            let handle = HandleId(self.next_handle.fetch_add(1, Ordering::SeqCst) as u64);
            self.submissions.lock().unwrap().push(part_number);

            let fail = {
                let mut fails = self.fail_attempts.lock().unwrap();
                match fails.get_mut(&part_number) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        true
                    }
                    _ => false,
                }
            };

            let registry = Arc::clone(self.registry.lock().unwrap().as_ref().unwrap());
            let len = request.range.map(|r| r.len).unwrap_or(0);
            tokio::spawn(async move {
                // The caller binds the handle right after submit
                // returns; wait for the binding to show up.
                let task = loop {
                    if let Some(task) = registry.task_for_handle(handle) {
                        break task;
                    }
                    tokio::task::yield_now().await;
                };
                if fail {
                    task.fail("injected failure");
                } else {
                    task.progress(len, len);
                    task.complete(Some(format!("\"etag-{part_number}\"")));
                }
            });
            Ok(handle)
        }

        fn suspend(&self, _handle: HandleId) {}
        fn resume(&self, _handle: HandleId) {}
        fn cancel(&self, _handle: HandleId) {}

        fn live_handles(&self) -> Vec<HandleId> {
            Vec::new()
        }

        fn is_benign_interruption(&self, _error: &HandleError) -> bool {
            false
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<TransferStore>,
        registry: Arc<Registry>,
        host: Arc<InstantHost>,
        client: Arc<MockClient>,
        parent: Arc<TransferTask>,
        plan: PartPlan,
        events: mpsc::UnboundedReceiver<(TransferId, SessionEvent)>,
        sink: SessionEventSink,
    }

    fn fixture(file_size: u64, part_size: u64, client: Arc<MockClient>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TransferStore::open(dir.path().join("records")).unwrap());
        let registry = Arc::new(Registry::new());
        let host = InstantHost::new();
        host.attach(&registry);

        let source = dir.path().join("source.bin");
        std::fs::write(&source, vec![0xA5u8; file_size as usize]).unwrap();

        let (part_sink, _part_events) = mpsc::unbounded_channel();
        let parent = TransferTask::create(
            TransferId::from("parent"),
            TransferKind::MultipartCreate,
            "bucket",
            "big/object",
            &source,
            None,
            file_size,
            Arc::clone(&store),
            part_sink,
        )
        .unwrap();

        let plan = planner::plan_parts(file_size, PartSizePolicy::Fixed(part_size)).unwrap();
        let (sink, events) = mpsc::unbounded_channel();
        Fixture {
            _dir: dir,
            store,
            registry,
            host,
            client,
            parent,
            plan,
            events,
            sink,
        }
    }

    fn session(fx: &Fixture, config: MultipartConfig) -> Arc<MultipartSession> {
        MultipartSession::new(
            Arc::clone(&fx.parent),
            fx.plan.clone(),
            fx.client.clone() as Arc<dyn ObjectStoreClient>,
            fx.host.clone() as Arc<dyn BackgroundTransferHost>,
            Arc::clone(&fx.registry),
            Arc::clone(&fx.store),
            config,
            fx.sink.clone(),
        )
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<(TransferId, SessionEvent)>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok((_, e)) = events.try_recv() {
            out.push(e);
        }
        out
    }

    /// Host that records submissions and leaves completion to the
    /// test.
    struct ManualHost {
        next_handle: AtomicU32,
        submissions: Mutex<Vec<(i32, HandleId)>>,
    }

    impl ManualHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_handle: AtomicU32::new(1),
                submissions: Mutex::new(Vec::new()),
            })
        }
    }

    impl BackgroundTransferHost for ManualHost {
        fn submit(&self, request: &TransferRequest) -> Result<HandleId, TransferError> {
            let RequestKind::UploadPart { part_number, .. } = request.operation else {
                return Err(TransferError::Service("unexpected request".into()));
            };
            let handle = HandleId(self.next_handle.fetch_add(1, Ordering::SeqCst) as u64);
            self.submissions.lock().unwrap().push((part_number, handle));
            Ok(handle)
        }

        fn suspend(&self, _handle: HandleId) {}
        fn resume(&self, _handle: HandleId) {}
        fn cancel(&self, _handle: HandleId) {}

        fn live_handles(&self) -> Vec<HandleId> {
            Vec::new()
        }

        fn is_benign_interruption(&self, _error: &HandleError) -> bool {
            false
        }
    }

    async fn wait_for<T>(mut condition: impl FnMut() -> Option<T>) -> T {
        for _ in 0..5000 {
            if let Some(value) = condition() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn uploads_all_parts_and_completes() {
        let mut fx = fixture(25, 10, MockClient::new());
        let session = session(&fx, MultipartConfig::default());

        session.run().await.unwrap();

        assert_eq!(fx.client.created.lock().unwrap().len(), 1);
        let completed = fx.client.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        let parts = &completed[0];
        assert_eq!(
            parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(parts[2].etag, "\"etag-3\"");

        // Parent and part records are all gone.
        assert!(fx.store.is_empty());
        assert!(fx.registry.is_empty());

        let events = drain(&mut fx.events);
        assert!(matches!(events.first(), Some(SessionEvent::Initiated)));
        assert!(matches!(events.last(), Some(SessionEvent::Completed)));
    }

    #[tokio::test]
    async fn retries_a_failed_part_within_the_limit() {
        let fx = fixture(25, 10, MockClient::new());
        fx.host.fail_part(2, 2);
        let session = session(&fx, MultipartConfig::default());

        session.run().await.unwrap();

        assert_eq!(fx.client.completed.lock().unwrap().len(), 1);
        let submitted = fx.host.submitted_parts();
        assert_eq!(submitted.iter().filter(|&&p| p == 2).count(), 3);
        assert!(fx.client.aborted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn aborts_once_after_a_part_exhausts_its_attempts() {
        let mut fx = fixture(25, 10, MockClient::new());
        fx.host.fail_part(2, 10);
        let session = session(&fx, MultipartConfig::default());

        let err = Arc::clone(&session).run().await.unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));
        assert_eq!(session.state(), MultipartState::Aborted);

        assert_eq!(
            fx.client.aborted.lock().unwrap().as_slice(),
            ["upload-1".to_string()]
        );
        assert!(fx.client.completed.lock().unwrap().is_empty());
        assert!(fx.store.get(&TransferId::from("parent")).is_none());

        let events = drain(&mut fx.events);
        assert!(matches!(events.last(), Some(SessionEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn creation_failure_ends_failed_with_nothing_to_abort() {
        let mut fx = fixture(25, 10, MockClient::failing_creates(1));
        let session = session(&fx, MultipartConfig::default());

        let err = Arc::clone(&session).run().await.unwrap_err();
        assert!(matches!(err, TransferError::Service(_)));
        assert_eq!(session.state(), MultipartState::Failed);

        // No upload id ever existed, so there is no abort call.
        assert!(fx.client.aborted.lock().unwrap().is_empty());
        assert!(fx.host.submitted_parts().is_empty());

        let events = drain(&mut fx.events);
        assert!(matches!(events.last(), Some(SessionEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn cancel_aborts_the_upload() {
        let mut fx = fixture(25, 10, MockClient::new());
        let session = session(&fx, MultipartConfig::default());

        session.request_cancel();
        let err = Arc::clone(&session).run().await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(session.state(), MultipartState::Aborted);

        let events = drain(&mut fx.events);
        assert!(
            matches!(events.last(), Some(SessionEvent::Failed { error }) if error == "cancelled")
        );
    }

    #[tokio::test]
    async fn recovered_session_skips_parts_with_persisted_etags() {
        let fx = fixture(25, 10, MockClient::new());
        fx.parent
            .set_multipart(MultipartRecord {
                upload_id: "upload-7".into(),
                file_size: 25,
                part_size: 10,
                completed_parts: vec![stowage_protocol::CompletedPartRecord {
                    part_number: 1,
                    etag: "\"old-1\"".into(),
                }],
            })
            .unwrap();
        let session = session(&fx, MultipartConfig::default());

        session.run().await.unwrap();

        // No fresh create call, and part 1 was never re-sent.
        assert!(fx.client.created.lock().unwrap().is_empty());
        let submitted = fx.host.submitted_parts();
        assert!(!submitted.contains(&1));

        let completed = fx.client.completed.lock().unwrap();
        let parts = &completed[0];
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].etag, "\"old-1\"");
    }

    #[tokio::test]
    async fn completion_exhaustion_keeps_the_record_and_skips_abort() {
        let mut fx = fixture(25, 10, MockClient::failing_completes(10));
        let config = MultipartConfig {
            complete_attempt_limit: 2,
            complete_retry_delay: Duration::from_millis(1),
            ..MultipartConfig::default()
        };
        let session = session(&fx, config);

        let err = Arc::clone(&session).run().await.unwrap_err();
        assert!(matches!(err, TransferError::Service(_)));
        assert_eq!(session.state(), MultipartState::Failed);

        // Everything uploaded fine; the record survives so a later run
        // can redo the complete call from the persisted eTags.
        assert!(fx.client.aborted.lock().unwrap().is_empty());
        let record = fx.store.get(&TransferId::from("parent")).unwrap();
        assert_eq!(record.multipart.unwrap().completed_parts.len(), 3);

        let events = drain(&mut fx.events);
        assert!(matches!(events.last(), Some(SessionEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_in_flight_parts() {
        let fx = fixture(50, 10, MockClient::new());
        let config = MultipartConfig {
            max_concurrency: 1,
            ..MultipartConfig::default()
        };
        let session = session(&fx, config);

        session.run().await.unwrap();

        // Serial dispatch means parts go out in plan order.
        assert_eq!(fx.host.submitted_parts(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn adopted_live_handles_leave_only_the_rest_to_send() {
        // 66 bytes in 10-byte parts: 7 parts, the last one 6 bytes.
        // Two parts were in flight when the process died and their
        // handles survived; only the other five may be sent.
        let fx = fixture(66, 10, MockClient::new());
        fx.parent
            .set_multipart(MultipartRecord {
                upload_id: "upload-7".into(),
                file_size: 66,
                part_size: 10,
                completed_parts: Vec::new(),
            })
            .unwrap();

        let adopted: Vec<(stowage_protocol::PersistedTask, HandleId)> = [(1, 101u64), (2, 102u64)]
            .into_iter()
            .map(|(part_number, handle)| {
                let mut record = stowage_protocol::PersistedTask::new(
                    TransferId::from(format!("rec-{part_number}").as_str()),
                    TransferKind::MultipartPart {
                        upload_id: "upload-7".into(),
                        part_number,
                    },
                    "bucket",
                    "big/object",
                    fx.parent.file_path().to_string_lossy(),
                );
                record.handle = Some(HandleId(handle));
                (record, HandleId(handle))
            })
            .collect();

        let session = session(&fx, MultipartConfig::default());
        session.adopt_recovered_parts(adopted);

        let registry = Arc::clone(&fx.registry);
        let run = tokio::spawn(Arc::clone(&session).run());

        // The surviving handles finish on their own schedule.
        for (part_number, handle) in [(1, HandleId(101)), (2, HandleId(102))] {
            let task = wait_for(|| registry.task_for_handle(handle)).await;
            task.complete(Some(format!("\"etag-{part_number}\"")));
        }

        run.await.unwrap().unwrap();

        let mut sent = fx.host.submitted_parts();
        sent.sort_unstable();
        assert_eq!(sent, vec![3, 4, 5, 6, 7]);

        let completed = fx.client.completed.lock().unwrap();
        let parts = &completed[0];
        assert_eq!(parts.len(), 7);
        assert_eq!(parts[0].etag, "\"etag-1\"");
        assert_eq!(parts[1].etag, "\"etag-2\"");
    }

    #[tokio::test]
    async fn parts_completing_out_of_order_still_complete_the_upload() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TransferStore::open(dir.path().join("records")).unwrap());
        let registry = Arc::new(Registry::new());
        let host = ManualHost::new();
        let client = MockClient::new();

        let source = dir.path().join("source.bin");
        std::fs::write(&source, vec![0x5Au8; 25]).unwrap();

        let (part_sink, _part_events) = mpsc::unbounded_channel();
        let parent = TransferTask::create(
            TransferId::from("parent"),
            TransferKind::MultipartCreate,
            "bucket",
            "big/object",
            &source,
            None,
            25,
            Arc::clone(&store),
            part_sink,
        )
        .unwrap();
        let plan = planner::plan_parts(25, PartSizePolicy::Fixed(10)).unwrap();

        let (sink, _events) = mpsc::unbounded_channel();
        let session = MultipartSession::new(
            parent,
            plan,
            client.clone() as Arc<dyn ObjectStoreClient>,
            host.clone() as Arc<dyn BackgroundTransferHost>,
            Arc::clone(&registry),
            store,
            MultipartConfig::default(),
            sink,
        );

        let run = tokio::spawn(Arc::clone(&session).run());

        let submissions = wait_for(|| {
            let subs = host.submissions.lock().unwrap().clone();
            (subs.len() == 3).then_some(subs)
        })
        .await;

        // Finish them highest part first.
        let mut reversed = submissions.clone();
        reversed.sort_unstable_by_key(|(part, _)| std::cmp::Reverse(*part));
        for (part_number, handle) in reversed {
            let task = wait_for(|| registry.task_for_handle(handle)).await;
            task.complete(Some(format!("\"etag-{part_number}\"")));
        }

        run.await.unwrap().unwrap();

        let completed = client.completed.lock().unwrap();
        let parts = &completed[0];
        assert_eq!(
            parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
}

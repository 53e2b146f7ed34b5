//! Engine facade.
//!
//! [`TransferEngine`] is the single entry point: it owns the record
//! store, the task registry, and the live multipart sessions, and
//! exposes enqueue, pause, resume, cancel, and startup recovery.
//! Callers construct it with their [`BackgroundTransferHost`] and
//! [`ObjectStoreClient`] implementations and forward host callbacks to
//! [`handle_event`](TransferEngine::handle_event).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use stowage_protocol::{HandleId, PersistedTask, TransferId, TransferKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::ObjectStoreClient;
use crate::controller::SessionController;
use crate::error::TransferError;
use crate::events::{EventSink, SessionEventSink, SessionEvents, TaskEvents};
use crate::host::{BackgroundTransferHost, HandleEvent};
use crate::planner::{self, PartSizePolicy};
use crate::registry::Registry;
use crate::session::{MultipartConfig, MultipartSession};
use crate::store::TransferStore;
use crate::task::TransferTask;

/// Engine construction settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory the task records live in.
    pub store_dir: PathBuf,
    /// Uploads at or above this size go multipart.
    pub multipart_threshold: u64,
    pub part_size_policy: PartSizePolicy,
    pub multipart: MultipartConfig,
}

impl EngineConfig {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            multipart_threshold: 16 * 1024 * 1024,
            part_size_policy: PartSizePolicy::Auto,
            multipart: MultipartConfig::default(),
        }
    }
}

/// What startup recovery found and did.
#[derive(Debug, Default)]
pub struct RecoverySummary {
    /// Transfers carried forward, attached or restarted.
    pub resumed: Vec<TransferId>,
    /// Whole-file transfers whose handle did not survive. Their tasks
    /// are registered in `Ready`; the caller decides between
    /// [`resume`](TransferEngine::resume) (restart from scratch) and
    /// [`cancel`](TransferEngine::cancel).
    pub orphaned: Vec<(TransferId, String)>,
}

/// Client-side transfer engine. One instance per store directory.
pub struct TransferEngine {
    host: Arc<dyn BackgroundTransferHost>,
    client: Arc<dyn ObjectStoreClient>,
    store: Arc<TransferStore>,
    registry: Arc<Registry>,
    controller: SessionController,
    config: EngineConfig,
    task_sink: EventSink,
    session_sink: SessionEventSink,
    task_events: Mutex<Option<TaskEvents>>,
    session_events: Mutex<Option<SessionEvents>>,
    sessions: Arc<Mutex<HashMap<TransferId, Arc<MultipartSession>>>>,
}

impl TransferEngine {
    pub fn new(
        host: Arc<dyn BackgroundTransferHost>,
        client: Arc<dyn ObjectStoreClient>,
        config: EngineConfig,
    ) -> Result<Self, TransferError> {
        let store = Arc::new(TransferStore::open(&config.store_dir)?);
        let registry = Arc::new(Registry::new());
        let controller = SessionController::new(Arc::clone(&registry), Arc::clone(&host));
        let (task_sink, task_events) = mpsc::unbounded_channel();
        let (session_sink, session_events) = mpsc::unbounded_channel();
        Ok(Self {
            host,
            client,
            store,
            registry,
            controller,
            config,
            task_sink,
            session_sink,
            task_events: Mutex::new(Some(task_events)),
            session_events: Mutex::new(Some(session_events)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Takes the task event stream. Callable once.
    pub fn take_events(&self) -> Option<TaskEvents> {
        self.task_events.lock().unwrap().take()
    }

    /// Takes the multipart session event stream. Callable once.
    pub fn take_session_events(&self) -> Option<SessionEvents> {
        self.session_events.lock().unwrap().take()
    }

    /// Enqueues and starts an upload. Files at or above the multipart
    /// threshold are split and sent as a multipart upload; smaller
    /// ones go up in one resumable request. Must be called from a
    /// tokio runtime context.
    pub fn upload(
        &self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Result<TransferId, TransferError> {
        let file_path = file_path.into();
        let size = fs::metadata(&file_path)?.len();
        if size >= self.config.multipart_threshold {
            self.start_multipart(bucket.into(), key.into(), file_path, size)
        } else {
            self.start_single(TransferKind::Upload, bucket.into(), key.into(), file_path, size)
        }
    }

    /// Forces a multipart upload regardless of size. Planning still
    /// rejects empty files.
    pub fn upload_multipart(
        &self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Result<TransferId, TransferError> {
        let file_path = file_path.into();
        let size = fs::metadata(&file_path)?.len();
        self.start_multipart(bucket.into(), key.into(), file_path, size)
    }

    /// Enqueues and starts a download to `file_path`.
    pub fn download(
        &self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Result<TransferId, TransferError> {
        self.start_single(
            TransferKind::Download,
            bucket.into(),
            key.into(),
            file_path.into(),
            0,
        )
    }

    fn start_single(
        &self,
        kind: TransferKind,
        bucket: String,
        key: String,
        file_path: PathBuf,
        total_bytes: u64,
    ) -> Result<TransferId, TransferError> {
        let id = TransferId::new();
        let task = TransferTask::create(
            id.clone(),
            kind,
            bucket,
            key,
            file_path,
            None,
            total_bytes,
            Arc::clone(&self.store),
            self.task_sink.clone(),
        )?;
        self.registry.register(Arc::clone(&task));
        match task.resume(self.host.as_ref()) {
            Ok(Some(handle)) => self.registry.bind_handle(handle, &id),
            Ok(None) => {}
            Err(e) => {
                // The record is gone before the caller sees the error.
                task.fail(e.to_string());
                self.registry.remove(&id);
                return Err(e);
            }
        }
        Ok(id)
    }

    fn start_multipart(
        &self,
        bucket: String,
        key: String,
        file_path: PathBuf,
        size: u64,
    ) -> Result<TransferId, TransferError> {
        let plan = planner::plan_parts(size, self.config.part_size_policy)?;
        let id = TransferId::new();
        let parent = TransferTask::create(
            id.clone(),
            TransferKind::MultipartCreate,
            bucket,
            key,
            file_path,
            None,
            size,
            Arc::clone(&self.store),
            self.task_sink.clone(),
        )?;
        self.registry.register(Arc::clone(&parent));
        info!(transfer = %id, size, parts = plan.parts.len(), "starting multipart upload");
        self.spawn_session(parent, plan, Vec::new());
        Ok(id)
    }

    fn spawn_session(
        &self,
        parent: Arc<TransferTask>,
        plan: planner::PartPlan,
        recovered_parts: Vec<(PersistedTask, HandleId)>,
    ) {
        let id = parent.id().clone();
        let session = MultipartSession::new(
            parent,
            plan,
            Arc::clone(&self.client),
            Arc::clone(&self.host),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.config.multipart.clone(),
            self.session_sink.clone(),
        );
        session.adopt_recovered_parts(recovered_parts);
        self.sessions
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::clone(&session));

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let _ = Arc::clone(&session).run().await;
            sessions.lock().unwrap().remove(&id);
        });
    }

    /// Suspends a transfer. For multipart uploads every in-flight part
    /// is suspended and dispatch stops.
    pub fn pause(&self, id: &TransferId) -> Result<(), TransferError> {
        if let Some(session) = self.session(id) {
            session.pause();
            return Ok(());
        }
        let task = self.task(id)?;
        if let Some(handle) = task.pause(self.host.as_ref())? {
            self.registry.unbind_handle(handle);
        }
        Ok(())
    }

    /// Resumes a paused transfer, reattaching its suspended handles or
    /// submitting afresh.
    pub fn resume(&self, id: &TransferId) -> Result<(), TransferError> {
        if let Some(session) = self.session(id) {
            session.resume();
            return Ok(());
        }
        let task = self.task(id)?;
        // A parent with no session has nothing driving its parts;
        // resuming it would park an upload nobody finishes.
        if matches!(task.kind(), TransferKind::MultipartCreate) {
            return Err(TransferError::Service(format!(
                "multipart upload {id} has no active session"
            )));
        }
        if let Some(handle) = task.resume(self.host.as_ref())? {
            self.registry.bind_handle(handle, id);
        }
        Ok(())
    }

    /// Cancels a transfer. Multipart uploads abort their store-side
    /// upload; single transfers discard their handle.
    pub fn cancel(&self, id: &TransferId) -> Result<(), TransferError> {
        if let Some(session) = self.session(id) {
            session.request_cancel();
            self.sessions.lock().unwrap().remove(id);
            return Ok(());
        }
        let task = self.task(id)?;
        if let Some(handle) = task.cancel(self.host.as_ref())? {
            self.registry.unbind_handle(handle);
        }
        self.registry.remove(id);
        Ok(())
    }

    /// Routes one host callback to the owning task.
    pub fn handle_event(&self, event: HandleEvent) {
        self.controller.handle_event(event);
    }

    /// Pairs persisted records with the handles the OS kept alive and
    /// carries every pairable transfer forward. Call once, after
    /// construction and before enqueuing new work.
    pub fn recover(&self) -> Result<RecoverySummary, TransferError> {
        let report = self.store.recover(&self.host.live_handles());
        let mut summary = RecoverySummary::default();

        let mut parts_by_upload: HashMap<String, Vec<(PersistedTask, HandleId)>> = HashMap::new();
        let mut parents = Vec::new();

        for recovered in report.recovered {
            match recovered.record.kind.clone() {
                TransferKind::MultipartPart { upload_id, .. } => match recovered.handle {
                    Some(handle) => parts_by_upload
                        .entry(upload_id)
                        .or_default()
                        .push((recovered.record, handle)),
                    None => {
                        // No live handle; the rebuilt session re-sends
                        // this part, so the stale record just goes.
                        self.store.remove(&recovered.record.transfer_id)?;
                    }
                },
                TransferKind::MultipartCreate => parents.push(recovered),
                TransferKind::Upload | TransferKind::Download => {
                    let id = recovered.record.transfer_id.clone();
                    let task = TransferTask::from_record(
                        recovered.record,
                        recovered.handle,
                        None,
                        Arc::clone(&self.store),
                        self.task_sink.clone(),
                    );
                    self.registry.register(task);
                    if let Some(handle) = recovered.handle {
                        self.registry.bind_handle(handle, &id);
                    }
                    debug!(transfer = %id, "reattached whole-file transfer");
                    summary.resumed.push(id);
                }
            }
        }

        for recovered in parents {
            let Some(plan) = recovered.plan else {
                continue;
            };
            let id = recovered.record.transfer_id.clone();
            let upload_id = recovered
                .record
                .multipart
                .as_ref()
                .map(|m| m.upload_id.clone())
                .unwrap_or_default();
            let parts = parts_by_upload.remove(&upload_id).unwrap_or_default();
            let parent = TransferTask::from_record(
                recovered.record,
                None,
                None,
                Arc::clone(&self.store),
                self.task_sink.clone(),
            );
            self.registry.register(Arc::clone(&parent));
            info!(transfer = %id, adopted = parts.len(), "rebuilding multipart session");
            self.spawn_session(parent, plan, parts);
            summary.resumed.push(id);
        }

        // Part handles whose parent record vanished cannot be finished
        // into any upload; discard them.
        for (upload_id, parts) in parts_by_upload {
            for (record, handle) in parts {
                warn!(
                    transfer = %record.transfer_id,
                    upload_id = %upload_id,
                    "part has no parent record, discarding"
                );
                self.host.cancel(handle);
                self.store.remove(&record.transfer_id)?;
            }
        }

        for orphan in report.orphaned {
            let id = orphan.record.transfer_id.clone();
            if matches!(orphan.record.kind, TransferKind::MultipartCreate) {
                // The process died between persisting the parent and
                // acquiring an upload id. The plan is reproducible
                // from the file size, so the upload restarts under a
                // fresh session.
                match planner::plan_parts(orphan.record.total_bytes, self.config.part_size_policy)
                {
                    Ok(plan) => {
                        let parent = TransferTask::from_record(
                            orphan.record,
                            None,
                            None,
                            Arc::clone(&self.store),
                            self.task_sink.clone(),
                        );
                        self.registry.register(Arc::clone(&parent));
                        info!(transfer = %id, "restarting multipart upload without an upload id");
                        self.spawn_session(parent, plan, Vec::new());
                        summary.resumed.push(id);
                    }
                    Err(e) => {
                        warn!(transfer = %id, error = %e, "multipart record cannot be replanned, discarding");
                        self.store.remove(&id)?;
                        summary.orphaned.push((id, e.to_string()));
                    }
                }
                continue;
            }
            let task = TransferTask::from_record(
                orphan.record,
                None,
                None,
                Arc::clone(&self.store),
                self.task_sink.clone(),
            );
            self.registry.register(task);
            summary.orphaned.push((id, orphan.error.to_string()));
        }

        info!(
            resumed = summary.resumed.len(),
            orphaned = summary.orphaned.len(),
            "recovery finished"
        );
        Ok(summary)
    }

    /// Flushes record durability before the process may be suspended,
    /// then calls `completion`. Safe to call at any point.
    pub fn prepare_for_background(&self, completion: impl FnOnce()) {
        self.store.prepare_for_background(completion);
    }

    pub fn status(&self, id: &TransferId) -> Option<stowage_protocol::TransferStatus> {
        self.registry.get(id).map(|t| t.status())
    }

    pub fn store_dir(&self) -> &Path {
        &self.config.store_dir
    }

    fn session(&self, id: &TransferId) -> Option<Arc<MultipartSession>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    fn task(&self, id: &TransferId) -> Result<Arc<TransferTask>, TransferError> {
        self.registry
            .get(id)
            .ok_or_else(|| TransferError::Service(format!("unknown transfer {id}")))
    }
}

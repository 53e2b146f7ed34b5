//! Durable record of every non-terminal transfer task.
//!
//! One JSON file per task under the store directory, written with a
//! temp-file + atomic-rename strategy so a crash mid-write never
//! corrupts an existing record. The store is the single source of
//! truth for "what is in flight": it is mutated before the
//! corresponding in-memory event is published, so a crash between the
//! two never loses durability.
//!
//! All operations are serialized behind one mutex and safe to call
//! from concurrent callback contexts.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use stowage_protocol::{HandleId, PersistedTask, TransferId, TransferKind};
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::planner::{self, PartPlan, PartSizePolicy};

/// Durable store of persisted task records, plus the startup recovery
/// pairing algorithm.
pub struct TransferStore {
    dir: PathBuf,
    inner: Mutex<HashMap<TransferId, PersistedTask>>,
}

/// A persisted task the engine can carry forward after a restart.
#[derive(Debug, Clone)]
pub struct RecoveredTask {
    pub record: PersistedTask,
    /// The live OS handle the record was matched to, when one exists.
    /// Part tasks without a match revert to a fresh upload.
    pub handle: Option<HandleId>,
    /// Reconstructed part plan, present for multipart parent records.
    pub plan: Option<PartPlan>,
}

/// A persisted whole-file task with no live handle to attach to.
/// Resuming it blindly would re-read the source from an unknown
/// offset, so it is surfaced instead of auto-resumed.
#[derive(Debug)]
pub struct OrphanedTask {
    pub record: PersistedTask,
    pub error: TransferError,
}

/// Outcome of the startup pairing between records and live handles.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<RecoveredTask>,
    pub orphaned: Vec<OrphanedTask>,
}

impl TransferStore {
    /// Opens (creating if needed) a store rooted at `dir` and loads
    /// every record found there. Unparseable files are skipped with a
    /// warning — one corrupt record must not block recovery of the
    /// rest.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| TransferError::Persistence(format!("create {}: {e}", dir.display())))?;

        let mut records = HashMap::new();
        let entries = fs::read_dir(&dir)
            .map_err(|e| TransferError::Persistence(format!("read {}: {e}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| TransferError::Persistence(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => {
                    records.insert(record.transfer_id.clone(), record);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable task record");
                }
            }
        }

        debug!(dir = %dir.display(), records = records.len(), "transfer store opened");
        Ok(Self {
            dir,
            inner: Mutex::new(records),
        })
    }

    fn read_record(path: &Path) -> Result<PersistedTask, TransferError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn record_path(&self, id: &TransferId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Inserts or rewrites a record. The file hits disk (write + fsync
    /// + rename) before this returns.
    pub fn upsert(&self, record: PersistedTask) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();

        let path = self.record_path(&record.transfer_id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| TransferError::Persistence(format!("serialize record: {e}")))?;

        let write = || -> std::io::Result<()> {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
            fs::rename(&tmp_path, &path)
        };
        write().map_err(|e| {
            TransferError::Persistence(format!("write record {}: {e}", record.transfer_id))
        })?;

        inner.insert(record.transfer_id.clone(), record);
        Ok(())
    }

    /// Deletes a record. Removing an id that is not present is fine —
    /// terminal transitions race with each other and removal must be
    /// idempotent.
    pub fn remove(&self, id: &TransferId) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(id);

        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::Persistence(format!(
                "remove record {id}: {e}"
            ))),
        }
    }

    pub fn get(&self, id: &TransferId) -> Option<PersistedTask> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    /// All records, sorted by transfer id for deterministic iteration.
    pub fn records(&self) -> Vec<PersistedTask> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<_> = inner.values().cloned().collect();
        records.sort_by(|a, b| a.transfer_id.as_str().cmp(b.transfer_id.as_str()));
        records
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pairs every persisted record against the set of live OS
    /// handles.
    ///
    /// - Multipart parent records are recovered unconditionally (the
    ///   create/complete calls are plain request/response, there is no
    ///   handle to match); their part plan is reconstructed
    ///   deterministically from the persisted file and part sizes.
    /// - Part records are recovered with their matched handle when it
    ///   is live, and with no handle otherwise (the part reverts to
    ///   `Pending` and is uploaded afresh).
    /// - Whole-file records are recovered only on a match; unmatched
    ///   ones are reported as orphaned, never silently resumed.
    pub fn recover(&self, live_handles: &[HandleId]) -> RecoveryReport {
        let live: HashSet<HandleId> = live_handles.iter().copied().collect();
        let mut report = RecoveryReport::default();

        for record in self.records() {
            match &record.kind {
                TransferKind::MultipartCreate => {
                    let plan = record.multipart.as_ref().and_then(|m| {
                        planner::plan_parts(m.file_size, PartSizePolicy::Fixed(m.part_size)).ok()
                    });
                    match plan {
                        Some(plan) => report.recovered.push(RecoveredTask {
                            record,
                            handle: None,
                            plan: Some(plan),
                        }),
                        None => {
                            // A parent record without reconstructible
                            // multipart state cannot drive an upload.
                            let id = record.transfer_id.clone();
                            report.orphaned.push(OrphanedTask {
                                record,
                                error: TransferError::RecoveryAmbiguity(format!(
                                    "multipart record {id} has no usable part plan"
                                )),
                            });
                        }
                    }
                }
                TransferKind::MultipartPart { .. } => {
                    let matched = record.handle.filter(|h| live.contains(h));
                    if matched.is_none() {
                        debug!(
                            transfer = %record.transfer_id,
                            "part record has no live handle; reverts to a fresh upload"
                        );
                    }
                    report.recovered.push(RecoveredTask {
                        record,
                        handle: matched,
                        plan: None,
                    });
                }
                TransferKind::Upload | TransferKind::Download => {
                    match record.handle.filter(|h| live.contains(h)) {
                        Some(handle) => report.recovered.push(RecoveredTask {
                            record,
                            handle: Some(handle),
                            plan: None,
                        }),
                        None => {
                            let id = record.transfer_id.clone();
                            report.orphaned.push(OrphanedTask {
                                record,
                                error: TransferError::RecoveryAmbiguity(format!(
                                    "no live handle for whole-file transfer {id}"
                                )),
                            });
                        }
                    }
                }
            }
        }

        report
    }

    /// Flushes pending persistence state before the process may
    /// suspend, then invokes `completion`.
    ///
    /// Record writes are write-through and fsynced individually; what
    /// remains is making the renames themselves durable, which takes
    /// an fsync of the store directory. Holding the lock also drains
    /// any write still in flight on another thread.
    pub fn prepare_for_background(&self, completion: impl FnOnce()) {
        {
            let _inner = self.inner.lock().unwrap();
            if let Ok(dir) = File::open(&self.dir)
                && let Err(e) = dir.sync_all()
            {
                warn!(dir = %self.dir.display(), error = %e, "store directory fsync failed");
            }
        }
        completion();
    }
}

//! Client-side storage transfer engine.
//!
//! Moves objects between local files and an object store on top of an
//! OS background-transfer facility, so transfers survive process
//! suspension and death. Large uploads are split into a multipart
//! upload with bounded part fan-out; every non-terminal task is
//! persisted as a JSON record and paired back to the OS's surviving
//! handles at the next launch.
//!
//! The embedder provides two integrations: a
//! [`BackgroundTransferHost`] over the platform transfer facility and
//! an [`ObjectStoreClient`] for the multipart create/complete/abort
//! calls. [`TransferEngine`] ties them together.

pub mod checksum;
pub mod client;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod planner;
pub mod registry;
pub mod session;
pub mod store;
pub mod task;

pub use client::{ClientFuture, CompletedPart, ObjectStoreClient};
pub use controller::SessionController;
pub use engine::{EngineConfig, RecoverySummary, TransferEngine};
pub use error::TransferError;
pub use events::{EventSink, SessionEvent, SessionEventSink, SessionEvents, TaskEvents, TransferEvent};
pub use host::{
    BackgroundTransferHost, ByteRange, HandleError, HandleEvent, RequestKind, TransferRequest,
};
pub use planner::{DEFAULT_PART_SIZE, MAX_PARTS, PartPlan, PartSizePolicy, UploadPart};
pub use session::{MultipartConfig, MultipartSession};
pub use store::{OrphanedTask, RecoveredTask, RecoveryReport, TransferStore};
pub use task::TransferTask;
